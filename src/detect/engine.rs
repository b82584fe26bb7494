//! The detection engine: one entry point for every telemetry event.
//!
//! Events are resolved to a request through the identity tables, folded into
//! the request's feature totals, and scored once a model is installed. The
//! engine never returns errors to the event source; what it drops is counted
//! in [`EngineStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{BindingConfig, ConfigError, DetectorConfig, RebindPolicy};
use crate::detect::normalize::Normalizer;
use crate::detect::score::ScoreSnapshot;
use crate::features::{FeatureAccumulator, RequestSnapshot};
use crate::identity::{Handle, IdentityResolver, RequestId};
use crate::model::ModelStore;
use crate::telemetry::{BindEntry, EventKind, TelemetryEvent};

/// Counters describing what the engine has done with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub events: u64,
    pub requests: usize,
    pub associations: usize,
    pub scored: usize,
    pub table_rejections: u64,
    pub clock_discards: u64,
    pub parse_errors: u64,
    pub model_loaded: bool,
}

/// A request's totals together with its score, if it has been scored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestView {
    pub request: RequestSnapshot,
    pub score: Option<ScoreSnapshot>,
}

/// The online detector: identity resolution, accumulation, and scoring
/// behind one event entry point.
pub struct Engine {
    binding: BindingConfig,
    model: Arc<ModelStore>,
    resolver: IdentityResolver,
    features: FeatureAccumulator,
    events: AtomicU64,
    parse_errors: AtomicU64,
}

impl Engine {
    pub fn new(config: &DetectorConfig) -> Result<Self, ConfigError> {
        let engine = &config.engine;
        let normalizer = Normalizer::from_config(engine)?;
        let model = Arc::new(ModelStore::new(engine.clusters));
        let features = FeatureAccumulator::new(
            engine.request_capacity,
            Arc::clone(&model),
            normalizer,
            engine.idle_cutoff_ns,
            engine.idle_override_delta,
        );
        info!(
            clusters = engine.clusters,
            request_capacity = engine.request_capacity,
            thread_capacity = engine.thread_capacity,
            scale = normalizer.scale(),
            "detection engine ready"
        );
        Ok(Self {
            binding: config.binding,
            model,
            resolver: IdentityResolver::new(engine.request_capacity, engine.thread_capacity),
            features,
            events: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &Arc<ModelStore> {
        &self.model
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn features(&self) -> &FeatureAccumulator {
        &self.features
    }

    fn policy(&self, entry: BindEntry) -> RebindPolicy {
        match entry {
            BindEntry::Handoff => self.binding.handoff,
            BindEntry::Connection => self.binding.connection,
        }
    }

    /// Apply one event. Never fails: events that cannot be attributed to a
    /// request are dropped.
    pub fn apply(&self, event: &TelemetryEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
        let (tid, now) = (event.tid, event.ts);
        let resolver = &self.resolver;
        let ledger = &self.features;

        match event.kind {
            EventKind::NewRequest { handle } => {
                resolver.new_request(handle, now, ledger);
            }
            EventKind::Associate { handle, request_id } => {
                resolver.associate(handle, request_id, now, ledger);
            }
            EventKind::PropagateHandle { handle } => {
                resolver.propagate(tid, handle, now, ledger);
            }
            EventKind::PropagateAndRelease { handle } => {
                resolver.propagate_and_release(tid, handle, now, ledger);
            }
            EventKind::BindHandle { handle, entry } => {
                resolver.bind_via_handle(tid, handle, self.policy(entry), now, ledger);
            }
            EventKind::BindDirect { request_id } => {
                resolver.bind_direct(tid, request_id, now, ledger);
            }
            EventKind::BindAndFlush { request_id } => {
                resolver.bind_and_flush(tid, request_id, now, ledger);
            }
            EventKind::Unbind => {
                resolver.unbind(tid, now, ledger);
            }
            EventKind::CpuCheckpoint => {
                resolver.checkpoint(tid, now, ledger);
            }
            EventKind::ContextSwitch { prev_tid } => {
                resolver.context_switch(prev_tid, tid, now, ledger);
            }
            EventKind::PageFault => {
                if let Some(id) = self.bound_request(tid) {
                    self.features.record_page_fault(id, now);
                }
            }
            EventKind::Malloc { size } => {
                if let Some(id) = self.bound_request(tid) {
                    self.features.record_malloc(id, size, now);
                }
            }
            EventKind::TcpSent { size } => {
                if let Some(id) = self.bound_request(tid) {
                    self.features.record_tcp_sent(id, size, now);
                }
            }
            EventKind::TcpReceived { size, peer } => {
                if size <= 0 {
                    return;
                }
                if let Some(id) = self.bound_request(tid) {
                    self.features.record_tcp_received(id, size, peer, now);
                }
            }
        }
    }

    fn bound_request(&self, tid: u32) -> Option<RequestId> {
        self.resolver.binding(tid).map(|b| b.request)
    }

    pub fn note_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request(&self, id: RequestId) -> Option<RequestView> {
        Some(RequestView {
            request: self.features.snapshot(id)?,
            score: self.features.scorer().snapshot(id),
        })
    }

    pub fn request_for_handle(&self, handle: Handle) -> Option<RequestView> {
        self.request(self.resolver.resolve_handle(handle)?)
    }

    pub fn outliers(&self) -> Vec<ScoreSnapshot> {
        let mut outliers = self.features.scorer().outliers();
        outliers.sort_unstable_by_key(|o| o.id);
        outliers
    }

    /// Every live request with its score, ordered by id.
    pub fn report(&self) -> Vec<RequestView> {
        let scorer = self.features.scorer();
        let mut views: Vec<RequestView> = self
            .features
            .snapshots()
            .map(|request| RequestView {
                score: scorer.snapshot(request.id),
                request,
            })
            .collect();
        views.sort_unstable_by_key(|v| v.request.id);
        views
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            events: self.events.load(Ordering::Relaxed),
            requests: self.features.len(),
            associations: self.resolver.association_count(),
            scored: self.features.scorer().len(),
            table_rejections: self.features.rejected() + self.resolver.rejected(),
            clock_discards: self.features.clock_discards(),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            model_loaded: self.model.is_centroids_loaded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Engine {
        let config = DetectorConfig {
            engine: EngineConfig {
                clusters: 2,
                request_capacity: 32,
                thread_capacity: 8,
                ..EngineConfig::default()
            },
            ..DetectorConfig::default()
        };
        Engine::new(&config).unwrap()
    }

    fn ev(tid: u32, ts: u64, kind: EventKind) -> TelemetryEvent {
        TelemetryEvent::new(tid, ts, kind)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = DetectorConfig {
            engine: EngineConfig {
                clusters: 0,
                ..EngineConfig::default()
            },
            ..DetectorConfig::default()
        };
        assert!(matches!(Engine::new(&config), Err(ConfigError::NoClusters)));
    }

    #[test]
    fn test_events_on_unbound_thread_are_dropped() {
        let e = engine();
        e.apply(&ev(1, 10, EventKind::Malloc { size: 100 }));
        e.apply(&ev(1, 11, EventKind::PageFault));
        e.apply(&ev(1, 12, EventKind::Unbind));
        let stats = e.stats();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.requests, 0);
    }

    #[test]
    fn test_handle_entry_points_follow_binding_config() {
        let e = engine();
        e.apply(&ev(1, 1, EventKind::NewRequest { handle: 10 }));
        e.apply(&ev(1, 2, EventKind::NewRequest { handle: 20 }));

        e.apply(&ev(5, 3, EventKind::BindHandle { handle: 10, entry: BindEntry::Handoff }));
        e.apply(&ev(5, 4, EventKind::BindHandle { handle: 20, entry: BindEntry::Handoff }));
        assert_eq!(e.resolver().binding(5).unwrap().request, 1);

        e.apply(&ev(5, 5, EventKind::BindHandle { handle: 20, entry: BindEntry::Connection }));
        assert_eq!(e.resolver().binding(5).unwrap().request, 2);
    }

    #[test]
    fn test_propagate_and_release_moves_request_to_handle() {
        let e = engine();
        e.apply(&ev(1, 100, EventKind::BindDirect { request_id: 9 }));
        e.apply(&ev(1, 160, EventKind::PropagateAndRelease { handle: 77 }));
        assert!(e.resolver().binding(1).is_none());
        assert_eq!(e.resolver().resolve_handle(77), Some(9));

        let view = e.request_for_handle(77).unwrap();
        assert_eq!(view.request.cpu_time, 60);
        assert_eq!(view.score, None);

        e.apply(&ev(2, 200, EventKind::BindHandle { handle: 77, entry: BindEntry::Handoff }));
        e.apply(&ev(2, 230, EventKind::Unbind));
        assert_eq!(e.request(9).unwrap().request.cpu_time, 90);
        assert_eq!(e.request(9).unwrap().request.cpu_updates, 2);
    }

    #[test]
    fn test_negative_receive_is_rejected_before_lookup() {
        let e = engine();
        e.apply(&ev(1, 1, EventKind::BindDirect { request_id: 3 }));
        e.apply(&ev(
            1,
            5,
            EventKind::TcpReceived {
                size: -1,
                peer: std::net::Ipv4Addr::LOCALHOST,
            },
        ));
        let request = e.request(3).unwrap().request;
        assert_eq!(request.bytes_received, 0);
        assert_eq!(request.latest_update_ts, 1);
    }

    #[test]
    fn test_report_is_sorted_by_id() {
        let e = engine();
        for id in [5u32, 2, 9] {
            e.apply(&ev(id, 1, EventKind::BindAndFlush { request_id: id }));
        }
        let ids: Vec<RequestId> = e.report().iter().map(|v| v.request.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(e.resolver().binding(5).is_none());
    }
}
