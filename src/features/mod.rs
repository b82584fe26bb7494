//! Feature Accumulator: per-request running totals for the six channels.
//!
//! Every update lazily creates the request's record, adds to the matching
//! total with an atomic add, and, once a model is loaded, forwards the
//! normalized delta to the outlier scorer.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::detect::normalize::Normalizer;
use crate::detect::score::OutlierScorer;
use crate::identity::{RequestId, RequestLedger};
use crate::model::{FeatureChannel, ModelStore};
use crate::table::SlotTable;

#[derive(Default)]
pub struct RequestRecord {
    first_seen_ts: AtomicU64,
    latest_update_ts: AtomicU64,
    cpu_time: AtomicU64,
    cpu_updates: AtomicU32,
    page_faults: AtomicU64,
    malloc_total: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    idle_time: AtomicU64,
    last_recv_ts: AtomicU64,
    peer_addr: AtomicU32,
}

impl RequestRecord {
    pub fn cpu_time(&self) -> u64 {
        self.cpu_time.load(Ordering::Relaxed)
    }

    fn snapshot(&self, id: RequestId) -> RequestSnapshot {
        let peer = self.peer_addr.load(Ordering::Relaxed);
        RequestSnapshot {
            id,
            first_seen_ts: self.first_seen_ts.load(Ordering::Relaxed),
            latest_update_ts: self.latest_update_ts.load(Ordering::Relaxed),
            cpu_time: self.cpu_time.load(Ordering::Relaxed),
            cpu_updates: self.cpu_updates.load(Ordering::Relaxed),
            page_faults: self.page_faults.load(Ordering::Relaxed),
            malloc_total: self.malloc_total.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            idle_time: self.idle_time.load(Ordering::Relaxed),
            last_recv_ts: self.last_recv_ts.load(Ordering::Relaxed),
            peer_addr: (peer != 0).then(|| Ipv4Addr::from(peer)),
        }
    }
}

/// Point-in-time copy of a request's totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub first_seen_ts: u64,
    pub latest_update_ts: u64,
    pub cpu_time: u64,
    pub cpu_updates: u32,
    pub page_faults: u64,
    pub malloc_total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub idle_time: u64,
    pub last_recv_ts: u64,
    pub peer_addr: Option<Ipv4Addr>,
}

pub struct FeatureAccumulator {
    requests: SlotTable<RequestRecord>,
    model: Arc<ModelStore>,
    normalizer: Normalizer,
    scorer: OutlierScorer,
    idle_cutoff_ns: u64,
    idle_override_delta: i64,
    rejected: AtomicU64,
    clock_discards: AtomicU64,
}

impl FeatureAccumulator {
    pub fn new(
        capacity: usize,
        model: Arc<ModelStore>,
        normalizer: Normalizer,
        idle_cutoff_ns: u64,
        idle_override_delta: i64,
    ) -> Self {
        let scorer = OutlierScorer::new(capacity, Arc::clone(&model));
        Self {
            requests: SlotTable::with_capacity("requests", capacity),
            model,
            normalizer,
            scorer,
            idle_cutoff_ns,
            idle_override_delta,
            rejected: AtomicU64::new(0),
            clock_discards: AtomicU64::new(0),
        }
    }

    pub fn scorer(&self) -> &OutlierScorer {
        &self.scorer
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Look up or create the record for `id`, stamping timestamps.
    fn record(&self, id: RequestId, now: u64) -> Option<&RequestRecord> {
        if id == 0 {
            return None;
        }
        match self.requests.get_or_insert(u64::from(id)) {
            Ok(entry) => {
                if entry.inserted {
                    entry.value.first_seen_ts.store(now, Ordering::Relaxed);
                }
                entry.value.latest_update_ts.store(now, Ordering::Relaxed);
                Some(entry.value)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = id, error = %e, "dropping request update");
                None
            }
        }
    }

    /// Normalize `raw` for `channel` and feed it to the scorer, if a model is loaded.
    fn forward(&self, id: RequestId, record: &RequestRecord, channel: FeatureChannel, raw: u64, now: u64) {
        if !self.model.is_centroids_loaded() {
            return;
        }
        let raw = i64::try_from(raw).unwrap_or(i64::MAX);
        let delta = self.normalizer.normalize(raw, channel, &self.model);
        self.scorer.update(id, delta, now, record.cpu_time());
    }

    /// Add the CPU interval `[started_at, now]` to `id`.
    ///
    /// Returns false when there is no start, the clock went backwards, or the
    /// record could not be created.
    pub fn flush_cpu_time(&self, id: RequestId, started_at: Option<u64>, now: u64) -> bool {
        let Some(start) = started_at else {
            return false;
        };
        let Some(delta) = now.checked_sub(start) else {
            self.clock_discards.fetch_add(1, Ordering::Relaxed);
            trace!(request_id = id, start, now, "discarding cpu interval, clock moved backwards");
            return false;
        };
        let Some(record) = self.record(id, now) else {
            return false;
        };
        record.cpu_updates.fetch_add(1, Ordering::Relaxed);
        record.cpu_time.fetch_add(delta, Ordering::Relaxed);
        self.forward(id, record, FeatureChannel::CpuTime, delta, now);
        true
    }

    pub fn record_page_fault(&self, id: RequestId, now: u64) {
        let Some(record) = self.record(id, now) else {
            return;
        };
        record.page_faults.fetch_add(1, Ordering::Relaxed);
        self.forward(id, record, FeatureChannel::PageFault, 1, now);
    }

    /// Allocation and reallocation growth.
    pub fn record_malloc(&self, id: RequestId, size: u64, now: u64) {
        let Some(record) = self.record(id, now) else {
            return;
        };
        record.malloc_total.fetch_add(size, Ordering::Relaxed);
        self.forward(id, record, FeatureChannel::Malloc, size, now);
    }

    pub fn record_tcp_sent(&self, id: RequestId, size: u64, now: u64) {
        let Some(record) = self.record(id, now) else {
            return;
        };
        record.bytes_sent.fetch_add(size, Ordering::Relaxed);
        self.forward(id, record, FeatureChannel::TcpSent, size, now);
    }

    /// A receive of `size` bytes from `peer`. Non-positive sizes are ignored.
    pub fn record_tcp_received(&self, id: RequestId, size: i64, peer: Ipv4Addr, now: u64) {
        let Ok(size) = u64::try_from(size) else {
            return;
        };
        if size == 0 {
            return;
        }
        let Some(record) = self.record(id, now) else {
            return;
        };
        record.bytes_received.fetch_add(size, Ordering::Relaxed);

        let previous = record.last_recv_ts.swap(now, Ordering::Relaxed);
        let mut idle = 0;
        if previous != 0 {
            match now.checked_sub(previous) {
                Some(gap) => {
                    idle = gap;
                    record.idle_time.fetch_add(gap, Ordering::Relaxed);
                }
                None => {
                    self.clock_discards.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let peer = u32::from(peer);
        if peer != 0 {
            let _ = record
                .peer_addr
                .compare_exchange(0, peer, Ordering::Relaxed, Ordering::Relaxed);
        }

        if !self.model.is_centroids_loaded() {
            return;
        }
        if idle > self.idle_cutoff_ns {
            // Gaps this long come from clock artifacts; force the request over threshold.
            debug!(request_id = id, idle_ns = idle, "idle gap above cutoff, forcing outlier delta");
            self.scorer
                .update(id, self.idle_override_delta, now, record.cpu_time());
        } else if idle != 0 {
            self.forward(id, record, FeatureChannel::IdleTime, idle, now);
        }
        self.forward(id, record, FeatureChannel::TcpReceived, size, now);
    }

    pub fn snapshot(&self, id: RequestId) -> Option<RequestSnapshot> {
        self.requests
            .get(u64::from(id))
            .map(|entry| entry.value.snapshot(id))
    }

    /// All live requests, in arena order.
    pub fn snapshots(&self) -> impl Iterator<Item = RequestSnapshot> + '_ {
        self.requests
            .iter()
            .map(|(key, _, record)| record.snapshot(key as RequestId))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed) + self.scorer.rejected()
    }

    pub fn clock_discards(&self) -> u64 {
        self.clock_discards.load(Ordering::Relaxed)
    }
}

impl RequestLedger for FeatureAccumulator {
    fn touch(&self, id: RequestId, now: u64) -> bool {
        self.record(id, now).is_some()
    }

    fn flush_cpu_time(&self, id: RequestId, started_at: Option<u64>, now: u64) -> bool {
        FeatureAccumulator::flush_cpu_time(self, id, started_at, now)
    }
}
