//! Outlier Scorer: per-request drift against every trained cluster.
//!
//! Each request carries one signed drift per cluster, seeded at
//! `-(baseline[k] + offset)`. Every normalized delta is added to all K drifts
//! alike (a one-dimensional projection of the distance to each centroid),
//! and the request is an outlier when the drift closest to zero among the
//! trained clusters is positive and above that cluster's threshold.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::identity::RequestId;
use crate::model::ModelStore;
use crate::table::SlotTable;

#[derive(Default)]
struct ScoreHeader {
    is_outlier: AtomicBool,
    detected: AtomicBool,
    detection_ts: AtomicU64,
    detection_cpu_time: AtomicU64,
    last_ts: AtomicU64,
}

/// First-detection state. Moves from `Never` to `Detected` once and stays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Detection {
    Never,
    Detected { ts: u64, cpu_time: u64 },
}

/// The trained cluster whose drift is closest to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nearest {
    pub cluster: usize,
    pub drift: i64,
    pub threshold: u64,
}

impl Nearest {
    pub fn exceeds_threshold(&self) -> bool {
        u64::try_from(self.drift).is_ok_and(|d| d > 0 && d > self.threshold)
    }
}

/// Outcome of a single score update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub is_outlier: bool,
    pub nearest: Option<Nearest>,
    /// This update set the first-detection timestamp.
    pub newly_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub id: RequestId,
    pub drifts: Vec<i64>,
    pub is_outlier: bool,
    pub detection: Detection,
    pub last_ts: u64,
    pub nearest: Option<Nearest>,
}

pub struct OutlierScorer {
    clusters: usize,
    headers: SlotTable<ScoreHeader>,
    drifts: Box<[AtomicI64]>,
    model: Arc<ModelStore>,
    rejected: AtomicU64,
}

impl OutlierScorer {
    pub fn new(capacity: usize, model: Arc<ModelStore>) -> Self {
        let clusters = model.clusters();
        let headers = SlotTable::with_capacity("scores", capacity);
        let drifts = (0..headers.arena_len() * clusters)
            .map(|_| AtomicI64::new(0))
            .collect();
        Self {
            clusters,
            headers,
            drifts,
            model,
            rejected: AtomicU64::new(0),
        }
    }

    fn drift_slots(&self, index: usize) -> &[AtomicI64] {
        &self.drifts[index * self.clusters..(index + 1) * self.clusters]
    }

    /// Seed a fresh record's drifts. Uses adds rather than stores so a
    /// concurrent first update racing the seed is not lost.
    fn seed(&self, slots: &[AtomicI64]) {
        let offset = self.model.offset();
        for (cluster, slot) in slots.iter().enumerate() {
            if let Some(baseline) = self.model.baseline(cluster) {
                slot.fetch_add(baseline.wrapping_add(offset).wrapping_neg(), Ordering::AcqRel);
            }
        }
    }

    fn nearest(&self, drifts: impl Iterator<Item = (usize, i64)>) -> Option<Nearest> {
        let mut nearest: Option<Nearest> = None;
        for (cluster, drift) in drifts {
            let threshold = self.model.threshold(cluster);
            if threshold == 0 {
                continue;
            }
            if nearest.map_or(true, |n| drift.unsigned_abs() < n.drift.unsigned_abs()) {
                nearest = Some(Nearest {
                    cluster,
                    drift,
                    threshold,
                });
            }
        }
        nearest
    }

    /// Apply `delta` to every cluster drift of `id` and re-decide the flag.
    ///
    /// Returns `None` only when the score table is full.
    pub fn update(&self, id: RequestId, delta: i64, now: u64, cpu_time: u64) -> Option<Verdict> {
        let entry = match self.headers.get_or_insert(u64::from(id)) {
            Ok(entry) => entry,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = id, error = %e, "dropping score update");
                return None;
            }
        };
        let slots = self.drift_slots(entry.index);
        if entry.inserted {
            self.seed(slots);
        }

        let nearest = self.nearest(slots.iter().enumerate().map(|(cluster, slot)| {
            (cluster, slot.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta))
        }));
        let is_outlier = nearest.is_some_and(|n| n.exceeds_threshold());

        let header = entry.value;
        header.is_outlier.store(is_outlier, Ordering::Release);
        let newly_detected = is_outlier
            && header
                .detected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if newly_detected {
            header.detection_ts.store(now, Ordering::Release);
            header.detection_cpu_time.store(cpu_time, Ordering::Release);
            debug!(request_id = id, ts = now, cpu_time, nearest = ?nearest, "request flagged as outlier");
        }
        header.last_ts.store(now, Ordering::Release);

        trace!(request_id = id, delta, is_outlier, "score updated");
        Some(Verdict {
            is_outlier,
            nearest,
            newly_detected,
        })
    }

    pub fn is_outlier(&self, id: RequestId) -> bool {
        self.headers
            .get(u64::from(id))
            .is_some_and(|e| e.value.is_outlier.load(Ordering::Acquire))
    }

    fn snapshot_at(&self, id: RequestId, index: usize, header: &ScoreHeader) -> ScoreSnapshot {
        let drifts: Vec<i64> = self
            .drift_slots(index)
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect();
        let detection = if header.detected.load(Ordering::Acquire) {
            Detection::Detected {
                ts: header.detection_ts.load(Ordering::Acquire),
                cpu_time: header.detection_cpu_time.load(Ordering::Acquire),
            }
        } else {
            Detection::Never
        };
        ScoreSnapshot {
            id,
            nearest: self.nearest(drifts.iter().copied().enumerate()),
            drifts,
            is_outlier: header.is_outlier.load(Ordering::Acquire),
            detection,
            last_ts: header.last_ts.load(Ordering::Acquire),
        }
    }

    pub fn snapshot(&self, id: RequestId) -> Option<ScoreSnapshot> {
        let entry = self.headers.get(u64::from(id))?;
        Some(self.snapshot_at(id, entry.index, entry.value))
    }

    /// Requests whose current flag is set.
    pub fn outliers(&self) -> Vec<ScoreSnapshot> {
        self.headers
            .iter()
            .filter(|(_, _, header)| header.is_outlier.load(Ordering::Acquire))
            .map(|(key, index, header)| self.snapshot_at(key as RequestId, index, header))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
