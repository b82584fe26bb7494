//! Model Store: trained cluster baselines, thresholds, and per-channel
//! normalization statistics.
//!
//! The store is populated once by the offline training side and read by every
//! scoring update. All parameters live in atomics so the model can be
//! installed while telemetry is already flowing; readers re-check
//! [`ModelStore::is_centroids_loaded`] on every update.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Number of feature channels tracked per request.
pub const N_CHANNELS: usize = 6;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML model: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON model: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model has {got} {kind}, engine is configured for {max} clusters")]
    TooManyClusters {
        kind: &'static str,
        got: usize,
        max: usize,
    },
    #[error("cluster index {index} out of range (k = {clusters})")]
    ClusterIndex { index: usize, clusters: usize },
    #[error("unknown feature channel: {0}")]
    UnknownChannel(String),
    #[error("model is already loaded")]
    AlreadyLoaded,
}

/// The six resource-usage feature channels, in training-column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureChannel {
    CpuTime,
    Malloc,
    PageFault,
    IdleTime,
    TcpSent,
    TcpReceived,
}

impl FeatureChannel {
    pub const ALL: [FeatureChannel; N_CHANNELS] = [
        FeatureChannel::CpuTime,
        FeatureChannel::Malloc,
        FeatureChannel::PageFault,
        FeatureChannel::IdleTime,
        FeatureChannel::TcpSent,
        FeatureChannel::TcpReceived,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureChannel::CpuTime => "cpu_time",
            FeatureChannel::Malloc => "malloc",
            FeatureChannel::PageFault => "page_fault",
            FeatureChannel::IdleTime => "idle_time",
            FeatureChannel::TcpSent => "tcp_sent",
            FeatureChannel::TcpReceived => "tcp_received",
        }
    }
}

impl fmt::Display for FeatureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureChannel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureChannel::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| ModelError::UnknownChannel(s.to_string()))
    }
}

/// Training-set mean and standard deviation of one channel, already scaled
/// into the engine's fixed-point domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: u64,
    pub std: u64,
}

/// Serialized form of a trained model, as produced by the training pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Global offset added to every cluster baseline.
    pub offset: i64,
    /// Per-cluster baseline magnitudes (centroid L1 norms).
    pub baselines: Vec<i64>,
    /// Per-cluster anomaly thresholds; 0 marks an untrained cluster.
    pub thresholds: Vec<u64>,
    /// Normalization statistics keyed by channel name.
    pub channels: BTreeMap<String, ChannelStats>,
}

impl ModelParams {
    /// Load a model from TOML, or JSON when the file ends in `.json`.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let params = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(params)
    }

    fn parsed_channels(&self) -> Result<Vec<(FeatureChannel, ChannelStats)>, ModelError> {
        self.channels
            .iter()
            .map(|(name, stats)| Ok((name.parse()?, *stats)))
            .collect()
    }
}

#[derive(Default)]
struct Baseline {
    value: AtomicI64,
    present: AtomicBool,
}

#[derive(Default)]
struct ChannelSlot {
    mean: AtomicU64,
    std: AtomicU64,
    present: AtomicBool,
}

pub struct ModelStore {
    baselines: Box<[Baseline]>,
    thresholds: Box<[AtomicU64]>,
    offset: AtomicI64,
    channels: [ChannelSlot; N_CHANNELS],
}

impl ModelStore {
    /// An empty store for `clusters` clusters. Nothing is trained yet.
    pub fn new(clusters: usize) -> Self {
        Self {
            baselines: (0..clusters).map(|_| Baseline::default()).collect(),
            thresholds: (0..clusters).map(|_| AtomicU64::new(0)).collect(),
            offset: AtomicI64::new(0),
            channels: Default::default(),
        }
    }

    pub fn clusters(&self) -> usize {
        self.baselines.len()
    }

    /// Gate for all scoring work: cluster 0 has a nonzero baseline.
    pub fn is_centroids_loaded(&self) -> bool {
        matches!(self.baseline(0), Some(v) if v != 0)
    }

    pub fn baseline(&self, cluster: usize) -> Option<i64> {
        let slot = self.baselines.get(cluster)?;
        slot.present
            .load(Ordering::Acquire)
            .then(|| slot.value.load(Ordering::Relaxed))
    }

    /// Trained threshold for `cluster`; 0 means untrained.
    pub fn threshold(&self, cluster: usize) -> u64 {
        self.thresholds
            .get(cluster)
            .map_or(0, |t| t.load(Ordering::Acquire))
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn channel_stats(&self, channel: FeatureChannel) -> Option<ChannelStats> {
        let slot = &self.channels[channel.index()];
        slot.present.load(Ordering::Acquire).then(|| ChannelStats {
            mean: slot.mean.load(Ordering::Relaxed),
            std: slot.std.load(Ordering::Relaxed),
        })
    }

    pub fn set_baseline(&self, cluster: usize, value: i64) -> Result<(), ModelError> {
        let slot = self.baselines.get(cluster).ok_or(ModelError::ClusterIndex {
            index: cluster,
            clusters: self.clusters(),
        })?;
        slot.value.store(value, Ordering::Relaxed);
        slot.present.store(true, Ordering::Release);
        Ok(())
    }

    pub fn set_threshold(&self, cluster: usize, value: u64) -> Result<(), ModelError> {
        let slot = self.thresholds.get(cluster).ok_or(ModelError::ClusterIndex {
            index: cluster,
            clusters: self.clusters(),
        })?;
        slot.store(value, Ordering::Release);
        Ok(())
    }

    pub fn set_offset(&self, value: i64) {
        self.offset.store(value, Ordering::Release);
    }

    pub fn set_channel_stats(&self, channel: FeatureChannel, stats: ChannelStats) {
        let slot = &self.channels[channel.index()];
        slot.mean.store(stats.mean, Ordering::Relaxed);
        slot.std.store(stats.std, Ordering::Relaxed);
        slot.present.store(true, Ordering::Release);
    }

    /// Install a complete model.
    ///
    /// Everything is validated before the first write. Cluster 0's baseline
    /// is written last so that `is_centroids_loaded` only flips once the
    /// rest of the model is visible.
    pub fn install(&self, params: &ModelParams) -> Result<(), ModelError> {
        if self.is_centroids_loaded() {
            return Err(ModelError::AlreadyLoaded);
        }
        let k = self.clusters();
        if params.baselines.len() > k {
            return Err(ModelError::TooManyClusters {
                kind: "baselines",
                got: params.baselines.len(),
                max: k,
            });
        }
        if params.thresholds.len() > k {
            return Err(ModelError::TooManyClusters {
                kind: "thresholds",
                got: params.thresholds.len(),
                max: k,
            });
        }
        let channels = params.parsed_channels()?;

        for (channel, stats) in channels {
            self.set_channel_stats(channel, stats);
        }
        for (cluster, threshold) in params.thresholds.iter().enumerate() {
            self.set_threshold(cluster, *threshold)?;
        }
        self.set_offset(params.offset);
        for (cluster, baseline) in params.baselines.iter().enumerate().skip(1) {
            self.set_baseline(cluster, *baseline)?;
        }
        if let Some(first) = params.baselines.first() {
            self.set_baseline(0, *first)?;
        }

        info!(
            clusters = params.baselines.len(),
            channels = params.channels.len(),
            offset = params.offset,
            loaded = self.is_centroids_loaded(),
            "installed cluster model"
        );
        Ok(())
    }

    /// Current contents as a serializable parameter set.
    pub fn snapshot(&self) -> ModelParams {
        let trained = (0..self.clusters())
            .rev()
            .find(|&k| self.baseline(k).is_some())
            .map_or(0, |k| k + 1);
        ModelParams {
            offset: self.offset(),
            baselines: (0..trained).map(|k| self.baseline(k).unwrap_or(0)).collect(),
            thresholds: (0..self.clusters()).map(|k| self.threshold(k)).collect(),
            channels: FeatureChannel::ALL
                .into_iter()
                .filter_map(|c| Some((c.name().to_string(), self.channel_stats(c)?)))
                .collect(),
        }
    }
}
