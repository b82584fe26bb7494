//! Fixed-point normalization of raw feature deltas.

use crate::config::{ConfigError, EngineConfig};
use crate::model::{FeatureChannel, ModelStore};

/// Scales raw deltas into the unit-variance fixed-point domain the model was
/// trained in: `raw * scale / std`, truncated toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    scale: i64,
    default_std: u64,
}

impl Normalizer {
    pub fn new(scale: i64, default_std: u64) -> Self {
        Self {
            scale,
            default_std: default_std.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.scale_factor()?, config.default_std))
    }

    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// Normalize `raw` for `channel`.
    ///
    /// Returns 0 for a zero delta or when the channel has no trained
    /// statistics. A trained standard deviation of 0 is replaced by the
    /// configured default.
    pub fn normalize(&self, raw: i64, channel: FeatureChannel, model: &ModelStore) -> i64 {
        if raw == 0 {
            return 0;
        }
        let Some(stats) = model.channel_stats(channel) else {
            return 0;
        };
        let std = if stats.std == 0 { self.default_std } else { stats.std };
        divide_magnitude(raw.saturating_mul(self.scale), std)
    }
}

/// Divide the magnitude of `value` by `divisor` and restore the sign, so
/// truncation is toward zero for either sign.
fn divide_magnitude(value: i64, divisor: u64) -> i64 {
    let quotient = value.unsigned_abs() / divisor;
    let quotient = i64::try_from(quotient).unwrap_or(i64::MAX);
    if value < 0 {
        -quotient
    } else {
        quotient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelStats;

    fn model_with(channel: FeatureChannel, std: u64) -> ModelStore {
        let model = ModelStore::new(1);
        model.set_channel_stats(channel, ChannelStats { mean: 0, std });
        model
    }

    #[test]
    fn test_zero_is_always_zero() {
        let n = Normalizer::new(1_000, 10_000);
        let empty = ModelStore::new(1);
        let trained = model_with(FeatureChannel::Malloc, 3);
        for channel in FeatureChannel::ALL {
            assert_eq!(n.normalize(0, channel, &empty), 0);
            assert_eq!(n.normalize(0, channel, &trained), 0);
        }
    }

    #[test]
    fn test_untrained_channel_yields_zero() {
        let n = Normalizer::new(1_000, 10_000);
        let model = model_with(FeatureChannel::Malloc, 512);
        assert_eq!(n.normalize(77, FeatureChannel::TcpSent, &model), 0);
    }

    #[test]
    fn test_scaled_integer_division() {
        let scale = 10_000_000_000;
        let n = Normalizer::new(scale, 10_000);
        let model = model_with(FeatureChannel::Malloc, 512);
        assert_eq!(
            n.normalize(1_024, FeatureChannel::Malloc, &model),
            (1_024 * scale) / 512
        );
    }

    #[test]
    fn test_zero_std_uses_default() {
        let n = Normalizer::new(100, 10_000);
        let model = model_with(FeatureChannel::PageFault, 0);
        assert_eq!(n.normalize(1_000, FeatureChannel::PageFault, &model), 10);
    }

    #[test]
    fn test_magnitude_symmetry() {
        let n = Normalizer::new(1_000, 10_000);
        let model = model_with(FeatureChannel::IdleTime, 7);
        for x in [1i64, 3, 6, 7, 8, 13, 999_983, i64::MAX / 2, i64::MAX] {
            assert_eq!(
                n.normalize(-x, FeatureChannel::IdleTime, &model),
                -n.normalize(x, FeatureChannel::IdleTime, &model),
                "x = {x}"
            );
        }
        // Truncation toward zero: -1000 / 7 = -142, not -143.
        assert_eq!(n.normalize(-1, FeatureChannel::IdleTime, &model), -142);
    }

    #[test]
    fn test_from_config_rejects_overflowing_scale() {
        let cfg = EngineConfig {
            m_scale: 40,
            ..EngineConfig::default()
        };
        assert!(Normalizer::from_config(&cfg).is_err());
        let ok = Normalizer::from_config(&EngineConfig::default()).unwrap();
        assert_eq!(ok.scale(), 10_000_000_000);
    }
}
