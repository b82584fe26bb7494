//! TOML configuration for the reqdrift engine and service.
//!
//! Layered the usual way: an explicit path, then the `REQDRIFT_CONFIG`
//! environment variable, then the system location, then compiled-in
//! defaults. Every section is `#[serde(default)]`, so a partial file only
//! overrides what it names.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "REQDRIFT_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/reqdrift/reqdrift.toml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("engine.clusters must be at least 1")]
    NoClusters,
    #[error("engine.{0} must be at least 1")]
    ZeroCapacity(&'static str),
    #[error("engine.m_scale = {m_scale} overflows a 64-bit multiplier for {method:?} scaling")]
    ScaleOverflow { method: ScaleMethod, m_scale: u32 },
    #[error("engine.default_std must be nonzero")]
    ZeroDefaultStd,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub binding: BindingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DetectorConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .engine
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded detector configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit`, when given (errors are fatal).
    /// 2. The path in `REQDRIFT_CONFIG`.
    /// 3. `/etc/reqdrift/reqdrift.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "REQDRIFT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// How raw deltas are magnified before integer division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    /// Multiply by `10^m_scale`.
    Exponent,
    /// Multiply by `2^m_scale`.
    Bitshift,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of trained clusters (K).
    pub clusters: usize,
    /// Live entries in the request, association, and score tables.
    pub request_capacity: usize,
    /// Live entries in the thread binding table.
    pub thread_capacity: usize,
    pub scale_method: ScaleMethod,
    pub m_scale: u32,
    /// Substituted for a trained standard deviation of 0.
    pub default_std: u64,
    /// Receive gaps above this are forwarded as `idle_override_delta`.
    pub idle_cutoff_ns: u64,
    pub idle_override_delta: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clusters: 8,
            request_capacity: 4_194_304,
            thread_capacity: 10_240,
            scale_method: ScaleMethod::Exponent,
            m_scale: 10,
            default_std: 10_000,
            idle_cutoff_ns: 1_000_000_000,
            idle_override_delta: 1_000_000_000_000_000,
        }
    }
}

impl EngineConfig {
    /// Fixed-point multiplier applied to every raw delta.
    pub fn scale_factor(&self) -> Result<i64, ConfigError> {
        let overflow = ConfigError::ScaleOverflow {
            method: self.scale_method,
            m_scale: self.m_scale,
        };
        match self.scale_method {
            ScaleMethod::Exponent => 10i64.checked_pow(self.m_scale).ok_or(overflow),
            ScaleMethod::Bitshift => 2i64.checked_pow(self.m_scale).ok_or(overflow),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters == 0 {
            return Err(ConfigError::NoClusters);
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("request_capacity"));
        }
        if self.thread_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("thread_capacity"));
        }
        if self.default_std == 0 {
            return Err(ConfigError::ZeroDefaultStd);
        }
        self.scale_factor().map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// What a handle bind does when the thread already serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebindPolicy {
    /// First writer wins; the existing binding is left untouched.
    KeepExisting,
    /// The binding is replaced and the interval restarts.
    Overwrite,
}

/// Rebind policy per handle-bind entry point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Worker threads picking up a handed-off handle.
    pub handoff: RebindPolicy,
    /// Connection-processing threads.
    pub connection: RebindPolicy,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            handoff: RebindPolicy::KeepExisting,
            connection: RebindPolicy::Overwrite,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7878".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = DetectorConfig::default();

        assert_eq!(cfg.engine.clusters, 8);
        assert_eq!(cfg.engine.request_capacity, 4_194_304);
        assert_eq!(cfg.engine.thread_capacity, 10_240);
        assert_eq!(cfg.engine.scale_method, ScaleMethod::Exponent);
        assert_eq!(cfg.engine.m_scale, 10);
        assert_eq!(cfg.engine.default_std, 10_000);
        assert_eq!(cfg.engine.idle_cutoff_ns, 1_000_000_000);
        assert_eq!(cfg.engine.idle_override_delta, 1_000_000_000_000_000);
        assert_eq!(cfg.engine.scale_factor(), Ok(10_000_000_000));
        assert!(cfg.engine.validate().is_ok());

        assert_eq!(cfg.binding.handoff, RebindPolicy::KeepExisting);
        assert_eq!(cfg.binding.connection, RebindPolicy::Overwrite);

        assert_eq!(cfg.api.listen_address, "127.0.0.1:7878");
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_bitshift_scale_factor() {
        let engine = EngineConfig {
            scale_method: ScaleMethod::Bitshift,
            m_scale: 12,
            ..EngineConfig::default()
        };
        assert_eq!(engine.scale_factor(), Ok(4096));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = EngineConfig::default();
        let cases = [
            (
                EngineConfig { clusters: 0, ..base.clone() },
                ConfigError::NoClusters,
            ),
            (
                EngineConfig { request_capacity: 0, ..base.clone() },
                ConfigError::ZeroCapacity("request_capacity"),
            ),
            (
                EngineConfig { thread_capacity: 0, ..base.clone() },
                ConfigError::ZeroCapacity("thread_capacity"),
            ),
            (
                EngineConfig { default_std: 0, ..base.clone() },
                ConfigError::ZeroDefaultStd,
            ),
            (
                EngineConfig { m_scale: 19, ..base.clone() },
                ConfigError::ScaleOverflow {
                    method: ScaleMethod::Exponent,
                    m_scale: 19,
                },
            ),
        ];
        for (engine, expected) in cases {
            assert_eq!(engine.validate(), Err(expected));
        }
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reqdrift.toml");
        std::fs::write(
            &path,
            r#"
[engine]
clusters = 3
scale_method = "bitshift"
m_scale = 8

[binding]
handoff = "overwrite"
"#,
        )
        .unwrap();

        let cfg = DetectorConfig::load(&path).unwrap();
        assert_eq!(cfg.engine.clusters, 3);
        assert_eq!(cfg.engine.scale_factor(), Ok(256));
        assert_eq!(cfg.engine.request_capacity, 4_194_304);
        assert_eq!(cfg.binding.handoff, RebindPolicy::Overwrite);
        assert_eq!(cfg.binding.connection, RebindPolicy::Overwrite);
        assert_eq!(cfg.api.listen_address, "127.0.0.1:7878");
    }

    #[test]
    fn test_load_rejects_invalid_engine_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine]\nclusters = 0\n").unwrap();
        assert!(DetectorConfig::load(&path).is_err());
    }

    #[test]
    fn test_resolve_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DetectorConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
