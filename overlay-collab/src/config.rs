//! Aggregate configuration, loadable from a JSON file.
//!
//! Every section is optional; missing fields fall back to their defaults.
//!
//! ```json
//! {
//!   "link": { "reconnect_delay_ms": 5000 },
//!   "throttle": { "min_interval_ms": 33 },
//!   "store": { "path": "/var/lib/overlay/sessions" }
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::link::LinkConfig;
use crate::relay::RelayConfig;
use crate::replicator::ReplicatorConfig;
use crate::storage::{RecorderConfig, StoreConfig};
use crate::throttle::{InterpolatorConfig, ThrottleConfig};
use crate::validation::ValidationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub link: LinkConfig,
    pub throttle: ThrottleConfig,
    pub interpolator: InterpolatorConfig,
    pub replicator: ReplicatorConfig,
    pub validation: ValidationConfig,
    pub recorder: RecorderConfig,
    pub store: StoreConfig,
    pub relay: RelayConfig,
}

impl CollabConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.throttle.min_interval_ms > self.throttle.max_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "throttle.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.throttle.min_interval_ms, self.throttle.max_interval_ms
            )));
        }
        if self.throttle.velocity_threshold <= 0.0 {
            return Err(ConfigError::Invalid("throttle.velocity_threshold must be positive".into()));
        }
        if self.validation.max_clock_skew_ms <= 0 {
            return Err(ConfigError::Invalid("validation.max_clock_skew_ms must be positive".into()));
        }
        if self.recorder.max_buffered_events == 0 {
            return Err(ConfigError::Invalid("recorder.max_buffered_events must be at least 1".into()));
        }
        Ok(())
    }
}
