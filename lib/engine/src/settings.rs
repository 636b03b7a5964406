//! Runtime dispatcher settings.
//!
//! Loaded via the `config` crate from `EDGEWISE__*` environment variables,
//! e.g. `EDGEWISE__DEFAULT_MAX_RETRY=5`. Every field has a default, so an
//! empty environment is a valid configuration.

use crate::error::ConfigError;
use crate::strategy::SamplingStrategy;
use serde::Deserialize;
use std::time::Duration;

/// Defaults applied to tasks and flows that do not set their own values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatcherSettings {
    /// Seconds to wait before retrying a failed task.
    #[serde(default)]
    pub default_retry_countdown_secs: u64,

    /// Retry bound for tasks; unbounded when unset.
    #[serde(default)]
    pub default_max_retry: Option<u32>,

    /// First retry interval of the default sampling strategy, in seconds.
    #[serde(default = "default_sampling_start_secs")]
    pub sampling_start_secs: u64,

    /// Upper bound of the default sampling strategy, in seconds.
    #[serde(default = "default_sampling_max_secs")]
    pub sampling_max_secs: u64,
}

fn default_sampling_start_secs() -> u64 {
    2
}

fn default_sampling_max_secs() -> u64 {
    120
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_retry_countdown_secs: 0,
            default_max_retry: None,
            sampling_start_secs: default_sampling_start_secs(),
            sampling_max_secs: default_sampling_max_secs(),
        }
    }
}

impl DispatcherSettings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Self::environment())
    }

    /// Loads settings from the given environment source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn load(environment: config::Environment) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(environment)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ConfigError::Settings {
                reason: e.to_string(),
            })
    }

    /// The environment source settings are read from.
    #[must_use]
    pub fn environment() -> config::Environment {
        config::Environment::with_prefix("EDGEWISE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Countdown applied before retrying a task without its own countdown.
    #[must_use]
    pub fn default_retry_countdown(&self) -> Duration {
        Duration::from_secs(self.default_retry_countdown_secs)
    }

    /// Strategy used by flows without their own sampling strategy.
    #[must_use]
    pub fn default_sampling(&self) -> SamplingStrategy {
        SamplingStrategy::BiexponentialIncrease {
            start_retry: self.sampling_start_secs,
            max_retry: self.sampling_max_secs,
        }
    }
}
