//! Scheduler configuration
//!
//! Defaults can be overridden from the environment with [`QueueConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings for a [`crate::JobQueue`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum simultaneously RUNNING jobs (env: SPOOL_CONCURRENCY)
    pub concurrency: usize,
    /// Timeout for jobs created without one (env: SPOOL_TIMEOUT_MS)
    pub default_timeout: Duration,
    /// Max retries for jobs created without one (env: SPOOL_RETRIES)
    pub default_max_retries: u32,
    /// Start scheduling on construction (env: SPOOL_AUTOSTART)
    pub autostart: bool,
    /// Period of the timeout sweep (env: SPOOL_SWEEP_INTERVAL_MS)
    pub sweep_interval: Duration,
    /// Fallback tick period when no wakeup arrives (env: SPOOL_POLL_INTERVAL_MS)
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            default_timeout: Duration::from_millis(1_800_000),
            default_max_retries: 3,
            autostart: true,
            sweep_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, "SPOOL_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPOOL_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u32>(&lookup, "SPOOL_RETRIES")? {
            config.default_max_retries = v;
        }
        if let Some(v) = parse_var::<bool>(&lookup, "SPOOL_AUTOSTART")? {
            config.autostart = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPOOL_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPOOL_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Invalid("default timeout must be positive".into()));
        }
        if self.sweep_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}
