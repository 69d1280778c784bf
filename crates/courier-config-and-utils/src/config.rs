//! Configuration management for the delivery core.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Backoff and dead-letter settings for failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: u64,
    /// Upper bound for the exponential delay, in seconds.
    pub max_delay_secs: u64,
    /// Failures reported with `attempts >= max_retries` dead-letter the item.
    pub max_retries: u32,
    /// Fraction of the delay added as random jitter (0.0 - 1.0).
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 3600,
            max_retries: 8,
            jitter_ratio: 0.1,
        }
    }
}

/// Idempotency tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// An in-progress record older than this is considered abandoned.
    pub in_progress_timeout_ms: u64,
    /// Default time-to-live of a record when the caller gives none.
    pub default_ttl_ms: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            in_progress_timeout_ms: 5 * 60 * 1000,
            default_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Delivery worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Items claimed per poll.
    pub batch_size: usize,
    /// Time between polls when the queue is idle.
    pub poll_interval_ms: u64,
    /// A `delivering` lease older than this is returned to the queue.
    pub lease_timeout_secs: u64,
    /// Delivered items older than this are pruned. `None` keeps them forever.
    pub prune_delivered_after_secs: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 1000,
            lease_timeout_secs: 300,
            prune_delivered_after_secs: Some(7 * 24 * 60 * 60),
        }
    }
}

/// Dead-letter queue reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqSettings {
    /// Number of error prefixes reported by stats.
    pub stats_top_errors: usize,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            stats_top_errors: 10,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format ("compact" or "json").
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub dlq: DlqSettings,
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: default_log_format(),
            retry: RetrySettings::default(),
            idempotency: IdempotencySettings::default(),
            worker: WorkerSettings::default(),
            dlq: DlqSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> CoreResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the config file, falling back to defaults.
    ///
    /// Environment variables are applied on top of the file.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) -> CoreResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("COURIER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = lookup("COURIER_LOG_FORMAT") {
            self.log_format = format;
        }
        if let Some(raw) = lookup("COURIER_MAX_RETRIES") {
            self.retry.max_retries = parse_var("COURIER_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("COURIER_BASE_DELAY_SECS") {
            self.retry.base_delay_secs = parse_var("COURIER_BASE_DELAY_SECS", &raw)?;
        }
        if let Some(raw) = lookup("COURIER_MAX_DELAY_SECS") {
            self.retry.max_delay_secs = parse_var("COURIER_MAX_DELAY_SECS", &raw)?;
        }
        Ok(())
    }

    /// Reject settings the delivery core cannot operate with.
    pub fn validate(&self) -> CoreResult<()> {
        let retry = &self.retry;
        if retry.base_delay_secs == 0 {
            return Err(CoreError::Config(
                "retry.base_delay_secs must be greater than zero".to_string(),
            ));
        }
        if retry.max_delay_secs < retry.base_delay_secs {
            return Err(CoreError::Config(format!(
                "retry.max_delay_secs ({}) must be >= retry.base_delay_secs ({})",
                retry.max_delay_secs, retry.base_delay_secs
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            return Err(CoreError::Config(format!(
                "retry.jitter_ratio must be within 0.0..=1.0, got {}",
                retry.jitter_ratio
            )));
        }
        if self.idempotency.in_progress_timeout_ms == 0 || self.idempotency.default_ttl_ms == 0 {
            return Err(CoreError::Config(
                "idempotency timeouts must be greater than zero".to_string(),
            ));
        }
        if self.worker.batch_size == 0 {
            return Err(CoreError::Config(
                "worker.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.worker.lease_timeout_secs == 0 {
            return Err(CoreError::Config(
                "worker.lease_timeout_secs must be greater than zero".to_string(),
            ));
        }
        match self.log_format.as_str() {
            "compact" | "json" => Ok(()),
            other => Err(CoreError::Config(format!(
                "log_format must be \"compact\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> CoreResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{name} has an invalid value: {raw:?}")))
}
