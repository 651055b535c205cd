//! Configuration loading and representation.
//!
//! Defaults, then an optional TOML file, then `VAULTLINE_*` environment
//! overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vaultline_stages::RedactionRule;

use crate::jobs::{BackoffStrategy, QueueSettings, RetryPolicy};
use crate::rate_limit::{limiter::validate_limits, ModelLimit, WindowSpec};

pub const ENV_DATA_DIR: &str = "VAULTLINE_DATA_DIR";
pub const ENV_CONCURRENCY: &str = "VAULTLINE_CONCURRENCY";
pub const ENV_MODEL: &str = "VAULTLINE_MODEL";

const HOUR: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root for `queue.db`, `progress.json` and `index/`.
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub runner: RunnerConfig,
    pub rate_limits: BTreeMap<String, ModelLimit>,
    pub redaction: RedactionConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub lease_secs: u64,
    pub dequeue_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub concurrency: usize,
    /// Upstream model for stages that call one.
    pub model: String,
    pub shutdown_grace_secs: u64,
    /// Longest single rate-limit wait a worker accepts before handing the
    /// job back to the queue. Unset means wait as long as needed.
    pub max_rate_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Replaces the built-in rules when non-empty.
    pub patterns: Vec<RedactionRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimensions: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("runtime"),
            queue: QueueConfig::default(),
            runner: RunnerConfig::default(),
            rate_limits: default_rate_limits(),
            redaction: RedactionConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_secs: 300,
            dequeue_timeout_ms: 1000,
            poll_interval_ms: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            model: "gpt-4o".to_string(),
            shutdown_grace_secs: 30,
            max_rate_wait_secs: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

/// Upstream budgets: `gpt-4o` 150 per 3h falling back to `o3-mini-high`
/// 50 per day, and `gpt-4.5` 50 per week.
pub fn default_rate_limits() -> BTreeMap<String, ModelLimit> {
    BTreeMap::from([
        (
            "gpt-4o".to_string(),
            ModelLimit::new(vec![WindowSpec::sliding(150, Duration::from_secs(3 * HOUR))])
                .with_fallback("o3-mini-high"),
        ),
        (
            "o3-mini-high".to_string(),
            ModelLimit::new(vec![WindowSpec::sliding(50, Duration::from_secs(24 * HOUR))]),
        ),
        (
            "gpt-4.5".to_string(),
            ModelLimit::new(vec![WindowSpec::sliding(50, Duration::from_secs(7 * 24 * HOUR))]),
        ),
    ])
}

impl IngestConfig {
    /// Load config from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `VAULTLINE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            self.runner.concurrency = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_CONCURRENCY,
                value: raw.clone(),
            })?;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.runner.model = model;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.concurrency == 0 {
            return Err(ConfigError::Invalid("runner.concurrency must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.lease_secs == 0 {
            return Err(ConfigError::Invalid("queue.lease_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.queue.retry.jitter) {
            return Err(ConfigError::Invalid("queue.retry.jitter must be within [0, 1]".into()));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid("embedding.dimensions must be positive".into()));
        }
        validate_limits(&self.rate_limits).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !self.rate_limits.contains_key(&self.runner.model) {
            return Err(ConfigError::Invalid(format!(
                "runner.model {} has no rate limit entry",
                self.runner.model
            )));
        }
        Ok(())
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.data_dir.join("progress.json")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.queue.retry;
        RetryPolicy {
            max_attempts: self.queue.max_attempts,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            strategy: retry.strategy,
            jitter: retry.jitter,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings::default()
            .with_retry(self.retry_policy())
            .with_poll_interval(Duration::from_millis(self.queue.poll_interval_ms))
    }
}
