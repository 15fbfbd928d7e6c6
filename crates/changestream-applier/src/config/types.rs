//! Configuration type definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coerce::{ValueCoercer, UTC_OFFSET};
use crate::dml::{RetryPolicy, DEFAULT_READ_RETRIES};
use crate::restriction::ClaimPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// MySQL source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Schema catalog location.
    pub catalog: CatalogConfig,

    /// Statement generation behavior.
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Failure routing behavior.
    #[serde(default)]
    pub failsafe: FailsafeConfig,

    /// Partition tracking behavior.
    #[serde(default)]
    pub partition: PartitionConfig,
}

impl Config {
    /// Value coercer for the configured source time zone.
    pub fn coercer(&self) -> ValueCoercer {
        ValueCoercer::new(self.source.timezone_offset.clone())
    }
}

/// MySQL source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Offset of the source database's time zone from UTC (`±HH:MM`).
    #[serde(default = "default_offset")]
    pub timezone_offset: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timezone_offset: default_offset(),
        }
    }
}

/// Schema catalog location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Catalog file (YAML, or JSON with a `.json` extension). Relative paths
    /// are resolved against the configuration file's directory.
    pub path: PathBuf,
}

/// Statement generation behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub read_retry: ReadRetryConfig,
}

/// Retry settings for full-row point reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRetryConfig {
    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed pause between attempts in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Deadline for a single attempt in seconds.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl ReadRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

/// Failure routing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeConfig {
    /// Interval between success/failure summary log lines.
    #[serde(default = "default_log_throttle_secs")]
    pub log_throttle_secs: u64,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            log_throttle_secs: default_log_throttle_secs(),
        }
    }
}

impl FailsafeConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_throttle_secs)
    }
}

/// Partition tracking behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub claim_policy: ClaimPolicy,
}

fn default_offset() -> String {
    UTC_OFFSET.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_READ_RETRIES
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_log_throttle_secs() -> u64 {
    60
}
