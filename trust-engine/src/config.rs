//! Configuration loading for the trust engine.
//!
//! Configuration is loaded from a TOML file. Every section and field is
//! optional; missing values fall back to the defaults below.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zerok_trust_core::Backoff;
use zerok_trust_types::ViewName;

/// Root configuration for one account engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Account and circle configuration.
    #[serde(default)]
    pub account: AccountConfig,
    /// Transport retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Outgoing rate limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fetch and trust-gap configuration.
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Account configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Circle name shared by every device of the account (default: "default").
    #[serde(default = "default_circle_name")]
    pub circle_name: String,
    /// Views this device keeps key sets for.
    #[serde(default = "default_views")]
    pub views: Vec<String>,
    /// Human-readable device name, published in the peer description.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

/// Transport retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Push attempts before the account is reported degraded (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds (default: 2000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retry delay cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Maximum random jitter added to each delay, in milliseconds (default: 5000).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Outgoing rate limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Pushes per minute for one (destination, kind) pair (default: 120).
    #[serde(default = "default_pushes_per_minute")]
    pub pushes_per_minute: u32,
    /// Burst allowance for one (destination, kind) pair (default: 20).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Pushes per second across all keys (default: 50).
    #[serde(default = "default_global_per_second")]
    pub global_per_second: u32,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Fetch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Delay before re-fetching while no trusted share is available (default: 5000).
    #[serde(default = "default_trust_gap_retry_ms")]
    pub trust_gap_retry_ms: u64,
    /// Background fetch interval in seconds; 0 disables it (default: 30).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum blobs per pull (default: 500).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

// Default value functions
fn default_circle_name() -> String {
    "default".to_string()
}

fn default_views() -> Vec<String> {
    vec!["passwords".to_string(), "wifi".to_string()]
}

fn default_device_name() -> String {
    "device".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    5000
}

fn default_pushes_per_minute() -> u32 {
    120
}

fn default_burst() -> u32 {
    20
}

fn default_global_per_second() -> u32 {
    50
}

fn default_database_path() -> PathBuf {
    PathBuf::from("trust.db")
}

fn default_trust_gap_retry_ms() -> u64 {
    5000
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    500
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            circle_name: default_circle_name(),
            views: default_views(),
            device_name: default_device_name(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            pushes_per_minute: default_pushes_per_minute(),
            burst: default_burst(),
            global_per_second: default_global_per_second(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            trust_gap_retry_ms: default_trust_gap_retry_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            page_size: default_page_size(),
        }
    }
}

impl AccountConfig {
    /// Configured views as typed names.
    pub fn view_names(&self) -> Vec<ViewName> {
        self.views.iter().map(ViewName::new).collect()
    }
}

impl RetryConfig {
    /// Backoff policy for transport retries.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.jitter_ms),
        )
    }
}

impl FetchConfig {
    /// Delay before re-fetching while waiting for a trusted share.
    pub fn trust_gap_retry(&self) -> Duration {
        Duration::from_millis(self.trust_gap_retry_ms)
    }

    /// Background fetch interval, if enabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.circle_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "account.circle_name",
                reason: "must not be empty".into(),
            });
        }
        if self.account.views.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid {
                field: "account.views",
                reason: "view names must not be empty".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be > 0".into(),
            });
        }
        if self.fetch.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch.page_size",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
