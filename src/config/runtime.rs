//! Runtime configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config.toml` unless overridden on the command line)
//! 2. environment variables prefixed with `LAB_LOGGER_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use lab_logger::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::load_from("config.toml")?;
//! println!("Polling every {} s", config.update.interval_secs);
//! # Ok::<(), lab_logger::error::LoggerError>(())
//! ```

use crate::error::{AppResult, ConfigError};
use crate::reading::Precision;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default runtime configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Time-series database target
    pub database: DatabaseConfig,
    /// Polling schedule
    pub update: UpdateConfig,
    /// Device document location and device defaults
    pub devices: DevicesConfig,
    /// Batch writer retry policy
    #[serde(default)]
    pub writer: WriterConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,
    /// Organization
    pub org: String,
    /// Destination bucket
    pub bucket: String,
    /// API token
    pub token: String,
    /// Timestamp precision sent with every write
    #[serde(default)]
    pub precision: Precision,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

/// Polling schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Tick interval in seconds
    pub interval_secs: f64,
}

/// Device document and per-device defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Path to the JSON device document
    pub config_path: PathBuf,
    /// Cycle timeout for entries without a `Timeout` key
    #[serde(default = "default_device_timeout")]
    pub default_timeout_secs: f64,
    /// Consecutive failed cycles before a session is closed and reopened
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u32,
}

/// Batch writer retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Total write attempts per batch, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after every retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_request_timeout() -> f64 {
    10.0
}

fn default_device_timeout() -> f64 {
    5.0
}

fn default_reconnect_threshold() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a specific file path merged with the environment
    ///
    /// Environment variables override file values, e.g.
    /// `LAB_LOGGER_DATABASE__TOKEN=...` or `LAB_LOGGER_UPDATE__INTERVAL_SECS=30`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: RuntimeConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_LOGGER_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if !(self.update.interval_secs.is_finite() && self.update.interval_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "update.interval_secs must be positive, got {}",
                self.update.interval_secs
            )));
        }

        if !(self.devices.default_timeout_secs.is_finite()
            && self.devices.default_timeout_secs > 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "devices.default_timeout_secs must be positive, got {}",
                self.devices.default_timeout_secs
            )));
        }

        if self.devices.reconnect_threshold == 0 {
            return Err(ConfigError::Invalid(
                "devices.reconnect_threshold must be at least 1".into(),
            ));
        }

        if self.writer.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "writer.max_attempts must be at least 1".into(),
            ));
        }

        if !(self.writer.backoff_factor.is_finite() && self.writer.backoff_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "writer.backoff_factor must be greater than 1, got {}",
                self.writer.backoff_factor
            )));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url must not be empty".into()));
        }

        Ok(())
    }

    /// Tick interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.update.interval_secs)
    }
}
