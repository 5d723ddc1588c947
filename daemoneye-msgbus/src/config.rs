//! Bus options with hierarchical overrides using figment.
//!
//! Sources, lowest precedence first:
//! 1. Embedded defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed `DAEMONEYE_MSGBUS_`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for option overrides
pub const ENV_PREFIX: &str = "DAEMONEYE_MSGBUS_";

/// Option loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidFormat(Box::new(err))
    }
}

/// Options recognized by the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusOptions {
    /// Messages published by this bus instance are not delivered back to it
    pub no_local: bool,
    /// Unacknowledged deliveries the broker sends before waiting for acks
    pub prefetch_count: Option<u16>,
    /// Idle time after which the broker deletes the receive queue
    pub queue_unused_timeout_ms: Option<u64>,
    /// Time to live of messages sitting in the receive queue
    pub message_ttl_on_queue_ms: Option<u64>,
    /// Track broker confirms for every outbound delivery
    pub use_publisher_confirms: bool,
    /// Suppress duplicates and restore per-producer order on the inbound path
    pub deduplication_and_resequencing: bool,
    /// Constant delay between connection attempts
    pub connection_attempt_interval_ms: u64,
    /// Deliveries unconfirmed for longer than this are reported as failed
    pub publisher_confirm_timeout_ms: u64,
    /// How often unconfirmed deliveries are checked against the timeout
    pub publisher_confirm_check_interval_ms: u64,
    /// How long the resequencer waits for a missing sequence number
    pub resequencing_gap_timeout_ms: u64,
    /// Out-of-order messages buffered per producer before a forced release
    pub resequencing_max_pending: usize,
    /// How long a mandatory-publish failure callback stays registered
    pub return_callback_retention_ms: u64,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            no_local: false,
            prefetch_count: Some(100),
            queue_unused_timeout_ms: None,
            message_ttl_on_queue_ms: None,
            use_publisher_confirms: true,
            deduplication_and_resequencing: true,
            connection_attempt_interval_ms: 5_000,
            publisher_confirm_timeout_ms: 10_000,
            publisher_confirm_check_interval_ms: 5_000,
            resequencing_gap_timeout_ms: 5_000,
            resequencing_max_pending: 1_000,
            return_callback_retention_ms: 60_000,
        }
    }
}

impl BusOptions {
    pub fn connection_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.connection_attempt_interval_ms)
    }

    pub fn queue_unused_timeout(&self) -> Option<Duration> {
        self.queue_unused_timeout_ms.map(Duration::from_millis)
    }

    pub fn message_ttl_on_queue(&self) -> Option<Duration> {
        self.message_ttl_on_queue_ms.map(Duration::from_millis)
    }

    pub fn publisher_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.publisher_confirm_timeout_ms)
    }

    pub fn publisher_confirm_check_interval(&self) -> Duration {
        Duration::from_millis(self.publisher_confirm_check_interval_ms)
    }

    pub fn resequencing_gap_timeout(&self) -> Duration {
        Duration::from_millis(self.resequencing_gap_timeout_ms)
    }

    pub fn return_callback_retention(&self) -> Duration {
        Duration::from_millis(self.return_callback_retention_ms)
    }

    /// Validate option values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            (
                "connection_attempt_interval_ms",
                self.connection_attempt_interval_ms,
            ),
            (
                "publisher_confirm_timeout_ms",
                self.publisher_confirm_timeout_ms,
            ),
            (
                "publisher_confirm_check_interval_ms",
                self.publisher_confirm_check_interval_ms,
            ),
            (
                "resequencing_gap_timeout_ms",
                self.resequencing_gap_timeout_ms,
            ),
            (
                "return_callback_retention_ms",
                self.return_callback_retention_ms,
            ),
        ];

        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        if self.prefetch_count == Some(0) {
            return Err(ConfigError::ValidationError {
                message: "prefetch_count must be greater than 0 when set".to_owned(),
            });
        }

        if self.resequencing_max_pending == 0 {
            return Err(ConfigError::ValidationError {
                message: "resequencing_max_pending must be greater than 0".to_owned(),
            });
        }

        Ok(())
    }
}

/// Loads [`BusOptions`] with hierarchical override support.
#[derive(Debug, Default)]
pub struct OptionsLoader {
    file: Option<PathBuf>,
    require_file: bool,
}

impl OptionsLoader {
    /// Loader using defaults and environment overrides only
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a TOML file if it exists
    pub fn with_optional_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self.require_file = false;
        self
    }

    /// Merge a TOML file, failing if it is missing
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self.require_file = true;
        self
    }

    /// Load and validate options
    pub fn load(&self) -> Result<BusOptions, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(BusOptions::default()));

        if let Some(path) = &self.file {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else if self.require_file {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        let options: BusOptions = figment.extract()?;
        options.validate()?;
        Ok(options)
    }
}
