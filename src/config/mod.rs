//! Configuration module for the governance plugin
//!
//! Provides layered configuration loading from files, environment variables, and defaults.

pub mod error;
pub mod logging;

pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the governance plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Reject requests that do not present a virtual key (400)
    pub is_vk_mandatory: bool,

    /// Interval between counter flushes to the durable store, in seconds
    pub flush_interval_seconds: u64,

    /// Interval between expired-window sweeps, in seconds
    pub sweep_interval_seconds: u64,

    /// Connection string for the durable configuration store.
    /// When absent the plugin runs purely in-memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    pub logging: LoggingConfig,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            is_vk_mandatory: false,
            flush_interval_seconds: 30,
            sweep_interval_seconds: 60,
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl GovernanceConfig {
    /// Load configuration from a TOML file
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supports AEGIS_* environment variables for common settings.
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mandatory) = std::env::var("AEGIS_VK_MANDATORY") {
            self.is_vk_mandatory = mandatory.to_lowercase() == "true";
        }
        if let Ok(url) = std::env::var("AEGIS_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(secs) = std::env::var("AEGIS_FLUSH_INTERVAL_SECONDS") {
            if let Ok(s) = secs.parse() {
                self.flush_interval_seconds = s;
            }
        }
        if let Ok(secs) = std::env::var("AEGIS_SWEEP_INTERVAL_SECONDS") {
            if let Ok(s) = secs.parse() {
                self.sweep_interval_seconds = s;
            }
        }
        if let Ok(level) = std::env::var("AEGIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("AEGIS_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_seconds == 0 {
            return Err(ConfigError::Validation {
                field: "flush_interval_seconds".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.sweep_interval_seconds == 0 {
            return Err(ConfigError::Validation {
                field: "sweep_interval_seconds".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if let Some(url) = &self.database_url {
            if url.is_empty() {
                return Err(ConfigError::Validation {
                    field: "database_url".to_string(),
                    message: "connection string cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
