//! Configuration file parsing for the Router.
//!
//! Loads settings from TOML files: bind address, storage backend, log
//! filter, page size, and the nested ledger, evaluator and janitor sections.

use ledger_engine::LedgerConfig;
use ledger_gatekeeper::EvaluatorConfig;
use ledger_janitor::JanitorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Router configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required configuration field: {0}")]
    MissingField(String),

    /// Field present but unusable
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Where the ledger keeps its records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory; everything is lost on exit
    #[default]
    Memory,
    /// SQLite database file
    Sqlite {
        /// Database path
        path: PathBuf,
    },
}

/// Router configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub bind_address: String,

    /// Bind port (e.g., 8080)
    pub bind_port: u16,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Default tracing directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Page size of `GET /conflicts` when the request gives none
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Ledger behaviour
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Constraint evaluator tuning
    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    /// Background maintenance
    #[serde(default)]
    pub janitor: JanitorConfig,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_page_size() -> usize {
    50
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::MissingField("bind_address".to_string()));
        }
        if self.default_page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "default_page_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let StorageConfig::Sqlite { path } = &self.storage {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingField("storage.path".to_string()));
            }
        }
        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_test_config() -> Self {
        RouterConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            storage: StorageConfig::Memory,
            log_filter: default_log_filter(),
            default_page_size: default_page_size(),
            ledger: LedgerConfig::lenient(),
            evaluator: EvaluatorConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }

    /// Get the full bind address (address:port)
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}
