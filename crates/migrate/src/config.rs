//! Runtime configuration for the migration service.
//!
//! # Example
//!
//! ```toml
//! [migration]
//! worker_pool_size = 4
//! store_retry_limit = 3
//! stall_timeout_secs = 300
//! origin = "quire-node"
//!
//! [index]
//! name = "node"
//! retry_limit = 5
//! retry_backoff_ms = 100
//! pending_retry_interval_ms = 1000
//! ```
//!
//! Every key is optional; unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use quire_storage::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuireConfig {
    pub migration: MigrationConfig,
    pub index: IndexConfig,
}

/// `[migration]` section: job runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Maximum number of nodes migrated concurrently per job.
    pub worker_pool_size: usize,
    /// Transaction retries before a store error fails the job.
    pub store_retry_limit: u32,
    /// Interval without any finished node after which the job fails.
    pub stall_timeout_secs: u64,
    /// Node name recorded in the migration cause.
    pub origin: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            store_retry_limit: 3,
            stall_timeout_secs: 300,
            origin: "quire-node".to_string(),
        }
    }
}

impl MigrationConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// `[index]` section: search index sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Name of the node index.
    pub name: String,
    pub retry_limit: u32,
    /// Initial backoff between retries (doubles each retry).
    pub retry_backoff_ms: u64,
    /// Period of the loop that re-delivers queued index entries.
    pub pending_retry_interval_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            retry_limit: 5,
            retry_backoff_ms: 100,
            pending_retry_interval_ms: 1_000,
        }
    }
}

/// Longest single backoff sleep of an index request.
const MAX_INDEX_BACKOFF: Duration = Duration::from_secs(30);

impl IndexConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_limit,
            Duration::from_millis(self.retry_backoff_ms),
            MAX_INDEX_BACKOFF,
        )
    }

    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_millis(self.pending_retry_interval_ms)
    }
}

impl QuireConfig {
    /// Parse and validate a config from TOML text. `origin` names the source
    /// in error messages.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: QuireConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "migration.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.migration.stall_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "migration.stall_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.index.pending_retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "index.pending_retry_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.index.name.trim().is_empty() {
            return Err(ConfigError::Invalid("index.name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Read and parse a config TOML file from `path`.
pub fn read_config(path: &Path) -> Result<QuireConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    QuireConfig::from_toml_str(&content, path)
}
