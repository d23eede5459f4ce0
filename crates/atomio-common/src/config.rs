//! Configuration types for Atomio
//!
//! Everything here is fixed when a storage session opens, except the
//! watermarks and the stall flag, which the queue exposes setters for.

use crate::error::{Error, Result};
use crate::types::Watermarks;
use serde::{Deserialize, Serialize};

/// Default number of write-back workers
pub const DEFAULT_WORKER_COUNT: usize = 6;

/// Default number of connections reserved for foreground callers
pub const DEFAULT_FOREGROUND_CONNECTIONS: usize = 4;

/// Upper bound on workers per queue
pub const MAX_WORKER_COUNT: usize = 256;

/// Write-back queue configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    /// Number of worker tasks draining the queue
    pub worker_count: usize,
    /// Initial backpressure thresholds
    pub watermarks: Watermarks,
    /// Stall producers above the high watermark
    pub stall: bool,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            watermarks: Watermarks::default(),
            stall: true,
        }
    }
}

impl WriteBackConfig {
    /// Check the configuration can start a queue
    ///
    /// # Errors
    /// Returns [`Error::Config`] for a zero or oversized worker count or
    /// unusable watermarks.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be at least 1"));
        }
        if self.worker_count > MAX_WORKER_COUNT {
            return Err(Error::config(format!(
                "worker_count {} exceeds maximum {MAX_WORKER_COUNT}",
                self.worker_count
            )));
        }
        self.watermarks.validate()
    }
}

/// Storage session configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Session name, used in logs and the stats report
    pub name: String,
    /// Connections available to synchronous callers alongside the workers
    pub foreground_connections: usize,
    /// Write-back queue settings
    pub write_back: WriteBackConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "atomio".to_string(),
            foreground_connections: DEFAULT_FOREGROUND_CONNECTIONS,
            write_back: WriteBackConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Total connection pool size: foreground plus one per worker
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.foreground_connections + self.write_back.worker_count
    }

    /// Check the configuration can open a session
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the write-back settings are invalid.
    pub fn validate(&self) -> Result<()> {
        self.write_back.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.write_back.worker_count, 6);
        assert_eq!(config.pool_size(), 10);
        assert!(config.write_back.stall);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = WriteBackConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_toml() {
        let config: StorageConfig = toml::from_str(
            r#"
            name = "bench"

            [write_back]
            worker_count = 2

            [write_back.watermarks]
            high = 10
            low = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "bench");
        assert_eq!(config.foreground_connections, DEFAULT_FOREGROUND_CONNECTIONS);
        assert_eq!(config.write_back.watermarks, Watermarks { high: 10, low: 5 });
        assert!(config.write_back.stall);
    }
}
