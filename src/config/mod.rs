//! # Configuration
//!
//! TOML configuration for the `meshdir` binary and for embedding applications
//! that want the same defaults.
//!
//! ```rust,no_run
//! use meshdir::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("meshdir.toml").await?;
//!     let config = Config::load("meshdir.toml").await?;
//!     println!("Data dir: {}", config.storage.data_dir);
//!     Ok(())
//! }
//! ```
//!
//! ## File Format
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//! persist_key = "nodedb"
//!
//! [registry]
//! capacity = 10
//! schema_version = 1
//!
//! [session]
//! heartbeat_interval_secs = 300
//!
//! [logging]
//! level = "info"
//! file = "meshdir.log"
//! ```
//!
//! Every section may be omitted; missing values fall back to the defaults above.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the sled database.
    pub data_dir: String,
    /// Key under which the registry state is stored.
    pub persist_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            persist_key: crate::nodedb::DEFAULT_PERSIST_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Directories kept before the oldest is evicted.
    pub capacity: usize,
    /// Persisted payloads with any other version are discarded on load.
    pub schema_version: u32,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            capacity: crate::nodedb::DEFAULT_CAPACITY,
            schema_version: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshdir.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.persist_key, "nodedb");
        assert_eq!(config.registry.capacity, 10);
        assert_eq!(config.registry.schema_version, 1);
        assert_eq!(config.session.heartbeat_interval_secs, 300);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[registry]\ncapacity = 3\n").unwrap();
        assert_eq!(config.registry.capacity, 3);
        assert_eq!(config.registry.schema_version, 1);
        assert_eq!(config.storage.data_dir, "./data");
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshdir.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.session.heartbeat_interval_secs, 300);
        assert_eq!(config.logging.file.as_deref(), Some("meshdir.log"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = Config::load("/nonexistent/meshdir.toml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
