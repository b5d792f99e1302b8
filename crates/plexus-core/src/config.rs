//! Plexus Configuration Management
//!
//! Handles configuration from environment variables and config files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Key/value substrate configuration
    pub storage: StorageConfig,

    /// Orchestrator cache configuration
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage
        if let Ok(backend) = std::env::var("PLEXUS_STORAGE_BACKEND") {
            config.storage.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("PLEXUS_CLUSTER_URL") {
            config.storage.cluster_url = url;
        }
        if let Ok(timeout) = std::env::var("PLEXUS_REQUEST_TIMEOUT_SECS") {
            config.storage.request_timeout_secs =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "PLEXUS_REQUEST_TIMEOUT_SECS".to_string(),
                    value: timeout,
                })?;
        }

        // Caches
        if let Ok(ttl) = std::env::var("PLEXUS_TOP_UTILIZERS_TTL_SECS") {
            config.cache.top_utilizers_ttl_secs =
                ttl.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "PLEXUS_TOP_UTILIZERS_TTL_SECS".to_string(),
                    value: ttl,
                })?;
        }
        if let Ok(cap) = std::env::var("PLEXUS_TOP_UTILIZERS_CAPACITY") {
            config.cache.top_utilizers_capacity =
                cap.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "PLEXUS_TOP_UTILIZERS_CAPACITY".to_string(),
                    value: cap,
                })?;
        }

        // Logging
        if let Ok(level) = std::env::var("PLEXUS_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }
}

/// Key/value substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend implementation to use
    pub backend: StorageBackend,

    /// Cluster endpoint for remote backends
    pub cluster_url: String,

    /// Per-operation timeout against the substrate
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            cluster_url: "tcp://localhost:5701".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Supported key/value backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process sharded map backend (tests, embedded deployments)
    Memory,
    /// Cluster-shared map backend reached over the network
    Cluster,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "cluster" => Ok(Self::Cluster),
            _ => Err(ConfigError::InvalidValue {
                key: "PLEXUS_STORAGE_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Orchestrator cache configuration. Both caches are bounded and TTL'd;
/// staleness inside the TTL is an accepted tradeoff, not a correctness bug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached top-utilizer rankings
    pub top_utilizers_capacity: u64,

    /// Time-to-live for cached rankings (seconds)
    pub top_utilizers_ttl_secs: u64,

    /// Maximum cached entity-set to entity-type resolutions
    pub entity_types_capacity: u64,

    /// Time-to-live for cached type resolutions (seconds)
    pub entity_types_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // Rankings are a handful of ids each; keep plenty
            top_utilizers_capacity: 1_000,
            // Tens of seconds: repeated dashboards hit, stale data ages out
            top_utilizers_ttl_secs: 30,
            entity_types_capacity: 10_000,
            // Type bindings change rarely
            entity_types_ttl_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.cache.top_utilizers_ttl_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(
            "memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            "cluster".parse::<StorageBackend>().unwrap(),
            StorageBackend::Cluster
        );
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_src = r#"
            [storage]
            backend = "memory"
            cluster_url = "tcp://db0:5701"
            request_timeout_secs = 10

            [cache]
            top_utilizers_capacity = 50
            top_utilizers_ttl_secs = 15
            entity_types_capacity = 100
            entity_types_ttl_secs = 60

            [logging]
            level = "debug"
            json_format = true
            include_location = false
        "#;

        let config: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.storage.cluster_url, "tcp://db0:5701");
        assert_eq!(config.cache.top_utilizers_ttl_secs, 15);
        assert!(config.logging.json_format);
    }
}
