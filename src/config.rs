use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Configuration for a shardmesh process (storage node or supernode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Leader cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address this process binds and announces (host:port)
    pub bind_addr: String,
    /// Address of the supernode router
    pub supernode_addr: String,
    /// Name of the cluster this node belongs to
    pub cluster_name: String,
    /// Line-oriented peer address table (one addr per line, `#` comments)
    pub peer_table: PathBuf,
    /// Fallback peer table consulted when the primary one is missing
    pub peer_table_fallback: PathBuf,
    /// Maximum number of concurrently served RPC connections
    pub worker_pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local key-value store path; defaults under the data directory
    pub db_path: Option<PathBuf>,
    /// Directory holding cached whole-file artifacts on the leader
    pub cache_dir: Option<PathBuf>,
    /// Upload shard size limit in bytes
    pub shard_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached files
    pub capacity: usize,
    /// Weight of the frequency component in the eviction score
    pub frequency_weight: f64,
    /// Weight of the recency component in the eviction score
    pub recency_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter used when RUST_LOG is not set
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                bind_addr: "127.0.0.1:7000".to_string(),
                supernode_addr: "127.0.0.1:9000".to_string(),
                cluster_name: "cluster1".to_string(),
                peer_table: PathBuf::from("peers.txt"),
                peer_table_fallback: PathBuf::from("peers_local.txt"),
                worker_pool_size: 10,
            },
            storage: StorageConfig {
                db_path: None,
                cache_dir: None,
                shard_limit: 50 * 1024 * 1024, // 50 MiB
            },
            cache: CacheConfig {
                capacity: 50,
                frequency_weight: 0.6,
                recency_weight: 0.4,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults.
    pub fn load_or_default(config_path: Option<PathBuf>) -> StoreResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str)
                    .map_err(|e| StoreError::Config(format!("config parse error: {}", e)))?;
                tracing::info!(path = %path.display(), "loaded configuration");
                return Ok(config);
            }
        }

        tracing::info!("using default configuration");
        Ok(Config::default())
    }

    /// Save configuration to file.
    pub fn save(&self, config_path: &PathBuf) -> StoreResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| StoreError::Config(format!("config serialize error: {}", e)))?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        Ok(())
    }

    /// Resolved key-value store path for this process.
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("db"))
    }

    /// Resolved cache artifact directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.storage
            .cache_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("cache"))
    }
}

/// Default per-user data directory for db and cache state.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shardmesh")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = Config::default();
        assert_eq!(config.storage.shard_limit, 50 * 1024 * 1024);
        assert_eq!(config.network.worker_pool_size, 10);
        assert!(config.cache.frequency_weight > config.cache.recency_weight);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.cache.capacity, config.cache.capacity);
    }
}
