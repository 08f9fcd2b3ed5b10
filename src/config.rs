//! ChunkVault Configuration
//!
//! This module provides configuration structures for the chunk storage
//! engine: node identity, cluster shape, cache ceiling, delta and
//! compression policy, and replication pacing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::CompressionMethod;

/// Main ChunkVault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkVaultConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Chunk cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Version delta configuration
    #[serde(default)]
    pub delta: DeltaConfig,

    /// Chunk compression configuration
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This instance's id within the cluster
    #[serde(default)]
    pub instance_id: u32,

    /// Directory holding the descriptor table and data stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Total number of instances, fixed when the cluster is created
    #[serde(default = "default_instances")]
    pub instances: u32,

    /// Number of replicas kept for every chunk (0 disables replication)
    #[serde(default)]
    pub redundancy: u32,
}

/// What to do when pinned chunks keep the cache above its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Exceed the ceiling silently
    #[default]
    Tolerate,
    /// Park the caller until an unpin frees headroom
    Block,
    /// Fail the request with `CacheExhausted`
    Fail,
}

/// Chunk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte ceiling in MB (0 = auto-tune from installed RAM)
    #[serde(default)]
    pub size_mb: u64,

    /// Behaviour when no unpinned chunk can be evicted
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Version delta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Store new versions as deltas against the prior version when smaller
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Chunk compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression applied to chunk blocks before they hit disk
    #[serde(default = "default_compression")]
    pub method: CompressionMethod,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// How often blocked waiters re-check that their query is still alive
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/chunkvault")
}

fn default_instances() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_compression() -> CompressionMethod {
    CompressionMethod::Lz4
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            redundancy: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_mb: 0,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            method: default_compression(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ChunkVaultConfig {
    /// Single-instance configuration rooted at `data_dir`
    pub fn single_node(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                instance_id: 0,
                data_dir: data_dir.into(),
            },
            cluster: ClusterConfig::default(),
            cache: CacheConfig::default(),
            delta: DeltaConfig::default(),
            compression: CompressionConfig::default(),
            replication: ReplicationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChunkVaultConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ChunkVaultConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.instances == 0 {
            return Err(crate::Error::Config("cluster.instances must be at least 1".into()));
        }

        if self.node.instance_id >= self.cluster.instances {
            return Err(crate::Error::Config(format!(
                "node.instance_id {} is outside a cluster of {} instances",
                self.node.instance_id, self.cluster.instances
            )));
        }

        if self.cluster.redundancy >= self.cluster.instances {
            return Err(crate::Error::Config(format!(
                "cluster.redundancy {} needs more than {} instances",
                self.cluster.redundancy, self.cluster.instances
            )));
        }

        if self.replication.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "replication.poll_interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the descriptor table
    pub fn descriptor_path(&self) -> PathBuf {
        self.node.data_dir.join("storage.header")
    }

    /// Directory holding one file per data store
    pub fn datastore_dir(&self) -> PathBuf {
        self.node.data_dir.join("datastores")
    }

    /// Cache ceiling in bytes, auto-tuned when unset
    pub fn cache_bytes(&self) -> u64 {
        if self.cache.size_mb > 0 {
            self.cache.size_mb * 1024 * 1024
        } else {
            crate::tuning::auto_cache_mb() * 1024 * 1024
        }
    }

    /// Get the query poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication.poll_interval_ms)
    }
}
