//! ChunkVault Error Types

use thiserror::Error;

use crate::storage::StorageAddress;

/// Result type alias for ChunkVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// ChunkVault error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lookup errors
    #[error("No chunk at {address}")]
    NotFound { address: StorageAddress },

    #[error("Chunk at {address} was deleted at version {version}")]
    Deleted { address: StorageAddress, version: u64 },

    #[error("Chunk already exists: {0}")]
    ChunkExists(String),

    // Delta errors
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data store error: {0}")]
    DataStore(String),

    #[error("Descriptor corrupted at position {pos}: {reason}")]
    Corrupted { pos: u64, reason: String },

    #[error("Chunks in use: {0}")]
    InUse(String),

    #[error("Cache exhausted: need {requested} bytes, {used} of {ceiling} in use")]
    CacheExhausted {
        requested: u64,
        used: u64,
        ceiling: u64,
    },

    // Replication errors
    #[error("Replication to instance {instance} failed: {reason}")]
    ReplicationFailure { instance: u32, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the caller can reasonably carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::Deleted { .. })
    }

    /// Check if this error means the stored data itself is damaged
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::InvalidDelta(_) | Error::Corrupted { .. })
    }

    /// Make an owned copy suitable for handing to several waiters.
    ///
    /// `std::io::Error` and friends are not `Clone`, so wrapped sources are
    /// flattened into their message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::NotFound { address } => Error::NotFound { address: address.clone() },
            Error::Deleted { address, version } => Error::Deleted {
                address: address.clone(),
                version: *version,
            },
            Error::InvalidDelta(m) => Error::InvalidDelta(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::DataStore(m) => Error::DataStore(m.clone()),
            Error::Corrupted { pos, reason } => Error::Corrupted {
                pos: *pos,
                reason: reason.clone(),
            },
            Error::CacheExhausted { requested, used, ceiling } => Error::CacheExhausted {
                requested: *requested,
                used: *used,
                ceiling: *ceiling,
            },
            Error::ReplicationFailure { instance, reason } => Error::ReplicationFailure {
                instance: *instance,
                reason: reason.clone(),
            },
            Error::Cancelled => Error::Cancelled,
            Error::ShuttingDown => Error::ShuttingDown,
            other => Error::Internal(other.to_string()),
        }
    }
}
