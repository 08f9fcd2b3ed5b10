//! ChunkVault - Persistent Chunk Storage Engine
//!
//! Stores versioned chunks of multidimensional arrays on local data stores,
//! keeps recently used chunks in a bounded in-memory cache and ships copies
//! of every write to replica instances.
//!
//! # Architecture
//!
//! Each array attribute is cut into fixed-size chunks. A write of a new
//! array version usually differs from the previous version in a few cells,
//! so the engine keeps the newest version materialized and stores older
//! ones as deltas against it, all in one block per chunk slot.
//!
//! # Features
//!
//! - LRU chunk cache with pinning and a configurable overflow policy
//! - Subtractive and binary chunk deltas with per-slot version chains
//! - Tombstones and version garbage collection
//! - Replica fan-out with per-instance flow control
//! - Descriptor table that rebuilds the chunk map on open

pub mod config;
pub mod delta;
pub mod error;
pub mod query;
pub mod replication;
pub mod schema;
pub mod storage;
pub mod tuning;

pub use config::ChunkVaultConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ChunkVaultConfig, OverflowPolicy};
    pub use crate::error::{Error, Result};
    pub use crate::query::QueryContext;
    pub use crate::replication::{MemoryTransport, Transport};
    pub use crate::schema::{ArrayDesc, AttributeDesc, DimensionDesc, ElementType};
    pub use crate::storage::{NewChunk, StorageAddress, StorageEngine, StoredAs, WriteReport};
}
