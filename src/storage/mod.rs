//! Storage Module
//!
//! Persistent chunk storage: chunk addresses, on-disk headers and
//! descriptors, data stores, the resident chunk table with its LRU list,
//! and the engine that ties them together.

pub mod address;
pub mod chunk;
pub mod compression;
pub mod datastore;
pub mod descriptors;
pub mod engine;
pub mod header;
pub mod lru;

pub use address::{ChunkGeometry, Coordinates, StorageAddress};
pub use chunk::{ChunkMapEntry, ChunkState, NewChunk, PersistentChunk, ReadOnlyChunkView, WritableChunkView};
pub use compression::CompressionMethod;
pub use datastore::{DataStore, DataStores, Extent, FileDataStore, MemDataStore};
pub use descriptors::{DescriptorTable, StorageHeader, STORAGE_HEADER_SIZE};
pub use engine::{CacheStats, ChunkMapInfo, StorageEngine, StoredAs, WriteReport};
pub use header::{
    ChunkDescriptor, ChunkFlags, ChunkHeader, DiskPos, CHUNK_HEADER_SIZE, DESCRIPTOR_SIZE, MAX_COORDINATES,
    STORAGE_FORMAT_VERSION,
};
pub use lru::{ChunkId, ChunkTable};
