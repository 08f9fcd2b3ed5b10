//! Persistent chunks and chunk views

use std::sync::Arc;

use bytes::Bytes;

use super::address::{ChunkGeometry, Coordinates, StorageAddress};
use super::engine::{StorageEngine, WriteReport};
use super::header::{ChunkFlags, ChunkHeader};
use super::lru::ChunkId;
use crate::delta::DeltaBlock;
use crate::error::Result;
use crate::query::QueryContext;
use crate::schema::ArrayDesc;

/// Residency of a chunk's bytes
#[derive(Debug, Clone)]
pub enum ChunkState {
    /// Header only; bytes are on disk
    Absent,
    /// One thread is reading the bytes in; others park until it finishes
    Loading,
    /// Decompressed block is in memory
    Ready(DeltaBlock),
}

/// In-memory record of one stored chunk block
#[derive(Debug)]
pub struct PersistentChunk {
    pub address: StorageAddress,
    pub header: ChunkHeader,
    pub state: ChunkState,
    /// Outstanding pins; the bytes stay resident while this is non-zero
    pub pins: u32,
    /// A thread is parked waiting for the load to finish
    pub waiting: bool,
    /// LRU clock value at the last touch
    pub timestamp: u64,
    /// Oldest version in the block, once known
    pub oldest_version: Option<u64>,
    pub geometry: Option<ChunkGeometry>,
}

impl PersistentChunk {
    pub fn new(address: StorageAddress, header: ChunkHeader) -> Self {
        Self {
            address,
            header,
            state: ChunkState::Absent,
            pins: 0,
            waiting: false,
            timestamp: 0,
            oldest_version: None,
            geometry: None,
        }
    }

    /// Newest version held by this chunk
    pub fn newest_version(&self) -> u64 {
        self.header.arr_id
    }

    /// Bytes charged to the cache while resident
    pub fn cache_size(&self) -> u64 {
        self.header.size
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.state, ChunkState::Ready(_))
    }

    /// Resident block, if loaded
    pub fn block(&self) -> Option<&DeltaBlock> {
        match &self.state {
            ChunkState::Ready(block) => Some(block),
            _ => None,
        }
    }

    /// Account-relevant: loading or ready
    pub fn holds_reservation(&self) -> bool {
        !matches!(self.state, ChunkState::Absent)
    }

    pub fn set_geometry(&mut self, desc: &ArrayDesc) {
        if self.geometry.is_none() {
            self.geometry = Some(ChunkGeometry::new(desc, &self.address.coords));
        }
    }
}

/// Chunk map value for one address.
///
/// The top entry is the current state of the slot. `prior` links reach
/// older states that are not folded into the current block: a version
/// stored materialized because its delta was not worth keeping, or the
/// data that a tombstone hides.
#[derive(Debug, Clone)]
pub enum ChunkMapEntry {
    Live {
        chunk: ChunkId,
        prior: Option<Box<ChunkMapEntry>>,
    },
    Tombstone {
        version: u64,
        hdr_pos: u64,
        prior: Option<Box<ChunkMapEntry>>,
    },
}

impl ChunkMapEntry {
    pub fn prior(&self) -> Option<&ChunkMapEntry> {
        match self {
            ChunkMapEntry::Live { prior, .. } | ChunkMapEntry::Tombstone { prior, .. } => prior.as_deref(),
        }
    }

    pub fn prior_mut(&mut self) -> Option<&mut ChunkMapEntry> {
        match self {
            ChunkMapEntry::Live { prior, .. } | ChunkMapEntry::Tombstone { prior, .. } => prior.as_deref_mut(),
        }
    }

    pub fn take_prior(&mut self) -> Option<Box<ChunkMapEntry>> {
        match self {
            ChunkMapEntry::Live { prior, .. } | ChunkMapEntry::Tombstone { prior, .. } => prior.take(),
        }
    }

    /// Detach everything older than the entry `depth` links down
    pub fn split_off(&mut self, depth: usize) -> Option<Box<ChunkMapEntry>> {
        if depth == 0 {
            return self.take_prior();
        }
        self.prior_mut()?.split_off(depth - 1)
    }

    /// Entries from this one down to the oldest
    pub fn chain(&self) -> impl Iterator<Item = &ChunkMapEntry> {
        std::iter::successors(Some(self), |e| e.prior())
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ChunkMapEntry::Tombstone { .. })
    }
}

/// Payload of a new chunk version
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub data: Bytes,
    pub sparse: bool,
    pub rle: bool,
    /// Live elements
    pub n_elems: u32,
}

impl NewChunk {
    /// Dense payload where every cell is live
    pub fn dense(data: impl Into<Bytes>, n_elems: u32) -> Self {
        Self {
            data: data.into(),
            sparse: false,
            rle: false,
            n_elems,
        }
    }

    pub fn flags(&self) -> ChunkFlags {
        let mut flags = ChunkFlags::empty();
        flags.set(ChunkFlags::SPARSE, self.sparse);
        flags.set(ChunkFlags::RLE, self.rle);
        flags
    }
}

/// Pinned, read-only view of one chunk version. Unpins on drop.
pub struct ReadOnlyChunkView<'a> {
    pub(crate) engine: &'a StorageEngine,
    pub(crate) id: ChunkId,
    pub(crate) generation: u64,
    pub(crate) address: StorageAddress,
    pub(crate) version: u64,
    pub(crate) data: Bytes,
    pub(crate) sparse: bool,
    pub(crate) rle: bool,
    pub(crate) header: ChunkHeader,
    pub(crate) geometry: ChunkGeometry,
}

impl<'a> ReadOnlyChunkView<'a> {
    pub fn address(&self) -> &StorageAddress {
        &self.address
    }

    /// Version actually served (newest stored version not after the request)
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the bytes that outlives the pin
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_rle(&self) -> bool {
        self.rle
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn first_position(&self, with_overlap: bool) -> &Coordinates {
        if with_overlap {
            &self.geometry.first_overlap
        } else {
            &self.geometry.first
        }
    }

    pub fn last_position(&self, with_overlap: bool) -> &Coordinates {
        if with_overlap {
            &self.geometry.last_overlap
        } else {
            &self.geometry.last
        }
    }
}

impl Drop for ReadOnlyChunkView<'_> {
    fn drop(&mut self) {
        self.engine.unpin(self.id, self.generation);
    }
}

impl std::fmt::Debug for ReadOnlyChunkView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyChunkView")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Buffer for a new chunk version, committed through the engine
pub struct WritableChunkView<'a> {
    engine: &'a StorageEngine,
    desc: &'a ArrayDesc,
    address: StorageAddress,
    chunk: NewChunk,
    buffer: Vec<u8>,
}

impl<'a> WritableChunkView<'a> {
    pub(crate) fn new(engine: &'a StorageEngine, desc: &'a ArrayDesc, address: StorageAddress) -> Self {
        Self {
            engine,
            desc,
            address,
            chunk: NewChunk::dense(Bytes::new(), 0),
            buffer: Vec::new(),
        }
    }

    pub fn address(&self) -> &StorageAddress {
        &self.address
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.buffer = data;
    }

    pub fn set_sparse(&mut self, sparse: bool) {
        self.chunk.sparse = sparse;
    }

    pub fn set_rle(&mut self, rle: bool) {
        self.chunk.rle = rle;
    }

    /// Number of live elements
    pub fn set_count(&mut self, n_elems: u32) {
        self.chunk.n_elems = n_elems;
    }

    /// Persist the buffer as `version`
    pub fn commit(self, version: u64, query: &Arc<QueryContext>) -> Result<WriteReport> {
        let WritableChunkView {
            engine,
            desc,
            address,
            mut chunk,
            buffer,
        } = self;
        chunk.data = Bytes::from(buffer);
        engine.write(desc, &address, chunk, version, query)
    }
}
