//! Storage engine
//!
//! Owns the chunk map, the chunk table with its LRU list, the descriptor
//! table and the data stores, and drives the delta engine and the
//! replication manager on writes.
//!
//! Locking: one coarse mutex guards the map, the table, the LRU list and
//! the byte accounting. It is never held across data store I/O or delta
//! work. A chunk being read from disk sits in `Loading`; other callers
//! that want it park on `loaded` until the loader finishes. Writers to the
//! same slot are serialized by a small fixed set of latches hashed from
//! the chunk coordinates, taken before the coarse lock.
//!
//! Accounting: `used` is the sum of `cache_size()` over every chunk that is
//! loading or resident, plus bytes reserved by writes in progress.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::address::{ChunkGeometry, Coordinates, StorageAddress};
use super::chunk::{
    ChunkMapEntry, ChunkState, NewChunk, PersistentChunk, ReadOnlyChunkView, WritableChunkView,
};
use super::compression::CompressionMethod;
use super::datastore::{DataStore, DataStores, Extent, FileDataStore, MemDataStore};
use super::descriptors::DescriptorTable;
use super::header::{ChunkDescriptor, ChunkFlags, ChunkHeader};
use super::lru::{ChunkId, ChunkTable};
use crate::config::{ChunkVaultConfig, OverflowPolicy};
use crate::delta::version::{self, DeltaOutcome, NewVersion};
use crate::delta::DeltaBlock;
use crate::error::{Error, Result};
use crate::query::QueryContext;
use crate::replication::{Placement, ReplicaMessage, ReplicationItem, ReplicationManager, Transport};
use crate::schema::{ArrayDesc, AttributeDesc, ElementType};

/// Number of per-slot write latches
const SLOT_LATCHES: usize = 101;

/// How a written version ended up on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoredAs {
    /// Stored on its own
    Materialized,
    /// Became the head of the slot's delta block
    Delta,
}

/// Outcome of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub version: u64,
    pub stored_as: StoredAs,
    /// Bytes written to the data store
    pub stored_bytes: u64,
    /// Replicas sent
    pub replicas: usize,
    /// Replicas that could not be delivered
    pub failed_replicas: usize,
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub used: u64,
    pub ceiling: u64,
    /// Chunks known to the engine, resident or not
    pub chunks: usize,
    pub resident: usize,
    pub pinned: usize,
    pub hits: u64,
    pub loads: u64,
    pub evictions: u64,
}

/// One chunk map entry, flattened for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMapInfo {
    pub address: StorageAddress,
    /// 0 for the current entry, then one per prior link
    pub depth: usize,
    /// Newest version held by the entry
    pub version: u64,
    pub tombstone: bool,
    pub resident: bool,
    pub pins: u32,
    pub size: u64,
    pub compressed_size: u64,
    /// Versions in the block, when resident
    pub versions: Option<Vec<u64>>,
}

#[derive(Default)]
struct CacheState {
    chunks: ChunkTable,
    maps: HashMap<u64, BTreeMap<StorageAddress, ChunkMapEntry>>,
    used: u64,
    /// Reserved by writes that have not reached the cache yet
    pending: u64,
    ceiling: u64,
    hits: u64,
    loads: u64,
    evictions: u64,
    closed: bool,
}

#[derive(Clone, Copy)]
enum Residency {
    Absent,
    Loading,
    Ready,
}

impl Residency {
    fn of(chunk: &PersistentChunk) -> Self {
        match chunk.state {
            ChunkState::Absent => Residency::Absent,
            ChunkState::Loading => Residency::Loading,
            ChunkState::Ready(_) => Residency::Ready,
        }
    }
}

/// On-disk space released by a sweep
enum Reclaim {
    Chunk(ChunkHeader),
    Tombstone(u64),
}

impl Reclaim {
    fn hdr_pos(&self) -> u64 {
        match self {
            Reclaim::Chunk(header) => header.pos.hdr_pos,
            Reclaim::Tombstone(pos) => *pos,
        }
    }
}

/// Pin taken by the engine for its own use; released on drop
struct Pin<'a> {
    engine: &'a StorageEngine,
    id: ChunkId,
    generation: u64,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.engine.unpin(self.id, self.generation);
    }
}

/// Current block of a slot, pinned for the duration of a write
struct Prior<'a> {
    _pin: Pin<'a>,
    id: ChunkId,
    header: ChunkHeader,
    block: DeltaBlock,
}

/// Chunk storage engine for one instance
pub struct StorageEngine {
    config: ChunkVaultConfig,
    instance_id: u32,
    state: Mutex<CacheState>,
    /// Signalled when a load finishes
    loaded: Condvar,
    /// Signalled when cache bytes are released or pins dropped
    headroom: Condvar,
    stores: DataStores,
    descriptors: DescriptorTable,
    replication: ReplicationManager,
    placement: Placement,
    slot_latches: Vec<Mutex<()>>,
}

impl StorageEngine {
    /// Open the engine on the directory named by `config`
    pub fn open(config: ChunkVaultConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.data_dir())?;
        let descriptor_store: Arc<dyn DataStore> =
            Arc::new(FileDataStore::open_path(config.descriptor_path(), 0)?);
        let stores = DataStores::on_disk(config.datastore_dir());
        Self::open_with(config, transport, descriptor_store, stores)
    }

    /// Engine backed entirely by memory
    pub fn in_memory(config: ChunkVaultConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::open_with(
            config,
            transport,
            Arc::new(MemDataStore::new(0)),
            DataStores::in_memory(),
        )
    }

    /// Open over explicit stores
    pub fn open_with(
        config: ChunkVaultConfig,
        transport: Arc<dyn Transport>,
        descriptor_store: Arc<dyn DataStore>,
        stores: DataStores,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = config.node.instance_id;
        let (descriptors, live) = DescriptorTable::open(descriptor_store, instance_id)?;
        let recovered = live.len();

        let mut state = Self::rebuild(live);
        state.ceiling = config.cache_bytes();

        info!(
            "Storage engine for instance {} opened: {} descriptors, {} arrays, cache ceiling {} bytes",
            instance_id,
            recovered,
            state.maps.len(),
            state.ceiling
        );

        Ok(Self {
            instance_id,
            replication: ReplicationManager::new(transport, config.poll_interval()),
            placement: Placement::new(config.cluster.instances, config.cluster.redundancy),
            state: Mutex::new(state),
            loaded: Condvar::new(),
            headroom: Condvar::new(),
            stores,
            descriptors,
            slot_latches: (0..SLOT_LATCHES).map(|_| Mutex::new(())).collect(),
            config,
        })
    }

    /// Build the chunk map from recovered descriptors. Every chunk starts
    /// out absent; several descriptors for one address chain oldest-last.
    fn rebuild(descriptors: Vec<ChunkDescriptor>) -> CacheState {
        let mut state = CacheState::default();
        let mut by_address: BTreeMap<StorageAddress, Vec<ChunkDescriptor>> = BTreeMap::new();
        for desc in descriptors {
            by_address.entry(desc.address()).or_default().push(desc);
        }

        for (address, mut versions) in by_address {
            versions.sort_by_key(|d| d.header.arr_id);
            let mut top: Option<ChunkMapEntry> = None;
            for desc in versions {
                let prior = top.take().map(Box::new);
                let entry = if desc.header.is_tombstone() {
                    ChunkMapEntry::Tombstone {
                        version: desc.header.arr_id,
                        hdr_pos: desc.header.pos.hdr_pos,
                        prior,
                    }
                } else {
                    let mut chunk = PersistentChunk::new(address.clone(), desc.header);
                    if !chunk.header.is(ChunkFlags::DELTA) {
                        chunk.oldest_version = Some(chunk.header.arr_id);
                    }
                    let (id, _) = state.chunks.insert(chunk);
                    ChunkMapEntry::Live { chunk: id, prior }
                };
                top = Some(entry);
            }
            if let Some(top) = top {
                state.maps.entry(address.uaid).or_default().insert(address, top);
            }
        }
        state
    }

    /// Flush everything and stop replication. Later calls fail with
    /// `ShuttingDown`.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.loaded.notify_all();
        self.headroom.notify_all();
        self.replication.stop()?;
        self.stores.flush_all()?;
        self.descriptors.flush()?;
        info!("Storage engine for instance {} closed", self.instance_id);
        Ok(())
    }

    pub fn config(&self) -> &ChunkVaultConfig {
        &self.config
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Replication manager; the network layer feeds capacity and
    /// lost-instance notifications through it
    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("chunk cache lock poisoned".into()))
    }

    fn check_open(&self) -> Result<()> {
        if self.lock()?.closed {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn latch(&self, address: &StorageAddress) -> Result<MutexGuard<'_, ()>> {
        let slot = (address.coordinate_hash() % self.slot_latches.len() as u64) as usize;
        self.slot_latches[slot]
            .lock()
            .map_err(|_| Error::Internal("slot latch poisoned".into()))
    }

    fn attribute<'d>(desc: &'d ArrayDesc, address: &StorageAddress) -> Result<&'d AttributeDesc> {
        if desc.uaid != address.uaid {
            return Err(Error::Internal(format!(
                "address {} does not belong to array {}",
                address, desc.uaid
            )));
        }
        desc.attribute(address.att_id).ok_or_else(|| {
            Error::Internal(format!("array {} has no attribute {}", desc.name, address.att_id))
        })
    }

    /// Newest version held by a map entry
    fn entry_newest(chunks: &ChunkTable, entry: &ChunkMapEntry) -> u64 {
        match entry {
            ChunkMapEntry::Live { chunk, .. } => chunks.get(*chunk).map_or(0, |c| c.newest_version()),
            ChunkMapEntry::Tombstone { version, .. } => *version,
        }
    }

    fn is_busy(chunks: &ChunkTable, entry: &ChunkMapEntry) -> bool {
        match entry {
            ChunkMapEntry::Live { chunk, .. } => chunks
                .get(*chunk)
                .map_or(false, |c| c.pins > 0 || matches!(c.state, ChunkState::Loading)),
            ChunkMapEntry::Tombstone { .. } => false,
        }
    }

    /// Find the chunk that serves `version`, walking prior links
    fn locate(
        chunks: &ChunkTable,
        entry: &ChunkMapEntry,
        address: &StorageAddress,
        version: u64,
    ) -> Result<ChunkId> {
        let not_found = || Error::NotFound {
            address: address.clone(),
        };
        let mut cur = entry;
        loop {
            match cur {
                ChunkMapEntry::Tombstone {
                    version: deleted,
                    prior,
                    ..
                } => {
                    if version >= *deleted {
                        return Err(Error::Deleted {
                            address: address.clone(),
                            version: *deleted,
                        });
                    }
                    cur = prior.as_deref().ok_or_else(not_found)?;
                }
                ChunkMapEntry::Live { chunk, prior } => {
                    let c = chunks
                        .get(*chunk)
                        .ok_or_else(|| Error::Internal(format!("dangling chunk id for {}", address)))?;
                    if version >= c.newest_version() {
                        return Ok(*chunk);
                    }
                    let prior_covers = prior
                        .as_deref()
                        .map_or(false, |p| Self::entry_newest(chunks, p) >= version);
                    let before_oldest = c.oldest_version.map_or(false, |oldest| version < oldest);
                    if !prior_covers && !before_oldest {
                        // Inside this block, or unknown until it is loaded
                        return Ok(*chunk);
                    }
                    cur = prior.as_deref().ok_or_else(not_found)?;
                }
            }
        }
    }

    /// Pin chunk `id`, loading it if needed. Returns the guard and the
    /// chunk's generation.
    fn pin_id<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        id: ChunkId,
        element: ElementType,
        query: &Arc<QueryContext>,
    ) -> Result<(MutexGuard<'a, CacheState>, u64)> {
        let generation = state
            .chunks
            .generation(id)
            .ok_or_else(|| Error::Internal("pin of a removed chunk".into()))?;
        loop {
            query.validate()?;
            if state.closed {
                return Err(Error::ShuttingDown);
            }
            let residency = state
                .chunks
                .get_checked(id, generation)
                .map(|chunk| Residency::of(chunk))
                .ok_or_else(|| Error::Internal("chunk removed while pinning".into()))?;

            match residency {
                Residency::Ready => {
                    let first = match state.chunks.get_checked(id, generation) {
                        Some(chunk) => {
                            chunk.pins += 1;
                            chunk.pins == 1
                        }
                        None => false,
                    };
                    if first {
                        state.chunks.unlink(id);
                    }
                    state.hits += 1;
                    trace!("Pinned chunk {}", id);
                    return Ok((state, generation));
                }
                Residency::Loading => {
                    if let Some(chunk) = state.chunks.get_checked(id, generation) {
                        chunk.waiting = true;
                    }
                    state = self
                        .loaded
                        .wait_timeout(state, self.config.poll_interval())
                        .map_err(|_| Error::Internal("chunk cache lock poisoned".into()))?
                        .0;
                }
                Residency::Absent => {
                    let state = self.load(state, id, generation, element, query)?;
                    return Ok((state, generation));
                }
            }
        }
    }

    /// Read an absent chunk in. On success the chunk is ready with one pin.
    fn load<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        id: ChunkId,
        generation: u64,
        element: ElementType,
        query: &Arc<QueryContext>,
    ) -> Result<MutexGuard<'a, CacheState>> {
        let (header, address) = {
            let chunk = state
                .chunks
                .get_checked(id, generation)
                .ok_or_else(|| Error::Internal("chunk removed before load".into()))?;
            chunk.state = ChunkState::Loading;
            (chunk.header.clone(), chunk.address.clone())
        };
        let size = header.size;

        let state = match self.reserve(state, size, query) {
            Ok(state) => state,
            Err(e) => {
                let mut state = self.lock()?;
                let wake = match state.chunks.get_checked(id, generation) {
                    Some(chunk) => {
                        chunk.state = ChunkState::Absent;
                        std::mem::take(&mut chunk.waiting)
                    }
                    None => true,
                };
                drop(state);
                if wake {
                    self.loaded.notify_all();
                }
                return Err(e);
            }
        };
        drop(state);

        debug!("Loading {} version {} ({} bytes)", address, header.arr_id, size);
        let result = self.read_block(&header, element);

        let mut state = self.lock()?;
        let mut wake = true;
        let outcome = match state.chunks.get_checked(id, generation) {
            Some(chunk) => {
                wake = std::mem::take(&mut chunk.waiting);
                match result {
                    Ok(block) => {
                        chunk.oldest_version = Some(block.oldest_version());
                        chunk.state = ChunkState::Ready(block);
                        chunk.pins = 1;
                        Ok(())
                    }
                    Err(e) => {
                        chunk.state = ChunkState::Absent;
                        Err(e)
                    }
                }
            }
            None => Err(Error::Internal(format!("{} removed while loading", address))),
        };

        match outcome {
            Ok(()) => {
                state.loads += 1;
                if wake {
                    self.loaded.notify_all();
                }
                Ok(state)
            }
            Err(e) => {
                state.used = state.used.saturating_sub(size);
                drop(state);
                if e.is_corruption() {
                    warn!("Stored block for {} is damaged: {}", address, e);
                } else {
                    warn!("Failed to load {}: {}", address, e);
                }
                if wake {
                    self.loaded.notify_all();
                }
                self.headroom.notify_all();
                Err(e)
            }
        }
    }

    /// Read and decode the stored block described by `header`
    fn read_block(&self, header: &ChunkHeader, element: ElementType) -> Result<DeltaBlock> {
        let store = self.stores.get(header.pos.ds_guid)?;
        let stored = store.read_at(header.pos.offs, header.compressed_size as usize)?;
        let bytes = Bytes::from(header.compression()?.decompress(&stored, header.size as usize)?);
        if header.is(ChunkFlags::DELTA) {
            DeltaBlock::parse(bytes)
        } else {
            version::single(
                &NewVersion {
                    version: header.arr_id,
                    data: bytes,
                    sparse: header.is(ChunkFlags::SPARSE),
                    rle: header.is(ChunkFlags::RLE),
                },
                element,
            )
        }
    }

    /// Free bytes for `size` more, evicting unpinned chunks from the cold
    /// end. What happens when pinned chunks leave too little room depends
    /// on the overflow policy.
    fn reserve<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        size: u64,
        query: &Arc<QueryContext>,
    ) -> Result<MutexGuard<'a, CacheState>> {
        loop {
            while state.used + size > state.ceiling {
                let Some(victim) = state.chunks.pop_lru() else {
                    break;
                };
                Self::evict(&mut state, victim);
            }
            if state.used + size <= state.ceiling || state.used == 0 {
                break;
            }

            match self.config.cache.overflow {
                OverflowPolicy::Tolerate => {
                    trace!(
                        "Cache over ceiling: {} + {} > {}",
                        state.used,
                        size,
                        state.ceiling
                    );
                    break;
                }
                OverflowPolicy::Fail => {
                    return Err(Error::CacheExhausted {
                        requested: size,
                        used: state.used,
                        ceiling: state.ceiling,
                    });
                }
                OverflowPolicy::Block => {
                    query.validate()?;
                    if state.closed {
                        return Err(Error::ShuttingDown);
                    }
                    debug!("Waiting for {} bytes of cache headroom", size);
                    state = self
                        .headroom
                        .wait_timeout(state, self.config.poll_interval())
                        .map_err(|_| Error::Internal("chunk cache lock poisoned".into()))?
                        .0;
                }
            }
        }
        state.used += size;
        Ok(state)
    }

    fn evict(state: &mut CacheState, id: ChunkId) {
        let Some(chunk) = state.chunks.get_mut(id) else {
            return;
        };
        if chunk.pins > 0 || !chunk.is_resident() {
            return;
        }
        chunk.state = ChunkState::Absent;
        let size = chunk.cache_size();
        debug!("Evicted {} ({} bytes)", chunk.address, size);
        state.used = state.used.saturating_sub(size);
        state.evictions += 1;
    }

    fn release_pin(state: &mut CacheState, id: ChunkId, generation: u64) {
        let Some(chunk) = state.chunks.get_checked(id, generation) else {
            return;
        };
        if chunk.pins == 0 {
            return;
        }
        chunk.pins -= 1;
        if chunk.pins == 0 && chunk.is_resident() {
            state.chunks.link_front(id);
        }
        trace!("Unpinned chunk {}", id);
    }

    /// Drop one pin on `id`; a stale generation is ignored
    pub(crate) fn unpin(&self, id: ChunkId, generation: u64) {
        if let Ok(mut state) = self.state.lock() {
            Self::release_pin(&mut state, id, generation);
        }
        self.headroom.notify_all();
    }

    /// Change the cache ceiling, evicting down to it where possible
    pub fn set_cache_ceiling(&self, bytes: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.ceiling = bytes;
        while state.used > state.ceiling {
            let Some(victim) = state.chunks.pop_lru() else {
                break;
            };
            Self::evict(&mut state, victim);
        }
        drop(state);
        self.headroom.notify_all();
        Ok(())
    }

    /// Pin the newest stored version not after `version`
    pub fn read<'a>(
        &'a self,
        desc: &ArrayDesc,
        address: &StorageAddress,
        version: u64,
        query: &Arc<QueryContext>,
    ) -> Result<ReadOnlyChunkView<'a>> {
        query.validate()?;
        self.check_open()?;
        let element = Self::attribute(desc, address)?.element_type;

        let mut state = self.lock()?;
        let (id, generation) = loop {
            let id = {
                let entry = state
                    .maps
                    .get(&address.uaid)
                    .and_then(|m| m.get(address))
                    .ok_or_else(|| Error::NotFound {
                        address: address.clone(),
                    })?;
                Self::locate(&state.chunks, entry, address, version)?
            };
            let (pinned, generation) = self.pin_id(state, id, element, query)?;
            state = pinned;

            let too_old = state
                .chunks
                .get(id)
                .and_then(|c| c.oldest_version)
                .map_or(false, |oldest| version < oldest);
            if !too_old {
                break (id, generation);
            }
            // Now that the block is known, locate skips it
            Self::release_pin(&mut state, id, generation);
        };

        let snapshot = state.chunks.get_mut(id).and_then(|chunk| {
            chunk.set_geometry(desc);
            Some((
                chunk.block()?.clone(),
                chunk.header.clone(),
                chunk.geometry.clone()?,
            ))
        });
        drop(state);
        let Some((block, header, geometry)) = snapshot else {
            self.unpin(id, generation);
            return Err(Error::Internal(format!("{} pinned without data", address)));
        };

        let mut view = ReadOnlyChunkView {
            engine: self,
            id,
            generation,
            address: address.clone(),
            version,
            data: Bytes::new(),
            sparse: false,
            rle: false,
            header,
            geometry,
        };
        let record = block
            .index_at_or_before(version)
            .and_then(|i| block.record(i))
            .copied()
            .ok_or_else(|| Error::NotFound {
                address: address.clone(),
            })?;
        view.version = record.version;
        view.sparse = record.sparse;
        view.rle = record.rle;
        view.data = version::get_version(&block, version, &view.geometry)?;
        trace!("Read {} version {} (asked {})", address, record.version, version);
        Ok(view)
    }

    /// Buffer for a new version of `address`
    pub fn new_chunk<'a>(&'a self, desc: &'a ArrayDesc, address: StorageAddress) -> WritableChunkView<'a> {
        WritableChunkView::new(self, desc, address)
    }

    /// Check the version against the slot and pin its current block when a
    /// delta against it may be stored
    fn current_block(
        &self,
        address: &StorageAddress,
        version: u64,
        element: ElementType,
        query: &Arc<QueryContext>,
    ) -> Result<Option<Prior<'_>>> {
        let state = self.lock()?;
        let Some(top) = state.maps.get(&address.uaid).and_then(|m| m.get(address)) else {
            return Ok(None);
        };
        let newest = Self::entry_newest(&state.chunks, top);
        if version <= newest {
            return Err(Error::ChunkExists(format!(
                "{} already holds version {}, cannot write version {}",
                address, newest, version
            )));
        }
        let id = match top {
            ChunkMapEntry::Live { chunk, .. } if self.config.delta.enabled => *chunk,
            _ => return Ok(None),
        };

        let (state, generation) = self.pin_id(state, id, element, query)?;
        let snapshot = state
            .chunks
            .get(id)
            .and_then(|c| Some((c.header.clone(), c.block()?.clone())));
        drop(state);
        let pin = Pin {
            engine: self,
            id,
            generation,
        };
        let (header, block) =
            snapshot.ok_or_else(|| Error::Internal(format!("{} pinned without data", address)))?;
        Ok(Some(Prior {
            _pin: pin,
            id,
            header,
            block,
        }))
    }

    /// Store `chunk` as `version` of `address`.
    ///
    /// When the slot already holds a block and a delta against it is worth
    /// keeping, the new version becomes the head of that block and replaces
    /// it on disk. Otherwise the version is stored on its own on top of the
    /// slot's existing history. Replicas are sent before the local write and
    /// waited for after it; replica failures are recorded on the query.
    pub fn write(
        &self,
        desc: &ArrayDesc,
        address: &StorageAddress,
        chunk: NewChunk,
        version: u64,
        query: &Arc<QueryContext>,
    ) -> Result<WriteReport> {
        query.validate()?;
        self.check_open()?;
        if version == 0 {
            return Err(Error::Internal("version 0 marks free descriptor slots".into()));
        }
        let attribute = Self::attribute(desc, address)?;
        let element = attribute.element_type;
        let geometry = ChunkGeometry::new(desc, &address.coords);
        let _latch = self.latch(address)?;

        let prior = self.current_block(address, version, element, query)?;
        let new = NewVersion {
            version,
            data: chunk.data.clone(),
            sparse: chunk.sparse,
            rle: chunk.rle,
        };
        let (block, stored_as) = match &prior {
            Some(prior) => match version::new_version(&prior.block, &new, element, &geometry)? {
                DeltaOutcome::Delta(block) => (block, StoredAs::Delta),
                DeltaOutcome::Materialize => (version::single(&new, element)?, StoredAs::Materialized),
            },
            None => (version::single(&new, element)?, StoredAs::Materialized),
        };
        let replaces = match stored_as {
            StoredAs::Delta => prior.as_ref(),
            StoredAs::Materialized => None,
        };

        // A lone version is stored as plain chunk bytes
        let multi = block.num_versions() > 1;
        let raw = if multi { block.as_bytes().clone() } else { block.head() };
        let method = attribute.compression.unwrap_or(self.config.compression.method);
        let (payload, method) = match method.compress(&raw) {
            Some(compressed) => (compressed, method),
            None => (raw.to_vec(), CompressionMethod::None),
        };

        let mut header = ChunkHeader::new(address, version, self.instance_id);
        header.compressed_size = payload.len() as u64;
        header.size = raw.len() as u64;
        header.compression_method = method.tag();
        header.flags = chunk.flags();
        header.flags.set(ChunkFlags::DELTA, multi);
        header.n_elems = chunk.n_elems;

        let replicas = self.replicate(address, query, || ReplicaMessage::Chunk {
            address: address.clone(),
            version,
            source_instance: self.instance_id,
            compression: header.compression_method,
            flags: header.flags,
            size: header.size,
            n_elems: header.n_elems,
            supersedes_prior: replaces.is_some(),
            data: payload.clone(),
        })?;

        // A superseded block gives its own bytes back when it is replaced
        let size = header.size;
        let charge = match replaces {
            Some(old) => size.saturating_sub(old.header.size),
            None => size,
        };
        {
            let state = self.lock()?;
            match self.reserve(state, charge, query) {
                Ok(mut state) => state.pending += charge,
                Err(e) => {
                    self.abort_replicas(&replicas);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.persist(address, &mut header, &payload, replaces.map(|p| &p.header)) {
            warn!("Write of {} version {} failed: {}", address, version, e);
            self.abort_replicas(&replicas);
            if let Ok(mut state) = self.lock() {
                state.pending = state.pending.saturating_sub(charge);
                state.used = state.used.saturating_sub(charge);
            }
            self.headroom.notify_all();
            return Err(e);
        }

        {
            let mut state = self.lock()?;
            state.pending = state.pending.saturating_sub(charge);
            let oldest = block.oldest_version();
            match replaces {
                Some(old) => {
                    let chunk = state
                        .chunks
                        .get_mut(old.id)
                        .ok_or_else(|| Error::Internal(format!("{} vanished while pinned", address)))?;
                    chunk.header = header;
                    chunk.oldest_version = Some(oldest);
                    chunk.state = ChunkState::Ready(block);
                    state.used = (state.used + size).saturating_sub(old.header.size + charge);
                }
                None => {
                    let mut chunk = PersistentChunk::new(address.clone(), header);
                    chunk.oldest_version = Some(oldest);
                    chunk.geometry = Some(geometry);
                    chunk.state = ChunkState::Ready(block);
                    let (id, _) = state.chunks.insert(chunk);
                    state.chunks.link_front(id);
                    let map = state.maps.entry(address.uaid).or_default();
                    let prior_entry = map.remove(address).map(Box::new);
                    map.insert(
                        address.clone(),
                        ChunkMapEntry::Live {
                            chunk: id,
                            prior: prior_entry,
                        },
                    );
                }
            }
        }
        drop(prior);
        self.headroom.notify_all();

        let failed_replicas = self.await_replicas(address, &replicas, query)?;
        debug!(
            "Wrote {} version {} as {:?} ({} bytes on disk)",
            address,
            version,
            stored_as,
            payload.len()
        );
        Ok(WriteReport {
            version,
            stored_as,
            stored_bytes: payload.len() as u64,
            replicas: replicas.len(),
            failed_replicas,
        })
    }

    /// Write `payload` to a fresh extent and point the descriptor at it.
    /// When `replaces` is given its descriptor slot is rewritten in place
    /// and its old extent freed; the caller keeps that chunk from being
    /// loaded until its in-memory header is swapped.
    fn persist(
        &self,
        address: &StorageAddress,
        header: &mut ChunkHeader,
        payload: &[u8],
        replaces: Option<&ChunkHeader>,
    ) -> Result<()> {
        let store = self.stores.get(address.uaid)?;
        let extent = store.allocate(payload.len() as u64)?;
        header.pos.offs = extent.offset;
        header.allocated_size = extent.allocated;

        let mut descriptor = ChunkDescriptor {
            header: header.clone(),
            coords: address.coords.clone(),
        };
        let written = store
            .write_at(extent.offset, payload)
            .and_then(|()| match replaces {
                Some(old) => {
                    descriptor.header.pos.hdr_pos = old.pos.hdr_pos;
                    self.descriptors.update(&descriptor)
                }
                None => self.descriptors.insert(&mut descriptor),
            });
        if let Err(e) = written {
            if let Err(free_err) = store.free(extent) {
                warn!("Could not free extent at {} in store {}: {}", extent.offset, address.uaid, free_err);
            }
            return Err(e);
        }
        header.pos.hdr_pos = descriptor.header.pos.hdr_pos;

        if let Some(old) = replaces {
            let old_extent = Extent {
                offset: old.pos.offs,
                allocated: old.allocated_size,
            };
            if let Err(e) = store.free(old_extent) {
                warn!("Leaked extent at {} in store {}: {}", old.pos.offs, address.uaid, e);
            }
        }
        Ok(())
    }

    /// Queue replicas of a chunk or tombstone for every replica instance
    fn replicate(
        &self,
        address: &StorageAddress,
        query: &Arc<QueryContext>,
        message: impl FnOnce() -> ReplicaMessage,
    ) -> Result<Vec<Arc<ReplicationItem>>> {
        let targets = self.placement.replicas(address, self.instance_id);
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let payload = Bytes::from(message().to_bytes()?);
        let mut items = Vec::with_capacity(targets.len());
        for instance in targets {
            let item = ReplicationItem::new(instance, payload.clone(), query);
            if let Err(e) = self.replication.send(&item) {
                debug!("Replica of {} for instance {} not queued: {}", address, instance, e);
            }
            items.push(item);
        }
        Ok(items)
    }

    fn abort_replicas(&self, items: &[Arc<ReplicationItem>]) {
        for item in items {
            if let Err(e) = self.replication.abort(item) {
                debug!("Could not abort replica for instance {}: {}", item.instance(), e);
            }
        }
    }

    /// Wait for every replica; returns how many failed
    fn await_replicas(
        &self,
        address: &StorageAddress,
        items: &[Arc<ReplicationItem>],
        query: &Arc<QueryContext>,
    ) -> Result<usize> {
        let mut failed = 0;
        for item in items {
            match self.replication.wait(item) {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Replica of {} to instance {} failed: {}", address, item.instance(), e);
                    query.record_replica_failure(item.instance(), e.to_string());
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    /// Persist a tombstone descriptor and put it on top of the slot
    fn record_tombstone(&self, address: &StorageAddress, version: u64, owner: u32) -> Result<()> {
        let mut header = ChunkHeader::new(address, version, owner);
        header.flags = ChunkFlags::TOMBSTONE;
        let mut descriptor = ChunkDescriptor {
            header,
            coords: address.coords.clone(),
        };
        self.descriptors.insert(&mut descriptor)?;

        let mut state = self.lock()?;
        let map = state.maps.entry(address.uaid).or_default();
        let prior = map.remove(address).map(Box::new);
        map.insert(
            address.clone(),
            ChunkMapEntry::Tombstone {
                version,
                hdr_pos: descriptor.header.pos.hdr_pos,
                prior,
            },
        );
        Ok(())
    }

    /// Delete `address` as of `version`. Reads at or after `version` fail
    /// with `Deleted`; earlier versions stay readable. Deleting a slot that
    /// is already deleted is a no-op.
    pub fn delete(&self, address: &StorageAddress, version: u64, query: &Arc<QueryContext>) -> Result<()> {
        query.validate()?;
        self.check_open()?;
        if version == 0 {
            return Err(Error::Internal("version 0 marks free descriptor slots".into()));
        }
        let _latch = self.latch(address)?;

        let newest = {
            let state = self.lock()?;
            match state.maps.get(&address.uaid).and_then(|m| m.get(address)) {
                None => {
                    return Err(Error::NotFound {
                        address: address.clone(),
                    })
                }
                Some(ChunkMapEntry::Tombstone { .. }) => return Ok(()),
                Some(top) => Self::entry_newest(&state.chunks, top),
            }
        };
        if version <= newest {
            return Err(Error::ChunkExists(format!(
                "{} holds version {}, cannot delete it at version {}",
                address, newest, version
            )));
        }

        let replicas = self.replicate(address, query, || ReplicaMessage::Tombstone {
            address: address.clone(),
            version,
            source_instance: self.instance_id,
        })?;
        if let Err(e) = self.record_tombstone(address, version, self.instance_id) {
            self.abort_replicas(&replicas);
            return Err(e);
        }
        self.await_replicas(address, &replicas, query)?;
        debug!("Deleted {} at version {}", address, version);
        Ok(())
    }

    /// Delete every attribute of the chunk at `coords`
    pub fn remove_chunk_version(
        &self,
        desc: &ArrayDesc,
        coords: &[i64],
        version: u64,
        query: &Arc<QueryContext>,
    ) -> Result<()> {
        for attribute in &desc.attributes {
            let address = StorageAddress::new(desc.uaid, attribute.id, coords.to_vec());
            match self.delete(&address, version, query) {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete every live chunk of `desc` whose coordinates are not in
    /// `live`. Returns how many chunks were deleted.
    pub fn remove_dead_chunks(
        &self,
        desc: &ArrayDesc,
        live: &HashSet<Coordinates>,
        version: u64,
        query: &Arc<QueryContext>,
    ) -> Result<usize> {
        let dead: Vec<StorageAddress> = {
            let state = self.lock()?;
            state
                .maps
                .get(&desc.uaid)
                .map(|m| {
                    m.iter()
                        .filter(|(address, entry)| !entry.is_tombstone() && !live.contains(&address.coords))
                        .map(|(address, _)| address.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for address in &dead {
            self.delete(address, version, query)?;
        }
        if !dead.is_empty() {
            info!(
                "Removed {} dead chunks from array {} at version {}",
                dead.len(),
                desc.name,
                version
            );
        }
        Ok(dead.len())
    }

    /// Move every chunk reachable from `entry` out of the table
    fn detach_chain(chunks: &mut ChunkTable, used: &mut u64, entry: &ChunkMapEntry, out: &mut Vec<Reclaim>) {
        for link in entry.chain() {
            match link {
                ChunkMapEntry::Live { chunk, .. } => {
                    if let Some(removed) = chunks.remove(*chunk) {
                        if removed.holds_reservation() {
                            *used = used.saturating_sub(removed.cache_size());
                        }
                        out.push(Reclaim::Chunk(removed.header));
                    }
                }
                ChunkMapEntry::Tombstone { hdr_pos, .. } => out.push(Reclaim::Tombstone(*hdr_pos)),
            }
        }
    }

    fn reclaim(&self, items: &[Reclaim]) -> Result<()> {
        for item in items {
            if let Reclaim::Chunk(header) = item {
                let store = self.stores.get(header.pos.ds_guid)?;
                store.free(Extent {
                    offset: header.pos.offs,
                    allocated: header.allocated_size,
                })?;
            }
            self.descriptors.release(item.hdr_pos())?;
        }
        Ok(())
    }

    /// Free stored versions of array `uaid` that no read at or after
    /// `horizon` can reach. A slot whose current entry is a tombstone at or
    /// before the horizon goes away entirely. Slots with pinned or loading
    /// chunks are skipped. Returns the number of descriptors freed.
    pub fn remove_versions(&self, uaid: u64, horizon: u64) -> Result<usize> {
        let mut reclaimed = Vec::new();
        {
            let mut state = self.lock()?;
            let CacheState { chunks, maps, used, .. } = &mut *state;
            let Some(map) = maps.get_mut(&uaid) else {
                return Ok(0);
            };

            let mut emptied = Vec::new();
            for (address, top) in map.iter_mut() {
                if top.chain().any(|e| Self::is_busy(chunks, e)) {
                    debug!("Skipping {} during version sweep: in use", address);
                    continue;
                }
                if top.is_tombstone() && Self::entry_newest(chunks, top) <= horizon {
                    emptied.push(address.clone());
                    continue;
                }
                let anchor = top
                    .chain()
                    .position(|e| Self::entry_newest(chunks, e) <= horizon);
                if let Some(dead) = anchor.and_then(|depth| top.split_off(depth)) {
                    Self::detach_chain(chunks, used, &dead, &mut reclaimed);
                }
            }
            for address in emptied {
                if let Some(entry) = map.remove(&address) {
                    Self::detach_chain(chunks, used, &entry, &mut reclaimed);
                }
            }
            if map.is_empty() {
                maps.remove(&uaid);
            }
        }
        self.headroom.notify_all();

        self.reclaim(&reclaimed)?;
        if !reclaimed.is_empty() {
            info!(
                "Freed {} stored versions of array {} older than {}",
                reclaimed.len(),
                uaid,
                horizon
            );
        }
        Ok(reclaimed.len())
    }

    /// Forget array `uaid` and delete its data store. Fails with `InUse`
    /// while any of its chunks is pinned. Returns the descriptors freed.
    pub fn drop_array(&self, uaid: u64) -> Result<usize> {
        let mut reclaimed = Vec::new();
        {
            let mut state = self.lock()?;
            let busy = state.maps.get(&uaid).map_or(0, |m| {
                m.values()
                    .flat_map(|e| e.chain())
                    .filter(|e| Self::is_busy(&state.chunks, e))
                    .count()
            });
            if busy > 0 {
                return Err(Error::InUse(format!(
                    "array {} has {} chunks pinned or loading",
                    uaid, busy
                )));
            }
            let CacheState { chunks, maps, used, .. } = &mut *state;
            if let Some(map) = maps.remove(&uaid) {
                for entry in map.values() {
                    Self::detach_chain(chunks, used, entry, &mut reclaimed);
                }
            }
        }
        self.headroom.notify_all();

        for item in &reclaimed {
            self.descriptors.release(item.hdr_pos())?;
        }
        self.stores.remove(uaid)?;
        info!("Dropped array {} ({} descriptors)", uaid, reclaimed.len());
        Ok(reclaimed.len())
    }

    /// Store a replica received from a peer. The block is persisted exactly
    /// as shipped and is not cached or replicated further. Replicas that
    /// arrive twice are ignored.
    pub fn apply_replica(&self, payload: &[u8], query: &Arc<QueryContext>) -> Result<()> {
        query.validate()?;
        self.check_open()?;
        let message = ReplicaMessage::from_bytes(payload)?;
        let address = message.address().clone();
        let version = message.version();
        if version == 0 {
            return Err(Error::Internal(format!("replica of {} carries version 0", address)));
        }
        let _latch = self.latch(&address)?;

        let current = {
            let state = self.lock()?;
            match state.maps.get(&address.uaid).and_then(|m| m.get(&address)) {
                Some(top) if Self::entry_newest(&state.chunks, top) >= version => {
                    debug!("Ignoring replica of {} version {}: already stored", address, version);
                    return Ok(());
                }
                Some(ChunkMapEntry::Live { chunk, .. }) => {
                    state.chunks.get(*chunk).map(|c| (*chunk, c.header.clone()))
                }
                _ => None,
            }
        };

        match message {
            ReplicaMessage::Tombstone { source_instance, .. } => {
                self.record_tombstone(&address, version, source_instance)?;
                debug!("Stored replica tombstone for {} at version {}", address, version);
            }
            ReplicaMessage::Chunk {
                source_instance,
                compression,
                flags,
                size,
                n_elems,
                supersedes_prior,
                data,
                ..
            } => {
                let mut header = ChunkHeader::new(&address, version, source_instance);
                header.compressed_size = data.len() as u64;
                header.size = size;
                header.compression_method = compression;
                header.flags = flags;
                header.n_elems = n_elems;

                match current.filter(|_| supersedes_prior) {
                    Some((id, old)) => {
                        self.claim_superseded(id, query)?;
                        match self.persist(&address, &mut header, &data, Some(&old)) {
                            Ok(()) => self.release_superseded(id, Some(header))?,
                            Err(e) => {
                                self.release_superseded(id, None)?;
                                return Err(e);
                            }
                        }
                    }
                    None => {
                        self.persist(&address, &mut header, &data, None)?;
                        self.install_replica(&address, header)?;
                    }
                }
                debug!("Stored replica of {} version {}", address, version);
            }
        }
        Ok(())
    }

    /// Wait until nobody reads the block a replica supersedes, then hold
    /// its chunk in `Loading` so its extent is not read while it is replaced
    fn claim_superseded(&self, id: ChunkId, query: &Arc<QueryContext>) -> Result<()> {
        let mut state = self.lock()?;
        loop {
            query.validate()?;
            if state.closed {
                return Err(Error::ShuttingDown);
            }
            let busy = state
                .chunks
                .get(id)
                .map(|c| c.pins > 0 || matches!(c.state, ChunkState::Loading))
                .ok_or_else(|| Error::Internal("superseded chunk removed while waiting".into()))?;
            if !busy {
                break;
            }
            state = self
                .headroom
                .wait_timeout(state, self.config.poll_interval())
                .map_err(|_| Error::Internal("chunk cache lock poisoned".into()))?
                .0;
        }

        state.chunks.unlink(id);
        let charge = match state.chunks.get_mut(id) {
            Some(chunk) => {
                let charge = (!chunk.holds_reservation()).then(|| chunk.cache_size());
                chunk.state = ChunkState::Loading;
                charge
            }
            None => None,
        };
        if let Some(bytes) = charge {
            state.used += bytes;
        }
        Ok(())
    }

    /// End a claim, swapping in `header` when the replacement was persisted
    fn release_superseded(&self, id: ChunkId, header: Option<ChunkHeader>) -> Result<()> {
        let mut state = self.lock()?;
        let mut released = 0;
        let mut wake = false;
        if let Some(chunk) = state.chunks.get_mut(id) {
            released = chunk.cache_size();
            wake = chunk.waiting;
            chunk.waiting = false;
            chunk.state = ChunkState::Absent;
            if let Some(header) = header {
                chunk.oldest_version = (!header.is(ChunkFlags::DELTA)).then_some(header.arr_id);
                chunk.header = header;
            }
        }
        state.used = state.used.saturating_sub(released);
        drop(state);
        if wake {
            self.loaded.notify_all();
        }
        self.headroom.notify_all();
        Ok(())
    }

    /// Put a persisted replica on top of its slot, non-resident
    fn install_replica(&self, address: &StorageAddress, header: ChunkHeader) -> Result<()> {
        let oldest = (!header.is(ChunkFlags::DELTA)).then_some(header.arr_id);
        let mut state = self.lock()?;
        let mut chunk = PersistentChunk::new(address.clone(), header);
        chunk.oldest_version = oldest;
        let (id, _) = state.chunks.insert(chunk);
        let map = state.maps.entry(address.uaid).or_default();
        let prior = map.remove(address).map(Box::new);
        map.insert(address.clone(), ChunkMapEntry::Live { chunk: id, prior });
        Ok(())
    }

    /// Origins of the live chunks of one attribute
    pub fn chunk_positions(&self, uaid: u64, att_id: u32) -> Result<Vec<Coordinates>> {
        let state = self.lock()?;
        Ok(state
            .maps
            .get(&uaid)
            .map(|m| {
                m.iter()
                    .filter(|(address, entry)| address.att_id == att_id && !entry.is_tombstone())
                    .map(|(address, _)| address.coords.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every descriptor in the descriptor table
    pub fn list_chunk_descriptors(&self) -> Result<Vec<ChunkDescriptor>> {
        self.descriptors.list()
    }

    /// Every chunk map entry, prior links included, ordered by address
    pub fn list_chunk_map(&self) -> Result<Vec<ChunkMapInfo>> {
        let state = self.lock()?;
        let mut uaids: Vec<u64> = state.maps.keys().copied().collect();
        uaids.sort_unstable();

        let mut out = Vec::new();
        for uaid in uaids {
            let Some(map) = state.maps.get(&uaid) else {
                continue;
            };
            for (address, top) in map {
                for (depth, entry) in top.chain().enumerate() {
                    let info = match entry {
                        ChunkMapEntry::Tombstone { version, .. } => ChunkMapInfo {
                            address: address.clone(),
                            depth,
                            version: *version,
                            tombstone: true,
                            resident: false,
                            pins: 0,
                            size: 0,
                            compressed_size: 0,
                            versions: None,
                        },
                        ChunkMapEntry::Live { chunk, .. } => {
                            let Some(c) = state.chunks.get(*chunk) else {
                                continue;
                            };
                            ChunkMapInfo {
                                address: address.clone(),
                                depth,
                                version: c.newest_version(),
                                tombstone: false,
                                resident: c.is_resident(),
                                pins: c.pins,
                                size: c.header.size,
                                compressed_size: c.header.compressed_size,
                                versions: c.block().map(|b| b.versions().collect()),
                            }
                        }
                    };
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.lock()?;
        let mut stats = CacheStats {
            used: state.used,
            ceiling: state.ceiling,
            chunks: state.chunks.len(),
            hits: state.hits,
            loads: state.loads,
            evictions: state.evictions,
            ..CacheStats::default()
        };
        for (_, chunk) in state.chunks.iter() {
            if chunk.is_resident() {
                stats.resident += 1;
            }
            if chunk.pins > 0 {
                stats.pinned += 1;
            }
        }
        Ok(stats)
    }

    /// Verify pin and accounting invariants
    pub fn check_invariants(&self) -> Result<()> {
        let state = self.lock()?;
        let mut held = 0;
        for (id, chunk) in state.chunks.iter() {
            if chunk.pins > 0 && !chunk.is_resident() {
                return Err(Error::Internal(format!("{} is pinned but not resident", chunk.address)));
            }
            if chunk.pins > 0 && state.chunks.in_lru(id) {
                return Err(Error::Internal(format!("{} is pinned but on the LRU list", chunk.address)));
            }
            if chunk.pins == 0 && chunk.is_resident() && !state.chunks.in_lru(id) {
                return Err(Error::Internal(format!("{} is resident but not evictable", chunk.address)));
            }
            if chunk.holds_reservation() {
                held += chunk.cache_size();
            }
        }
        if held + state.pending != state.used {
            return Err(Error::Internal(format!(
                "cache accounting drift: chunks hold {} bytes, {} pending, counter says {}",
                held, state.pending, state.used
            )));
        }
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Storage engine close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::MemoryTransport;
    use crate::schema::DimensionDesc;
    use std::thread;
    use std::time::Duration;

    fn array() -> ArrayDesc {
        ArrayDesc::new(
            7,
            "grid",
            vec![DimensionDesc::new("i", 0, 99, 10), DimensionDesc::new("j", 0, 99, 10)],
            vec![AttributeDesc::new(0, "v", ElementType::Fixed(8))],
        )
    }

    fn engine_with(config: ChunkVaultConfig) -> StorageEngine {
        StorageEngine::in_memory(config, Arc::new(MemoryTransport::new())).unwrap()
    }

    fn engine() -> StorageEngine {
        let mut config = ChunkVaultConfig::single_node("/unused");
        config.cache.size_mb = 16;
        engine_with(config)
    }

    fn cells(f: impl Fn(u64) -> u64) -> NewChunk {
        let data: Vec<u8> = (0..100).flat_map(|i| f(i).to_le_bytes()).collect();
        NewChunk::dense(data, 100)
    }

    fn values(data: &[u8]) -> Vec<u64> {
        data.chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_missing_chunk() {
        let engine = engine();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![0, 0]);
        assert!(matches!(
            engine.read(&array(), &addr, 1, &query),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_write_then_read_versions() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![0, 0]);

        let first = engine.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();
        assert_eq!(first.stored_as, StoredAs::Materialized);
        let second = engine.write(&desc, &addr, cells(|i| i + 1), 3, &query).unwrap();
        assert_eq!(second.stored_as, StoredAs::Delta);

        let v1 = engine.read(&desc, &addr, 1, &query).unwrap();
        assert_eq!(values(v1.data()), (0..100).collect::<Vec<_>>());
        assert_eq!(v1.version(), 1);
        drop(v1);

        // Version 2 was never written; the newest one before it is served
        let v2 = engine.read(&desc, &addr, 2, &query).unwrap();
        assert_eq!(v2.version(), 1);
        drop(v2);

        let v9 = engine.read(&desc, &addr, 9, &query).unwrap();
        assert_eq!(v9.version(), 3);
        assert_eq!(values(v9.data())[0], 1);
        assert_eq!(v9.first_position(false), &vec![0, 0]);
        assert_eq!(v9.last_position(false), &vec![9, 9]);
        drop(v9);

        assert!(matches!(
            engine.write(&desc, &addr, cells(|i| i), 3, &query),
            Err(Error::ChunkExists(_))
        ));
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_materialized_versions_chain() {
        let mut config = ChunkVaultConfig::single_node("/unused");
        config.cache.size_mb = 16;
        config.delta.enabled = false;
        let engine = engine_with(config);
        let desc = array();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![10, 0]);

        engine.write(&desc, &addr, cells(|_| 5), 2, &query).unwrap();
        let report = engine.write(&desc, &addr, cells(|_| 6), 4, &query).unwrap();
        assert_eq!(report.stored_as, StoredAs::Materialized);

        assert!(matches!(
            engine.read(&desc, &addr, 1, &query),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(values(engine.read(&desc, &addr, 3, &query).unwrap().data())[0], 5);
        assert_eq!(values(engine.read(&desc, &addr, 4, &query).unwrap().data())[0], 6);
        assert_eq!(engine.list_chunk_map().unwrap().len(), 2);
    }

    #[test]
    fn test_tombstone_semantics() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![0, 10]);

        engine.write(&desc, &addr, cells(|_| 1), 1, &query).unwrap();
        engine.delete(&addr, 3, &query).unwrap();
        // Deleting again is a no-op
        engine.delete(&addr, 4, &query).unwrap();

        assert!(engine.read(&desc, &addr, 2, &query).is_ok());
        for v in [3, 4, 10] {
            assert!(matches!(
                engine.read(&desc, &addr, v, &query),
                Err(Error::Deleted { version: 3, .. })
            ));
        }
        assert!(engine.chunk_positions(7, 0).unwrap().is_empty());

        // Written again after the delete
        engine.write(&desc, &addr, cells(|_| 2), 5, &query).unwrap();
        assert!(matches!(
            engine.read(&desc, &addr, 4, &query),
            Err(Error::Deleted { .. })
        ));
        assert_eq!(values(engine.read(&desc, &addr, 5, &query).unwrap().data())[0], 2);
        assert_eq!(engine.chunk_positions(7, 0).unwrap(), vec![vec![0, 10]]);
    }

    #[test]
    fn test_pinned_chunk_survives_eviction() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        let a = StorageAddress::new(7, 0, vec![0, 0]);
        let b = StorageAddress::new(7, 0, vec![0, 10]);

        engine.write(&desc, &a, cells(|i| i * 3), 1, &query).unwrap();
        engine.set_cache_ceiling(800).unwrap();
        let view = engine.read(&desc, &a, 1, &query).unwrap();

        // Tolerated overflow: a stays pinned and resident
        engine.write(&desc, &b, cells(|i| i), 1, &query).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.pinned, 1);
        assert_eq!(stats.used, 1600);
        assert_eq!(values(view.data())[2], 6);
        engine.check_invariants().unwrap();
        drop(view);

        engine.set_cache_ceiling(800).unwrap();
        assert_eq!(engine.stats().unwrap().used, 800);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_fail_policy() {
        let mut config = ChunkVaultConfig::single_node("/unused");
        config.cache.size_mb = 16;
        config.cache.overflow = OverflowPolicy::Fail;
        let engine = engine_with(config);
        let desc = array();
        let query = QueryContext::new();
        let a = StorageAddress::new(7, 0, vec![0, 0]);
        let b = StorageAddress::new(7, 0, vec![10, 10]);

        engine.write(&desc, &a, cells(|i| i), 1, &query).unwrap();
        engine.set_cache_ceiling(800).unwrap();
        let view = engine.read(&desc, &a, 1, &query).unwrap();
        assert!(matches!(
            engine.write(&desc, &b, cells(|i| i), 1, &query),
            Err(Error::CacheExhausted { requested: 800, .. })
        ));
        drop(view);
        engine.check_invariants().unwrap();
        engine.write(&desc, &b, cells(|i| i), 1, &query).unwrap();
    }

    #[test]
    fn test_block_policy_honours_abort() {
        let mut config = ChunkVaultConfig::single_node("/unused");
        config.cache.size_mb = 16;
        config.cache.overflow = OverflowPolicy::Block;
        config.replication.poll_interval_ms = 10;
        let engine = engine_with(config);
        let desc = array();
        let a = StorageAddress::new(7, 0, vec![0, 0]);
        let b = StorageAddress::new(7, 0, vec![10, 10]);

        let setup = QueryContext::new();
        engine.write(&desc, &a, cells(|i| i), 1, &setup).unwrap();
        engine.set_cache_ceiling(800).unwrap();
        let view = engine.read(&desc, &a, 1, &setup).unwrap();

        let query = QueryContext::new();
        thread::scope(|s| {
            let q = query.clone();
            s.spawn(move || {
                thread::sleep(Duration::from_millis(50));
                q.abort();
            });
            assert!(matches!(
                engine.write(&desc, &b, cells(|i| i), 1, &query),
                Err(Error::Cancelled)
            ));
        });
        drop(view);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_concurrent_readers_share_one_load() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![20, 20]);
        engine.write(&desc, &addr, cells(|i| i * i), 1, &query).unwrap();
        engine.set_cache_ceiling(0).unwrap();
        engine.set_cache_ceiling(1 << 20).unwrap();

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let view = engine.read(&desc, &addr, 1, &query).unwrap();
                    assert_eq!(values(view.data())[9], 81);
                });
            }
        });
        let stats = engine.stats().unwrap();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.pinned, 0);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_versions() {
        let mut config = ChunkVaultConfig::single_node("/unused");
        config.cache.size_mb = 16;
        config.delta.enabled = false;
        let engine = engine_with(config);
        let desc = array();
        let query = QueryContext::new();
        let a = StorageAddress::new(7, 0, vec![0, 0]);
        let b = StorageAddress::new(7, 0, vec![10, 0]);

        engine.write(&desc, &a, cells(|_| 1), 1, &query).unwrap();
        engine.write(&desc, &a, cells(|_| 2), 2, &query).unwrap();
        engine.write(&desc, &b, cells(|_| 3), 1, &query).unwrap();
        engine.delete(&b, 2, &query).unwrap();
        assert_eq!(engine.list_chunk_descriptors().unwrap().len(), 4);

        assert_eq!(engine.remove_versions(7, 2).unwrap(), 3);
        assert_eq!(engine.list_chunk_descriptors().unwrap().len(), 1);
        assert!(matches!(
            engine.read(&desc, &a, 1, &query),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            engine.read(&desc, &b, 5, &query),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(values(engine.read(&desc, &a, 2, &query).unwrap().data())[0], 2);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_drop_array_refuses_pinned() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        let addr = StorageAddress::new(7, 0, vec![0, 0]);
        engine.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();

        let view = engine.read(&desc, &addr, 1, &query).unwrap();
        assert!(matches!(engine.drop_array(7), Err(Error::InUse(_))));
        drop(view);

        assert_eq!(engine.drop_array(7).unwrap(), 1);
        assert!(engine.list_chunk_map().unwrap().is_empty());
        assert_eq!(engine.stats().unwrap().used, 0);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_dead_chunks() {
        let engine = engine();
        let desc = array();
        let query = QueryContext::new();
        for x in [0, 10, 20] {
            let addr = StorageAddress::new(7, 0, vec![x, 0]);
            engine.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();
        }
        let live: HashSet<Coordinates> = [vec![10, 0]].into_iter().collect();
        assert_eq!(engine.remove_dead_chunks(&desc, &live, 2, &query).unwrap(), 2);
        assert_eq!(engine.chunk_positions(7, 0).unwrap(), vec![vec![10, 0]]);
    }

    #[test]
    fn test_closed_engine_rejects_work() {
        let engine = engine();
        let query = QueryContext::new();
        engine.close().unwrap();
        let addr = StorageAddress::new(7, 0, vec![0, 0]);
        assert!(matches!(
            engine.write(&array(), &addr, cells(|i| i), 1, &query),
            Err(Error::ShuttingDown)
        ));
    }
}
