//! Descriptor table
//!
//! Persistent directory of every chunk version stored on this instance. It
//! starts with a [`StorageHeader`] and continues with fixed-size descriptor
//! slots. Slots whose versioned array id is 0 are free and get reused
//! before the table grows. On open the whole table is scanned and the live
//! descriptors are handed back so the engine can rebuild its chunk map.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::datastore::DataStore;
use super::address::StorageAddress;
use super::header::{ChunkDescriptor, ChunkHeader, DESCRIPTOR_SIZE};
use crate::error::{Error, Result};

/// Magic bytes at the start of the descriptor table
const TABLE_MAGIC: &[u8; 8] = b"CHNKVLT1";

/// Descriptor table format version
const TABLE_VERSION: u32 = 1;

/// Header size in bytes
pub const STORAGE_HEADER_SIZE: u64 = 32;

/// First record of the descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    /// Instance that owns this table
    pub instance_id: u32,
    /// End of the highest slot ever used
    pub curr_pos: u64,
    /// Live descriptors
    pub n_chunks: u64,
}

impl StorageHeader {
    fn new(instance_id: u32) -> Self {
        Self {
            instance_id,
            curr_pos: STORAGE_HEADER_SIZE,
            n_chunks: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; STORAGE_HEADER_SIZE as usize] {
        let mut bytes = [0u8; STORAGE_HEADER_SIZE as usize];
        bytes[0..8].copy_from_slice(TABLE_MAGIC);
        bytes[8..12].copy_from_slice(&TABLE_VERSION.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.instance_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.curr_pos.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.n_chunks.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STORAGE_HEADER_SIZE as usize {
            return Err(Error::Corrupted {
                pos: 0,
                reason: "storage header too short".into(),
            });
        }
        if &bytes[0..8] != TABLE_MAGIC {
            return Err(Error::Corrupted {
                pos: 0,
                reason: "invalid storage header magic".into(),
            });
        }

        let mut word = [0u8; 4];
        let mut quad = [0u8; 8];
        word.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(word);
        if version != TABLE_VERSION {
            return Err(Error::Corrupted {
                pos: 0,
                reason: format!("unsupported descriptor table version {}", version),
            });
        }
        word.copy_from_slice(&bytes[12..16]);
        let instance_id = u32::from_le_bytes(word);
        quad.copy_from_slice(&bytes[16..24]);
        let curr_pos = u64::from_le_bytes(quad);
        quad.copy_from_slice(&bytes[24..32]);
        let n_chunks = u64::from_le_bytes(quad);

        Ok(Self {
            instance_id,
            curr_pos,
            n_chunks,
        })
    }
}

struct TableState {
    header: StorageHeader,
    free_slots: Vec<u64>,
}

/// Persistent chunk descriptor directory
pub struct DescriptorTable {
    store: Arc<dyn DataStore>,
    state: Mutex<TableState>,
}

impl DescriptorTable {
    /// Open the table in `store`, creating it when empty. Returns the table
    /// and every live descriptor in slot order.
    pub fn open(store: Arc<dyn DataStore>, instance_id: u32) -> Result<(Self, Vec<ChunkDescriptor>)> {
        if store.size() == 0 {
            let header = StorageHeader::new(instance_id);
            store.write_at(0, &header.to_bytes())?;
            info!("Created descriptor table for instance {}", instance_id);
            let table = Self {
                store,
                state: Mutex::new(TableState {
                    header,
                    free_slots: Vec::new(),
                }),
            };
            return Ok((table, Vec::new()));
        }

        let header = StorageHeader::from_bytes(&store.read_at(0, STORAGE_HEADER_SIZE as usize)?)?;
        if header.instance_id != instance_id {
            return Err(Error::Config(format!(
                "descriptor table belongs to instance {}, not {}",
                header.instance_id, instance_id
            )));
        }

        let mut live = Vec::new();
        let mut free_slots = Vec::new();
        let mut pos = STORAGE_HEADER_SIZE;
        while pos + DESCRIPTOR_SIZE as u64 <= header.curr_pos {
            let bytes = store.read_at(pos, DESCRIPTOR_SIZE)?;
            // Never written: slot grabbed by an insert whose write failed
            if bytes.iter().all(|b| *b == 0) {
                free_slots.push(pos);
                pos += DESCRIPTOR_SIZE as u64;
                continue;
            }
            let mut desc = ChunkDescriptor::from_bytes(&bytes, pos)?;
            if desc.is_free() {
                free_slots.push(pos);
            } else {
                desc.header.pos.hdr_pos = pos;
                live.push(desc);
            }
            pos += DESCRIPTOR_SIZE as u64;
        }

        info!(
            "Opened descriptor table: {} live descriptors, {} free slots",
            live.len(),
            free_slots.len()
        );

        let mut header = header;
        header.n_chunks = live.len() as u64;
        let table = Self {
            store,
            state: Mutex::new(TableState { header, free_slots }),
        };
        Ok((table, live))
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("descriptor table lock poisoned".into()))
    }

    fn write_header(&self, state: &TableState) -> Result<()> {
        self.store.write_at(0, &state.header.to_bytes())
    }

    /// Persist a new descriptor, reusing a free slot when one exists, and
    /// record the chosen slot in `desc.header.pos.hdr_pos`.
    pub fn insert(&self, desc: &mut ChunkDescriptor) -> Result<()> {
        let mut state = self.lock()?;
        let pos = match state.free_slots.pop() {
            Some(pos) => pos,
            None => {
                let pos = state.header.curr_pos;
                state.header.curr_pos += DESCRIPTOR_SIZE as u64;
                pos
            }
        };
        desc.header.pos.hdr_pos = pos;

        if let Err(e) = self.store.write_at(pos, &desc.to_bytes()?) {
            // Give the slot back so a retry does not leak it
            state.free_slots.push(pos);
            return Err(e);
        }
        state.header.n_chunks += 1;
        self.write_header(&state)?;
        debug!("Descriptor for {} written at {}", desc.address(), pos);
        Ok(())
    }

    /// Rewrite a descriptor in place
    pub fn update(&self, desc: &ChunkDescriptor) -> Result<()> {
        let _state = self.lock()?;
        self.store.write_at(desc.header.pos.hdr_pos, &desc.to_bytes()?)
    }

    /// Mark the slot at `pos` free
    pub fn release(&self, pos: u64) -> Result<()> {
        let mut state = self.lock()?;
        let empty = ChunkDescriptor {
            header: ChunkHeader::new(&StorageAddress::new(0, 0, Vec::new()), 0, 0),
            coords: Vec::new(),
        };
        self.store.write_at(pos, &empty.to_bytes()?)?;
        state.free_slots.push(pos);
        state.header.n_chunks = state.header.n_chunks.saturating_sub(1);
        self.write_header(&state)
    }

    /// Copy of the storage header
    pub fn header(&self) -> Result<StorageHeader> {
        Ok(self.lock()?.header.clone())
    }

    /// Read the descriptor stored at `pos`
    pub fn read(&self, pos: u64) -> Result<ChunkDescriptor> {
        let bytes = self.store.read_at(pos, DESCRIPTOR_SIZE)?;
        let mut desc = ChunkDescriptor::from_bytes(&bytes, pos)?;
        desc.header.pos.hdr_pos = pos;
        Ok(desc)
    }

    /// Every live descriptor in slot order
    pub fn list(&self) -> Result<Vec<ChunkDescriptor>> {
        let curr_pos = self.lock()?.header.curr_pos;
        let mut out = Vec::new();
        let mut pos = STORAGE_HEADER_SIZE;
        while pos + DESCRIPTOR_SIZE as u64 <= curr_pos {
            let desc = self.read(pos)?;
            if !desc.is_free() {
                out.push(desc);
            }
            pos += DESCRIPTOR_SIZE as u64;
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}
