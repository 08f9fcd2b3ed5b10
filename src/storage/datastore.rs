//! Data stores
//!
//! A data store is an overwrite-in-place byte container identified by a
//! guid. Chunk blocks are written into extents reserved from it; the
//! engine owns all ordering inside an extent. Extents are rounded up to a
//! power of two and recycled through per-size free lists, which are saved
//! next to the store on flush.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Smallest extent handed out
const MIN_EXTENT: u64 = 64;

/// A reserved byte range inside a data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub allocated: u64,
}

/// Byte-range storage primitive the engine persists into
pub trait DataStore: Send + Sync {
    /// Store guid
    fn guid(&self) -> u64;

    /// Reserve at least `size` bytes
    fn allocate(&self, size: u64) -> Result<Extent>;

    /// Return an extent to the free lists
    fn free(&self, extent: Extent) -> Result<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Make writes durable
    fn flush(&self) -> Result<()>;

    /// Logical size (end of the highest extent or write)
    fn size(&self) -> u64;
}

/// Power-of-two extent allocator shared by the store implementations
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ExtentAllocator {
    end: u64,
    /// Free extents keyed by size
    free: BTreeMap<u64, Vec<u64>>,
}

impl ExtentAllocator {
    fn round(size: u64) -> u64 {
        size.max(MIN_EXTENT).next_power_of_two()
    }

    fn allocate(&mut self, size: u64) -> Extent {
        let allocated = Self::round(size);
        if let Some(offsets) = self.free.get_mut(&allocated) {
            if let Some(offset) = offsets.pop() {
                if offsets.is_empty() {
                    self.free.remove(&allocated);
                }
                return Extent { offset, allocated };
            }
        }
        let offset = self.end;
        self.end += allocated;
        Extent { offset, allocated }
    }

    fn release(&mut self, extent: Extent) {
        if extent.allocated == 0 {
            return;
        }
        self.free.entry(extent.allocated).or_default().push(extent.offset);
    }

    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|(size, offs)| size * offs.len() as u64).sum()
    }
}

/// File-backed data store: `<dir>/<guid>.data` plus a `<guid>.fl` free list
pub struct FileDataStore {
    guid: u64,
    path: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    alloc: ExtentAllocator,
    len: u64,
}

impl FileDataStore {
    /// Open or create the store for `guid` inside `dir`
    pub fn open(dir: &Path, guid: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.data", guid));
        Self::open_path(path, guid)
    }

    /// Open or create a store at an explicit path
    pub fn open_path(path: PathBuf, guid: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        let mut alloc = match fs::read(Self::free_list_path(&path)) {
            Ok(bytes) => bincode::deserialize::<ExtentAllocator>(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable free list for store {}: {}", guid, e);
                ExtentAllocator::default()
            }),
            Err(_) => ExtentAllocator::default(),
        };
        alloc.end = alloc.end.max(len);

        debug!("Opened data store {} at {:?} ({} bytes)", guid, path, len);

        Ok(Self {
            guid,
            path,
            inner: Mutex::new(FileInner { file, alloc, len }),
        })
    }

    fn free_list_path(path: &Path) -> PathBuf {
        path.with_extension("fl")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FileInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal(format!("data store {} lock poisoned", self.guid)))
    }
}

impl DataStore for FileDataStore {
    fn guid(&self) -> u64 {
        self.guid
    }

    fn allocate(&self, size: u64) -> Result<Extent> {
        Ok(self.lock()?.alloc.allocate(size))
    }

    fn free(&self, extent: Extent) -> Result<()> {
        self.lock()?.alloc.release(extent);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        inner.len = inner.len.max(offset + data.len() as u64);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock()?;
        if offset + len as u64 > inner.len {
            return Err(Error::DataStore(format!(
                "read of {} bytes at {} past end of store {} ({} bytes)",
                len, offset, self.guid, inner.len
            )));
        }
        let mut buf = vec![0u8; len];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn flush(&self) -> Result<()> {
        let inner = self.lock()?;
        inner.file.sync_data()?;
        let free_list = bincode::serialize(&inner.alloc)?;
        fs::write(Self::free_list_path(&self.path), free_list)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.lock().map(|i| i.len.max(i.alloc.end)).unwrap_or(0)
    }
}

/// In-memory data store with optional write failure injection
pub struct MemDataStore {
    guid: u64,
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    data: Vec<u8>,
    alloc: ExtentAllocator,
    fail_writes: bool,
}

impl MemDataStore {
    pub fn new(guid: u64) -> Self {
        Self {
            guid,
            inner: Mutex::new(MemInner::default()),
        }
    }

    /// Make every subsequent write fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Bytes currently sitting on the free lists
    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().map(|i| i.alloc.free_bytes()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal(format!("data store {} lock poisoned", self.guid)))
    }
}

impl DataStore for MemDataStore {
    fn guid(&self) -> u64 {
        self.guid
    }

    fn allocate(&self, size: u64) -> Result<Extent> {
        Ok(self.lock()?.alloc.allocate(size))
    }

    fn free(&self, extent: Extent) -> Result<()> {
        self.lock()?.alloc.release(extent);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        let end = offset as usize + data.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        let end = offset as usize + len;
        if end > inner.data.len() {
            return Err(Error::DataStore(format!(
                "read of {} bytes at {} past end of store {}",
                len, offset, self.guid
            )));
        }
        Ok(inner.data[offset as usize..end].to_vec())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.lock()
            .map(|i| (i.data.len() as u64).max(i.alloc.end))
            .unwrap_or(0)
    }
}

enum Backing {
    Files(PathBuf),
    Memory,
}

/// Registry of open data stores, keyed by guid
pub struct DataStores {
    backing: Backing,
    stores: Mutex<HashMap<u64, Arc<dyn DataStore>>>,
}

impl DataStores {
    /// File-backed stores under `dir`
    pub fn on_disk(dir: PathBuf) -> Self {
        Self {
            backing: Backing::Files(dir),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Memory-backed stores
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory,
            stores: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn DataStore>>>> {
        self.stores
            .lock()
            .map_err(|_| Error::Internal("data store registry lock poisoned".into()))
    }

    /// Register a store explicitly, replacing any open one
    pub fn insert(&self, store: Arc<dyn DataStore>) -> Result<()> {
        self.lock()?.insert(store.guid(), store);
        Ok(())
    }

    /// Get the store for `guid`, opening it on first use
    pub fn get(&self, guid: u64) -> Result<Arc<dyn DataStore>> {
        let mut stores = self.lock()?;
        if let Some(store) = stores.get(&guid) {
            return Ok(store.clone());
        }
        let store: Arc<dyn DataStore> = match &self.backing {
            Backing::Files(dir) => Arc::new(FileDataStore::open(dir, guid)?),
            Backing::Memory => Arc::new(MemDataStore::new(guid)),
        };
        stores.insert(guid, store.clone());
        Ok(store)
    }

    /// Close and delete the store for `guid`
    pub fn remove(&self, guid: u64) -> Result<()> {
        let removed = self.lock()?.remove(&guid);
        drop(removed);
        if let Backing::Files(dir) = &self.backing {
            let path = dir.join(format!("{}.data", guid));
            if path.exists() {
                fs::remove_file(&path)?;
            }
            let _ = fs::remove_file(path.with_extension("fl"));
        }
        Ok(())
    }

    /// Flush every open store
    pub fn flush_all(&self) -> Result<()> {
        let stores: Vec<_> = self.lock()?.values().cloned().collect();
        for store in stores {
            store.flush()?;
        }
        Ok(())
    }
}
