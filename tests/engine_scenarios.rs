//! End-to-end storage engine scenarios
//!
//! Version deltas, cache pressure, reopen recovery and failure handling
//! through the public engine API.

use std::sync::Arc;

use chunkvault::prelude::*;
use chunkvault::storage::{CompressionMethod, DataStore, DataStores, MemDataStore};
use tempfile::tempdir;

fn grid() -> ArrayDesc {
    ArrayDesc::new(
        42,
        "temperatures",
        vec![DimensionDesc::new("x", 0, 99, 10), DimensionDesc::new("y", 0, 99, 10)],
        vec![
            AttributeDesc::new(0, "celsius", ElementType::Fixed(8)),
            AttributeDesc::new(1, "sensor", ElementType::Fixed(8)),
        ],
    )
}

fn config() -> ChunkVaultConfig {
    let mut config = ChunkVaultConfig::single_node("/unused");
    config.cache.size_mb = 16;
    config
}

fn cells(values: &[u64]) -> NewChunk {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    NewChunk::dense(data, values.len() as u32)
}

fn decode(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn test_small_update_is_stored_as_delta() {
    let engine = StorageEngine::in_memory(config(), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(42, 0, vec![0, 0]);

    let v1 = vec![8u64; 100];
    let mut v2 = vec![9u64; 100];
    v2[0] = 42;

    let first = engine.write(&desc, &addr, cells(&v1), 1, &query).unwrap();
    assert_eq!(first.stored_as, StoredAs::Materialized);
    let second = engine.write(&desc, &addr, cells(&v2), 2, &query).unwrap();
    assert_eq!(second.stored_as, StoredAs::Delta);

    let map = engine.list_chunk_map().unwrap();
    assert_eq!(map.len(), 1);
    assert!(map[0].size < 1600, "block of {} bytes", map[0].size);
    assert_eq!(map[0].versions, Some(vec![2, 1]));

    assert_eq!(decode(engine.read(&desc, &addr, 1, &query).unwrap().data()), v1);
    assert_eq!(decode(engine.read(&desc, &addr, 2, &query).unwrap().data()), v2);
    engine.check_invariants().unwrap();
}

#[test]
fn test_writable_view_commit() {
    let engine = StorageEngine::in_memory(config(), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(42, 1, vec![10, 20]);

    let mut chunk = engine.new_chunk(&desc, addr.clone());
    chunk.set_data((0..100u64).flat_map(|v| (v * 7).to_le_bytes()).collect());
    chunk.set_count(100);
    let report = chunk.commit(3, &query).unwrap();
    assert_eq!(report.version, 3);

    let view = engine.read(&desc, &addr, 3, &query).unwrap();
    assert_eq!(decode(view.data())[99], 693);
    assert_eq!(view.first_position(false), &vec![10, 20]);
    assert_eq!(view.last_position(false), &vec![19, 29]);
    assert!(!view.is_sparse());
}

#[test]
fn test_cache_pressure_evicts_and_reloads() {
    let engine = StorageEngine::in_memory(config(), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let a = StorageAddress::new(42, 0, vec![0, 0]);
    let b = StorageAddress::new(42, 0, vec![0, 10]);

    engine.set_cache_ceiling(800).unwrap();
    engine.write(&desc, &a, cells(&[1; 100]), 1, &query).unwrap();
    engine.write(&desc, &b, cells(&[2; 100]), 1, &query).unwrap();

    let stats = engine.stats().unwrap();
    assert!(stats.evictions >= 1);
    assert!(stats.used <= 800);

    let loads = stats.loads;
    let view = engine.read(&desc, &a, 1, &query).unwrap();
    assert_eq!(decode(view.data()), vec![1; 100]);
    drop(view);
    assert_eq!(engine.stats().unwrap().loads, loads + 1);

    let map = engine.list_chunk_map().unwrap();
    let resident: Vec<_> = map.iter().filter(|e| e.resident).map(|e| e.address.clone()).collect();
    assert_eq!(resident, vec![a]);
    engine.check_invariants().unwrap();
}

#[test]
fn test_reopen_recovers_chunks_and_tombstones() {
    let dir = tempdir().unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let a = StorageAddress::new(42, 0, vec![0, 0]);
    let b = StorageAddress::new(42, 0, vec![50, 50]);

    let mut cfg = config();
    cfg.node.data_dir = dir.path().to_path_buf();

    let v1: Vec<u64> = (0..100).collect();
    let v2: Vec<u64> = (0..100).map(|i| i + 5).collect();
    {
        let engine = StorageEngine::open(cfg.clone(), Arc::new(MemoryTransport::new())).unwrap();
        engine.write(&desc, &a, cells(&v1), 1, &query).unwrap();
        engine.write(&desc, &a, cells(&v2), 2, &query).unwrap();
        engine.write(&desc, &b, cells(&[3; 100]), 1, &query).unwrap();
        engine.delete(&b, 2, &query).unwrap();
        engine.close().unwrap();
    }

    let engine = StorageEngine::open(cfg, Arc::new(MemoryTransport::new())).unwrap();
    assert_eq!(engine.list_chunk_descriptors().unwrap().len(), 3);
    assert_eq!(engine.stats().unwrap().resident, 0);

    assert_eq!(decode(engine.read(&desc, &a, 1, &query).unwrap().data()), v1);
    assert_eq!(decode(engine.read(&desc, &a, 2, &query).unwrap().data()), v2);
    assert_eq!(decode(engine.read(&desc, &b, 1, &query).unwrap().data()), vec![3; 100]);
    assert!(matches!(
        engine.read(&desc, &b, 2, &query),
        Err(Error::Deleted { version: 2, .. })
    ));
    assert_eq!(engine.chunk_positions(42, 0).unwrap(), vec![vec![0, 0]]);

    // History keeps growing after recovery
    let v3: Vec<u64> = (0..100).map(|i| i + 6).collect();
    let report = engine.write(&desc, &a, cells(&v3), 3, &query).unwrap();
    assert_eq!(report.stored_as, StoredAs::Delta);
    assert_eq!(decode(engine.read(&desc, &a, 1, &query).unwrap().data()), v1);
    engine.check_invariants().unwrap();
}

#[test]
fn test_failed_store_write_releases_everything() {
    let store = Arc::new(MemDataStore::new(42));
    let stores = DataStores::in_memory();
    stores.insert(store.clone()).unwrap();
    let engine = StorageEngine::open_with(
        config(),
        Arc::new(MemoryTransport::new()),
        Arc::new(MemDataStore::new(0)),
        stores,
    )
    .unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(42, 0, vec![0, 0]);

    store.fail_writes(true);
    let err = engine.write(&desc, &addr, cells(&[1; 100]), 1, &query).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(engine.stats().unwrap().used, 0);
    assert!(engine.list_chunk_descriptors().unwrap().is_empty());
    assert!(store.free_bytes() > 0);
    assert!(matches!(
        engine.read(&desc, &addr, 1, &query),
        Err(Error::NotFound { .. })
    ));
    engine.check_invariants().unwrap();

    store.fail_writes(false);
    engine.write(&desc, &addr, cells(&[1; 100]), 1, &query).unwrap();
    assert_eq!(store.free_bytes(), 0);
    engine.check_invariants().unwrap();
}

#[test]
fn test_damaged_block_fails_read_cleanly() {
    let store = Arc::new(MemDataStore::new(42));
    let stores = DataStores::in_memory();
    stores.insert(store.clone()).unwrap();
    let mut cfg = config();
    cfg.compression.method = CompressionMethod::None;
    let engine = StorageEngine::open_with(
        cfg,
        Arc::new(MemoryTransport::new()),
        Arc::new(MemDataStore::new(0)),
        stores,
    )
    .unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(42, 0, vec![20, 20]);

    engine.write(&desc, &addr, cells(&[4; 100]), 1, &query).unwrap();
    let report = engine.write(&desc, &addr, cells(&[5; 100]), 2, &query).unwrap();
    assert_eq!(report.stored_as, StoredAs::Delta);

    // Smash the version count at the end of the stored block
    let descriptors = engine.list_chunk_descriptors().unwrap();
    let header = &descriptors[0].header;
    store
        .write_at(header.pos.offs + header.size - 12, &u64::MAX.to_le_bytes())
        .unwrap();
    engine.set_cache_ceiling(0).unwrap();
    engine.set_cache_ceiling(16 * 1024 * 1024).unwrap();
    assert_eq!(engine.stats().unwrap().resident, 0);

    for version in [1, 2] {
        assert!(matches!(
            engine.read(&desc, &addr, version, &query),
            Err(Error::InvalidDelta(_))
        ));
    }
    let stats = engine.stats().unwrap();
    assert_eq!(stats.pinned, 0);
    assert_eq!(stats.used, 0);
    engine.check_invariants().unwrap();
}

#[test]
fn test_remove_chunk_version_covers_all_attributes() {
    let engine = StorageEngine::in_memory(config(), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    for att in [0, 1] {
        let addr = StorageAddress::new(42, att, vec![30, 30]);
        engine.write(&desc, &addr, cells(&[att as u64; 100]), 1, &query).unwrap();
    }

    engine.remove_chunk_version(&desc, &[30, 30], 4, &query).unwrap();
    for att in [0, 1] {
        let addr = StorageAddress::new(42, att, vec![30, 30]);
        assert!(matches!(
            engine.read(&desc, &addr, 4, &query),
            Err(Error::Deleted { .. })
        ));
        assert!(engine.read(&desc, &addr, 3, &query).is_ok());
    }

    assert_eq!(engine.remove_versions(42, 4).unwrap(), 4);
    assert!(engine.list_chunk_map().unwrap().is_empty());
    assert_eq!(engine.stats().unwrap().used, 0);
}

#[test]
fn test_random_workload_keeps_invariants() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let engine = StorageEngine::in_memory(config(), Arc::new(MemoryTransport::new())).unwrap();
    engine.set_cache_ceiling(4 * 800).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut newest = [0u64; 10];

    for _ in 0..300 {
        let slot = rng.gen_range(0..10usize);
        let addr = StorageAddress::new(42, 0, vec![slot as i64 * 10, 0]);
        match rng.gen_range(0..4) {
            0 | 1 => {
                let version = newest[slot] + 1;
                let base = rng.gen_range(0..1000u64);
                let values: Vec<u64> = (0..100).map(|i| base + i).collect();
                engine.write(&desc, &addr, cells(&values), version, &query).unwrap();
                newest[slot] = version;
            }
            _ if newest[slot] > 0 => {
                let version = rng.gen_range(1..=newest[slot]);
                let view = engine.read(&desc, &addr, version, &query).unwrap();
                assert!(view.version() <= version);
            }
            _ => {}
        }
        engine.check_invariants().unwrap();
    }
    assert_eq!(engine.stats().unwrap().pinned, 0);
}
