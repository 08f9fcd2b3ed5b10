//! Replica fan-out between engines
//!
//! Writes on one instance are shipped through an in-memory transport and
//! applied on its peers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chunkvault::prelude::*;
use chunkvault::replication::{ConnectionStatus, QueueClass, ReplicaMessage};

fn grid() -> ArrayDesc {
    ArrayDesc::new(
        9,
        "events",
        vec![DimensionDesc::new("t", 0, 999, 100)],
        vec![AttributeDesc::new(0, "count", ElementType::Fixed(4))],
    )
}

fn cluster_config(instance_id: u32, instances: u32, redundancy: u32) -> ChunkVaultConfig {
    let mut config = ChunkVaultConfig::single_node("/unused");
    config.node.instance_id = instance_id;
    config.cluster.instances = instances;
    config.cluster.redundancy = redundancy;
    config.cache.size_mb = 16;
    config.replication.poll_interval_ms = 10;
    config
}

fn cells(f: impl Fn(u32) -> u32) -> NewChunk {
    let data: Vec<u8> = (0..100).flat_map(|i| f(i).to_le_bytes()).collect();
    NewChunk::dense(data, 100)
}

fn decode(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn test_write_waits_for_replica_capacity() {
    let transport = Arc::new(MemoryTransport::new());
    transport.overflow_next(2, 1);
    let engine = StorageEngine::in_memory(cluster_config(0, 3, 2), transport.clone()).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![0]);

    let mut targets = engine.placement().replicas(&addr, 0);
    targets.sort_unstable();
    assert_eq!(targets, vec![1, 2]);

    let report = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            engine
                .replication()
                .handle_connection_status(ConnectionStatus {
                    instance: 2,
                    queue_class: QueueClass::Replication,
                    available: 1,
                })
                .unwrap();
        });
        engine.write(&desc, &addr, cells(|i| i), 1, &query).unwrap()
    });

    assert_eq!(report.replicas, 2);
    assert_eq!(report.failed_replicas, 0);
    assert_eq!(transport.sent_to(1).len(), 1);
    assert_eq!(transport.sent_to(2).len(), 1);
    assert!(query.replica_failures().is_empty());
}

#[test]
fn test_lost_replica_is_recorded_on_query() {
    let transport = Arc::new(MemoryTransport::new());
    transport.disconnect(1, "link down");
    let engine = StorageEngine::in_memory(cluster_config(0, 2, 1), transport.clone()).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![100]);

    let report = engine.write(&desc, &addr, cells(|i| i * 2), 1, &query).unwrap();
    assert_eq!(report.failed_replicas, 1);
    assert_eq!(query.replica_failures().len(), 1);
    assert_eq!(query.replica_failures()[0].0, 1);

    // The local copy is intact
    let view = engine.read(&desc, &addr, 1, &query).unwrap();
    assert_eq!(decode(view.data())[10], 20);
}

#[test]
fn test_aborted_query_cancels_replica_wait() {
    let transport = Arc::new(MemoryTransport::new());
    transport.overflow_next(1, 1000);
    let engine = StorageEngine::in_memory(cluster_config(0, 2, 1), transport.clone()).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![200]);

    let result = thread::scope(|s| {
        let q = query.clone();
        s.spawn(move || {
            thread::sleep(Duration::from_millis(50));
            q.abort();
        });
        engine.write(&desc, &addr, cells(|i| i), 1, &query)
    });
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(engine.replication().queue_len(1), 0);
    engine.check_invariants().unwrap();
}

#[test]
fn test_peer_applies_shipped_versions() {
    let transport = Arc::new(MemoryTransport::new());
    let primary = StorageEngine::in_memory(cluster_config(0, 2, 1), transport.clone()).unwrap();
    let replica = StorageEngine::in_memory(cluster_config(1, 2, 1), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![300]);

    primary.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();
    let second = primary.write(&desc, &addr, cells(|i| i + 1), 2, &query).unwrap();
    assert_eq!(second.stored_as, StoredAs::Delta);
    primary.delete(&addr, 5, &query).unwrap();

    let shipped = transport.sent_to(1);
    assert_eq!(shipped.len(), 3);
    match ReplicaMessage::from_bytes(&shipped[1]).unwrap() {
        ReplicaMessage::Chunk { supersedes_prior, version, .. } => {
            assert!(supersedes_prior);
            assert_eq!(version, 2);
        }
        other => panic!("unexpected message {:?}", other),
    }

    for payload in &shipped {
        replica.apply_replica(payload, &query).unwrap();
    }
    // Redelivery is harmless
    replica.apply_replica(&shipped[0], &query).unwrap();

    assert_eq!(replica.list_chunk_descriptors().unwrap().len(), 2);
    assert_eq!(decode(replica.read(&desc, &addr, 1, &query).unwrap().data())[7], 7);
    assert_eq!(decode(replica.read(&desc, &addr, 4, &query).unwrap().data())[7], 8);
    assert!(matches!(
        replica.read(&desc, &addr, 5, &query),
        Err(Error::Deleted { version: 5, .. })
    ));
    replica.check_invariants().unwrap();
}

#[test]
fn test_superseding_replica_waits_for_readers() {
    let transport = Arc::new(MemoryTransport::new());
    let primary = StorageEngine::in_memory(cluster_config(0, 2, 1), transport.clone()).unwrap();
    let replica = StorageEngine::in_memory(cluster_config(1, 2, 1), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![400]);

    primary.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();
    primary.write(&desc, &addr, cells(|i| i + 1), 2, &query).unwrap();
    let shipped = transport.sent_to(1);
    replica.apply_replica(&shipped[0], &query).unwrap();

    let view = replica.read(&desc, &addr, 1, &query).unwrap();

    // An aborted intake gives up instead of waiting on the reader
    let intake = QueryContext::new();
    let result = thread::scope(|s| {
        let q = intake.clone();
        s.spawn(move || {
            thread::sleep(Duration::from_millis(50));
            q.abort();
        });
        replica.apply_replica(&shipped[1], &intake)
    });
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(decode(view.data())[7], 7);
    replica.check_invariants().unwrap();

    // Once the reader lets go the new block goes in
    thread::scope(|s| {
        let handle = s.spawn(|| replica.apply_replica(&shipped[1], &query));
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(view);
        handle.join().unwrap().unwrap();
    });

    assert_eq!(decode(replica.read(&desc, &addr, 1, &query).unwrap().data())[7], 7);
    assert_eq!(decode(replica.read(&desc, &addr, 2, &query).unwrap().data())[7], 8);
    assert_eq!(replica.list_chunk_descriptors().unwrap().len(), 1);
    assert_eq!(replica.stats().unwrap().pinned, 0);
    replica.check_invariants().unwrap();
}

#[test]
fn test_replica_intake_stops_on_close() {
    let transport = Arc::new(MemoryTransport::new());
    let primary = StorageEngine::in_memory(cluster_config(0, 2, 1), transport.clone()).unwrap();
    let replica = StorageEngine::in_memory(cluster_config(1, 2, 1), Arc::new(MemoryTransport::new())).unwrap();
    let desc = grid();
    let query = QueryContext::new();
    let addr = StorageAddress::new(9, 0, vec![500]);

    primary.write(&desc, &addr, cells(|i| i), 1, &query).unwrap();
    primary.write(&desc, &addr, cells(|i| i + 2), 2, &query).unwrap();
    let shipped = transport.sent_to(1);
    replica.apply_replica(&shipped[0], &query).unwrap();
    let view = replica.read(&desc, &addr, 1, &query).unwrap();

    let result = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            replica.close().unwrap();
        });
        replica.apply_replica(&shipped[1], &query)
    });
    assert!(matches!(result, Err(Error::ShuttingDown)));
    drop(view);
}
