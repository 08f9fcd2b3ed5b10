//! Delta Engine Benchmarks
//!
//! Measures delta encoding, historical version reconstruction and the
//! write path of the in-memory engine.
//!
//! Run with:
//!   cargo bench --bench delta

use std::hint::black_box;
use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chunkvault::delta::{binary_diff, chunk_delta, version, ChunkBuffer, NewVersion};
use chunkvault::prelude::*;
use chunkvault::storage::ChunkGeometry;

fn grid(side: i64) -> ArrayDesc {
    ArrayDesc::new(
        1,
        "bench",
        vec![
            DimensionDesc::new("i", 0, side - 1, side),
            DimensionDesc::new("j", 0, side - 1, side),
        ],
        vec![AttributeDesc::new(0, "v", ElementType::Fixed(8))],
    )
}

fn cells(n: usize, f: impl Fn(usize) -> u64) -> Vec<u8> {
    (0..n).flat_map(|i| f(i).to_le_bytes()).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for side in [10i64, 100, 300] {
        let n = (side * side) as usize;
        let desc = grid(side);
        let geom = ChunkGeometry::new(&desc, &[0, 0]);
        let old = cells(n, |i| i as u64);
        let new = cells(n, |i| if i % 97 == 0 { 1 << 40 } else { i as u64 + 3 });
        group.throughput(Throughput::Bytes(old.len() as u64));

        group.bench_with_input(BenchmarkId::new("subtractive", n), &n, |b, _| {
            let source = ChunkBuffer::dense(&new, ElementType::Fixed(8));
            let target = ChunkBuffer::dense(&old, ElementType::Fixed(8));
            b.iter(|| black_box(chunk_delta::encode(&source, &target, &geom).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("binary_diff", n), &n, |b, _| {
            b.iter(|| black_box(binary_diff::diff(black_box(&new), black_box(&old))));
        });
    }

    group.finish();
}

fn bench_get_version(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_version");
    let desc = grid(100);
    let geom = ChunkGeometry::new(&desc, &[0, 0]);
    let element = ElementType::Fixed(8);

    for depth in [1u64, 8, 32] {
        let mut block = version::single(
            &NewVersion {
                version: 1,
                data: Bytes::from(cells(10_000, |i| i as u64)),
                sparse: false,
                rle: false,
            },
            element,
        )
        .unwrap();
        for v in 2..=depth + 1 {
            let next = NewVersion {
                version: v,
                data: Bytes::from(cells(10_000, |i| i as u64 + v)),
                sparse: false,
                rle: false,
            };
            block = match version::new_version(&block, &next, element, &geom).unwrap() {
                version::DeltaOutcome::Delta(block) => block,
                version::DeltaOutcome::Materialize => unreachable!("uniform shift always deltas"),
            };
        }

        group.bench_with_input(BenchmarkId::new("oldest", depth), &block, |b, block| {
            b.iter(|| black_box(version::get_version(block, 1, &geom).unwrap()));
        });
    }

    group.finish();
}

fn bench_engine_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_write");
    let desc = grid(100);
    group.throughput(Throughput::Bytes(80_000));

    for delta in [false, true] {
        group.bench_function(BenchmarkId::new("delta", delta), |b| {
            b.iter_with_setup(
                || {
                    let mut config = ChunkVaultConfig::single_node("/unused");
                    config.cache.size_mb = 64;
                    config.delta.enabled = delta;
                    StorageEngine::in_memory(config, Arc::new(MemoryTransport::new())).unwrap()
                },
                |engine| {
                    let query = QueryContext::new();
                    let addr = StorageAddress::new(1, 0, vec![0, 0]);
                    for v in 1..=8u64 {
                        let chunk = NewChunk::dense(cells(10_000, |i| i as u64 * v), 10_000);
                        engine.write(&desc, &addr, chunk, v, &query).unwrap();
                    }
                    black_box(engine);
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_get_version, bench_engine_write);
criterion_main!(benches);
