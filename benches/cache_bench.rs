//! Criterion benchmarks for kvcell core operations
//!
//! Run with: cargo bench
//! Everything runs on the CPU backend with small head sizes so the numbers
//! reflect cache bookkeeping rather than memory bandwidth.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvcell::{Backend, CpuBackend, DType, KvCache, SeqId};
use std::sync::Arc;

const HEAD_ELEMS: usize = 64;

fn new_cache(capacity: usize) -> (Arc<CpuBackend>, KvCache) {
    let backend = Arc::new(CpuBackend::new());
    let cache = KvCache::with_capacity(backend.clone(), capacity, DType::F32);
    (backend, cache)
}

/// Fill every other cell so slot search has to skip fragmented runs
fn fragmented(capacity: usize, batch: usize) -> (Arc<CpuBackend>, KvCache) {
    let (backend, mut cache) = new_cache(capacity);
    let seqs: Vec<SeqId> = (0..2 as SeqId).collect();
    for _ in 0..(capacity - batch) / 2 {
        cache.start_step(&seqs).unwrap();
    }
    cache.remove(0, 0, usize::MAX).unwrap();
    (backend, cache)
}

/// Benchmark slot search + mask construction
fn bench_start_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("start_step");

    for capacity in [256, 1024, 4096] {
        let batch = 8;
        let seqs: Vec<SeqId> = (100..100 + batch as SeqId).collect();
        group.bench_with_input(
            BenchmarkId::new("fragmented", capacity),
            &capacity,
            |b, &capacity| {
                let (_backend, mut cache) = fragmented(capacity, batch);
                b.iter(|| {
                    cache.start_step(black_box(&seqs)).unwrap();
                    for &s in &seqs {
                        cache.remove(s, 0, usize::MAX).unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark one layer write: views + scheduled copies + compute
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for batch in [1, 8, 32] {
        group.bench_with_input(BenchmarkId::new("cpu", batch), &batch, |b, &batch| {
            let (backend, mut cache) = new_cache(1024);
            let seqs: Vec<SeqId> = (0..batch as SeqId).collect();
            let data = vec![1.0f32; HEAD_ELEMS * batch];
            let key = backend.from_floats(&data, &[HEAD_ELEMS, 1, batch]).unwrap();
            let value = backend.from_floats(&data, &[HEAD_ELEMS, 1, batch]).unwrap();
            cache.start_step(&seqs).unwrap();
            b.iter(|| {
                let views = cache.put(black_box(&key), black_box(&value)).unwrap();
                black_box(views.keys);
                backend.compute().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark packing a half-empty table across several layers
fn bench_defrag(c: &mut Criterion) {
    let mut group = c.benchmark_group("defrag");

    for capacity in [256, 1024] {
        group.bench_with_input(
            BenchmarkId::new("half_free", capacity),
            &capacity,
            |b, &capacity| {
                b.iter_batched(
                    || {
                        let (backend, mut cache) = fragmented(capacity, 0);
                        let data = vec![1.0f32; HEAD_ELEMS];
                        let t = backend.from_floats(&data, &[HEAD_ELEMS, 1, 1]).unwrap();
                        for layer in 0..4 {
                            cache.start_step(&[2]).unwrap();
                            cache.put_layer(layer, &t, &t).unwrap();
                            cache.remove(2, 0, usize::MAX).unwrap();
                        }
                        backend.compute().unwrap();
                        (backend, cache)
                    },
                    |(_backend, mut cache)| {
                        black_box(cache.defrag().unwrap());
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_start_step, bench_put, bench_defrag);
criterion_main!(benches);
