//! Timing report for the core cache operations

use anyhow::Result;
use kvcell::{Backend, CacheConfig, CpuBackend, KvCache, SeqId};
use std::sync::Arc;
use std::time::Instant;

pub fn run_benchmark(config: &CacheConfig, batch: usize, steps: usize) -> Result<()> {
    println!("=== kvcell Benchmark ===\n");
    println!(
        "Cache: {} cells, {} layers, {} x {} {} slots",
        config.capacity, config.n_layers, config.n_kv_heads, config.head_dim, config.dtype
    );
    println!(
        "Arenas: {:.2} MB once every layer is touched",
        config.arena_bytes() as f64 / (1024.0 * 1024.0)
    );
    println!();

    let backend = Arc::new(CpuBackend::new());
    let mut cache = KvCache::new(backend.clone(), config);
    let seqs: Vec<SeqId> = (0..batch as SeqId).collect();
    let steps = steps.min(config.capacity / batch.max(1));
    let shape = [config.head_dim, config.n_kv_heads, batch];
    let data = vec![0.5f32; config.slot_elems() * batch];

    // 1. start_step: slot search + mask build
    let mut step_time = 0.0;
    // 2. put: views + copy scheduling, all layers
    let mut put_time = 0.0;
    // 3. compute: executing the scheduled copies
    let mut compute_time = 0.0;

    for _ in 0..steps {
        let start = Instant::now();
        cache.start_step(&seqs)?;
        step_time += start.elapsed().as_secs_f64();

        let mut payloads = Vec::with_capacity(config.n_layers * 2);
        let start = Instant::now();
        for layer in 0..config.n_layers {
            let key = backend.from_floats(&data, &shape)?;
            let value = backend.from_floats(&data, &shape)?;
            cache.put_layer(layer, &key, &value)?;
            payloads.push(key);
            payloads.push(value);
        }
        put_time += start.elapsed().as_secs_f64();

        let start = Instant::now();
        backend.compute()?;
        compute_time += start.elapsed().as_secs_f64();
        for t in payloads {
            backend.release(t.buffer());
        }
    }

    let per_step = |t: f64| t * 1000.0 / steps.max(1) as f64;
    println!("Decode ({} steps, batch {}):", steps, batch);
    println!("  start_step: {:.3}ms/step", per_step(step_time));
    println!("  put:        {:.3}ms/step ({} layers)", per_step(put_time), config.n_layers);
    println!("  compute:    {:.3}ms/step", per_step(compute_time));
    let total = step_time + put_time + compute_time;
    if total > 0.0 {
        println!("  Throughput: {:.0} tok/s", (steps * batch) as f64 / total);
    }
    println!();

    // 4. defrag: drop every other sequence, then pack the survivors
    for &seq in seqs.iter().step_by(2) {
        cache.remove(seq, 0, usize::MAX)?;
    }
    let start = Instant::now();
    let moved = cache.defrag()?;
    let defrag_time = start.elapsed();
    println!("Defrag:");
    println!(
        "  {} cells moved in {:.2}ms",
        moved,
        defrag_time.as_secs_f64() * 1000.0
    );
    println!();

    println!("{}", cache.stats());
    Ok(())
}
