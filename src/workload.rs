//! Scripted multi-sequence decode workload
//!
//! Drives a [`KvCache`] the way a serving loop would: prefill each sequence,
//! then decode all active sequences together one token per step, forking a
//! sequence now and then, trimming histories to a window and evicting the
//! longest sequence when the cache runs out of cells. After every step the
//! returned mask is checked against the sequences' lengths.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Backend, CpuBackend, Tensor};
use crate::cache::{CacheError, CacheStats, KvCache, SeqId};
use crate::config::{CacheConfig, WorkloadConfig};

/// Outcome of a workload run
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub steps: usize,
    /// Tokens written (prefill + decode)
    pub tokens: usize,
    pub forks: usize,
    pub trims: usize,
    pub evictions: usize,
    /// Mask columns verified against sequence lengths
    pub checks: usize,
    pub elapsed: Duration,
    pub stats: CacheStats,
}

impl WorkloadReport {
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "steps": self.steps,
            "tokens": self.tokens,
            "forks": self.forks,
            "trims": self.trims,
            "evictions": self.evictions,
            "checks": self.checks,
            "elapsed_ms": self.elapsed.as_secs_f64() * 1000.0,
            "tokens_per_sec": self.tokens_per_sec(),
            "cache": {
                "capacity": self.stats.capacity,
                "used_cells": self.stats.used_cells,
                "active": self.stats.active,
                "high_water": self.stats.high_water,
                "sequences": self.stats.sequences,
                "layers": self.stats.layers,
                "arena_bytes": self.stats.arena_bytes,
                "largest_free_run": self.stats.largest_free_run,
                "defrag_runs": self.stats.defrag_runs,
                "cells_moved": self.stats.cells_moved,
            },
        })
    }
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Steps: {} | Tokens: {} | Time: {:.2}ms | Speed: {:.0} tok/s",
            self.steps,
            self.tokens,
            self.elapsed.as_secs_f64() * 1000.0,
            self.tokens_per_sec()
        )?;
        writeln!(
            f,
            "Forks: {} | Trims: {} | Evictions: {} | Mask checks: {}",
            self.forks, self.trims, self.evictions, self.checks
        )?;
        write!(f, "{}", self.stats)
    }
}

/// Decode loop over a cache backed by the CPU backend
pub struct Workload {
    backend: Arc<CpuBackend>,
    cache: KvCache,
    cache_config: CacheConfig,
    config: WorkloadConfig,
    active: Vec<SeqId>,
    next_seq: SeqId,
    step: usize,
    report: WorkloadReport,
}

impl Workload {
    pub fn new(cache_config: CacheConfig, config: WorkloadConfig) -> Self {
        let backend = Arc::new(CpuBackend::new());
        let cache = KvCache::new(backend.clone(), &cache_config);
        let report = WorkloadReport {
            steps: 0,
            tokens: 0,
            forks: 0,
            trims: 0,
            evictions: 0,
            checks: 0,
            elapsed: Duration::ZERO,
            stats: cache.stats(),
        };
        Self {
            backend,
            cache,
            cache_config,
            config,
            active: Vec::new(),
            next_seq: 0,
            step: 0,
            report,
        }
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Run prefill then the configured number of decode steps
    pub fn run(mut self) -> Result<WorkloadReport> {
        info!(
            "Workload: {} sequences, {} prefill, {} steps, fork every {}, window {}",
            self.config.sequences,
            self.config.prefill,
            self.config.steps,
            self.config.fork_every,
            self.config.window
        );
        let start = Instant::now();

        for _ in 0..self.config.sequences {
            let seq = self.new_sequence();
            if self.config.prefill > 0 {
                let batch = vec![seq; self.config.prefill];
                self.forward(&batch)
                    .with_context(|| format!("prefill of sequence {}", seq))?;
            }
            self.active.push(seq);
        }

        for i in 0..self.config.steps {
            if self.active.is_empty() {
                warn!("No active sequences left, stopping early");
                break;
            }
            if self.config.fork_every > 0 && i > 0 && i % self.config.fork_every == 0 {
                self.fork()?;
            }
            let batch = self.active.clone();
            self.forward(&batch)
                .with_context(|| format!("decode step {}", self.step))?;
            self.trim()?;
        }

        self.report.elapsed = start.elapsed();
        self.report.stats = self.cache.stats();
        Ok(self.report)
    }

    fn new_sequence(&mut self) -> SeqId {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// One forward pass: reserve cells, write every layer, check the mask
    fn forward(&mut self, batch: &[SeqId]) -> Result<()> {
        let batch = self.reserve(batch)?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut payloads = Vec::with_capacity(self.cache_config.n_layers * 2);
        let result = self.write_layers(&batch, &mut payloads);
        if result.is_err() {
            // Copies from layers written before the failure would read
            // payloads that are about to be released
            self.backend.discard();
        }
        for t in payloads {
            self.backend.release(t.buffer());
        }
        result?;

        self.report.tokens += batch.len();
        self.report.steps += 1;
        self.step += 1;
        Ok(())
    }

    /// Write every layer of the started step and run the queued copies.
    /// Payload tensors are pushed to `payloads` as soon as they exist.
    fn write_layers(&mut self, batch: &[SeqId], payloads: &mut Vec<Tensor>) -> Result<()> {
        let slot = self.cache_config.slot_elems();
        let shape = [
            self.cache_config.head_dim,
            self.cache_config.n_kv_heads,
            batch.len(),
        ];

        for layer in 0..self.cache_config.n_layers {
            let fill = (layer * 1000 + self.step) as f32;
            let data = vec![fill; slot * batch.len()];
            let key = self.backend.from_floats(&data, &shape)?;
            payloads.push(key);
            let value = self.backend.from_floats(&data, &shape)?;
            payloads.push(value);
            let views = self.cache.put_layer(layer, &key, &value)?;
            if layer == 0 {
                let mask = self.backend.read(&views.mask)?;
                self.check_mask(batch, &mask)?;
            }
        }

        self.backend.compute()?;
        Ok(())
    }

    /// Start a step, evicting the longest sequence while the cache is full.
    /// Returns the batch actually started, empty if every member was evicted.
    fn reserve(&mut self, batch: &[SeqId]) -> Result<Vec<SeqId>> {
        let mut batch = batch.to_vec();
        loop {
            match self.cache.start_step(&batch) {
                Ok(()) => return Ok(batch),
                Err(CacheError::CapacityExhausted { capacity }) => {
                    let victim = self
                        .active
                        .iter()
                        .copied()
                        .max_by_key(|&s| self.cache.seq_len(s));
                    let Some(victim) = victim else {
                        bail!("batch of {} does not fit in {} cells", batch.len(), capacity);
                    };
                    self.cache.remove(victim, 0, usize::MAX)?;
                    self.active.retain(|&s| s != victim);
                    batch.retain(|&s| s != victim);
                    self.report.evictions += 1;
                    debug!("Evicted sequence {} to make room", victim);
                    if batch.is_empty() {
                        return Ok(batch);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Each column must see exactly its sequence's history (distinct ids)
    /// or its prefix within the step (repeated ids).
    fn check_mask(&mut self, batch: &[SeqId], mask: &[f32]) -> Result<()> {
        let width = self.cache.high_water();
        for (i, &seq) in batch.iter().enumerate() {
            let visible = mask[i * width..(i + 1) * width]
                .iter()
                .filter(|&&v| v == 0.0)
                .count();
            let later = batch[i + 1..].iter().filter(|&&s| s == seq).count();
            let expected = self.cache.seq_len(seq) - later;
            if visible != expected {
                bail!(
                    "mask column {} (sequence {}) sees {} cells, expected {}",
                    i,
                    seq,
                    visible,
                    expected
                );
            }
            self.report.checks += 1;
        }
        Ok(())
    }

    fn fork(&mut self) -> Result<()> {
        let Some(&src) = self.active.first() else {
            return Ok(());
        };
        let dst = self.new_sequence();
        self.cache.copy(src, dst, 0, self.cache.seq_len(src))?;
        self.active.push(dst);
        self.report.forks += 1;
        debug!("Forked sequence {} into {}", src, dst);
        Ok(())
    }

    fn trim(&mut self) -> Result<()> {
        let window = self.config.window;
        if window == 0 {
            return Ok(());
        }
        for &seq in &self.active {
            let len = self.cache.seq_len(seq);
            if len > window {
                self.cache.remove(seq, 0, len - window)?;
                self.report.trims += 1;
            }
        }
        Ok(())
    }
}
