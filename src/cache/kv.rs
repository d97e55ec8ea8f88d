//! Cell-based KV cache shared by many concurrently decoded sequences
//!
//! Every step the caller names the sequences advancing by one token. The
//! cache reserves a contiguous run of free cells for them, builds the causal
//! mask, and each transformer layer then writes its new keys/values into its
//! own arena at those cells and gets back a view over all live cells.
//!
//! ```text
//!  start_step([1, 2])         put(layer, k, v)
//!  ┌──────────────┐           ┌────────────────────────────────┐
//!  │ find run     │──mask──▶  │ arena[l].keys[start..start+2]  │ ─▶ views [0, high_water)
//!  │ assign cells │           │ arena[l].values[...]           │
//!  └──────────────┘           └────────────────────────────────┘
//! ```
//!
//! Forked sequences alias the same cells, so a cell is only free once no
//! sequence references it. Mutators (`copy`, `shift`, `remove`) only touch
//! metadata; `defrag` is the one operation that moves stored data.
//!
//! The cache is single-writer: one step (including all its `put` calls and
//! the compute consuming the views) must finish before the next step or any
//! mutator runs.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Backend, DType, Tensor};
use crate::config::{CacheConfig, ShiftMode};

use super::allocator::{find_start, longest_free_run};
use super::cells::{Cell, CellTable, SeqId};
use super::defrag::DefragPlan;
use super::error::CacheError;
use super::mask::Mask;
use super::positions::SeqPositions;

/// Per-layer storage: one flat buffer each for keys and values
#[derive(Debug, Clone, Copy)]
struct LayerArena {
    keys: Tensor,
    values: Tensor,
    /// Elements per cell in `keys` (heads × head_dim)
    key_slot: usize,
    value_slot: usize,
}

/// Transient state of the step in flight
#[derive(Debug)]
struct StepState {
    start: usize,
    batch: usize,
    mask: Mask,
    mask_tensor: Tensor,
}

/// Read views returned by [`KvCache::put`]
///
/// Keys and values are shaped `[dim0, dim1, high_water]` (innermost first),
/// the mask `[high_water, batch]`. They borrow the cache, so they cannot
/// outlive the next mutating call.
#[derive(Debug, Clone, Copy)]
pub struct KvViews<'a> {
    pub keys: Tensor,
    pub values: Tensor,
    pub mask: Tensor,
    _cache: PhantomData<&'a KvCache>,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    /// Cells referenced by at least one sequence
    pub used_cells: usize,
    /// Live (sequence, position) associations, aliases counted separately
    pub active: usize,
    /// One past the highest cell handed out
    pub high_water: usize,
    /// Sequences with at least one position
    pub sequences: usize,
    /// Layers whose arenas have been created
    pub layers: usize,
    pub arena_bytes: usize,
    /// Longest run of free cells
    pub largest_free_run: usize,
    pub defrag_runs: u64,
    pub cells_moved: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let utilization = if self.capacity > 0 {
            self.used_cells as f64 / self.capacity as f64 * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "KV cells: {}/{} used ({:.1}%), {} entries, high water {}, {} sequences, {} layers ({:.1} MB), largest free run {}, defrag {}x ({} cells moved)",
            self.used_cells,
            self.capacity,
            utilization,
            self.active,
            self.high_water,
            self.sequences,
            self.layers,
            self.arena_bytes as f64 / (1024.0 * 1024.0),
            self.largest_free_run,
            self.defrag_runs,
            self.cells_moved,
        )
    }
}

pub struct KvCache {
    backend: Arc<dyn Backend>,
    capacity: usize,
    dtype: DType,
    shift_mode: ShiftMode,

    cells: CellTable,
    positions: SeqPositions,
    /// Live associations across all cells
    size: usize,
    high_water: usize,

    cur_layer: usize,
    step: Option<StepState>,

    arenas: Vec<Option<LayerArena>>,

    defrag_runs: u64,
    cells_moved: u64,
    closed: bool,
}

impl KvCache {
    pub fn new(backend: Arc<dyn Backend>, config: &CacheConfig) -> Self {
        info!(
            "KV cache initialized: backend={}, capacity={}, dtype={}, shift={}",
            backend.name(),
            config.capacity,
            config.dtype,
            config.shift_mode
        );
        Self {
            backend,
            capacity: config.capacity,
            dtype: config.dtype,
            shift_mode: config.shift_mode,
            cells: CellTable::new(config.capacity),
            positions: SeqPositions::new(),
            size: 0,
            high_water: 0,
            cur_layer: 0,
            step: None,
            arenas: Vec::new(),
            defrag_runs: 0,
            cells_moved: 0,
            closed: false,
        }
    }

    /// Cache with default config apart from capacity and dtype
    pub fn with_capacity(backend: Arc<dyn Backend>, capacity: usize, dtype: DType) -> Self {
        let config = CacheConfig {
            capacity,
            dtype,
            ..CacheConfig::default()
        };
        Self::new(backend, &config)
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Address layer `layer`; later `put` calls write its arena
    pub fn sub_layer(&mut self, layer: usize) -> &mut Self {
        if layer >= self.arenas.len() {
            self.arenas.resize(layer + 1, None);
        }
        self.cur_layer = layer;
        self
    }

    /// Reserve one cell per listed sequence and build this step's mask.
    ///
    /// A sequence listed `n` times advances by `n` positions (prompt prefill).
    ///
    /// When no free run is long enough, the cache defragments and retries
    /// once. That retry is attempted whenever `used_cells() + batch` fits in
    /// the capacity. It counts occupied cells, not `active()` entries, so
    /// forked sequences sharing cells do not block a batch that fits.
    pub fn start_step(&mut self, seqs: &[SeqId]) -> Result<(), CacheError> {
        self.ensure_open()?;
        if seqs.is_empty() {
            return Err(CacheError::InvariantViolation(
                "start_step called with an empty batch".to_string(),
            ));
        }
        let batch = seqs.len();

        let start = match find_start(&self.cells, batch) {
            Some(start) => start,
            None if self.cells.occupied() + batch <= self.capacity => {
                debug!(
                    "No contiguous run of {} cells (largest {}), defragmenting",
                    batch,
                    longest_free_run(&self.cells)
                );
                self.defrag()?;
                find_start(&self.cells, batch).ok_or(CacheError::CapacityExhausted {
                    capacity: self.capacity,
                })?
            }
            None => {
                warn!(
                    "KV cache full: {} of {} cells used, batch of {} does not fit",
                    self.cells.occupied(),
                    self.capacity,
                    batch
                );
                return Err(CacheError::CapacityExhausted {
                    capacity: self.capacity,
                });
            }
        };

        let origin = self.positions.snapshot(seqs);
        let prev_high_water = self.high_water;

        for (i, &seq) in seqs.iter().enumerate() {
            let cell = start + i;
            self.cells.assign(cell, seq, self.positions.next(seq));
            self.positions.advance(seq, 1);
            self.size += 1;
            self.high_water = self.high_water.max(cell + 1);
        }

        let mask = Mask::build(&self.cells, seqs, &origin, self.high_water);
        let mask_tensor = match mask.upload(self.backend.as_ref()) {
            Ok(t) => t,
            Err(e) => {
                // Undo the reservation so the failed step leaves no trace
                for (i, &seq) in seqs.iter().enumerate() {
                    self.cells.release(start + i);
                    self.positions.retreat(seq, 1);
                }
                self.size -= batch;
                self.high_water = prev_high_water;
                return Err(e.into());
            }
        };

        if let Some(prev) = self.step.take() {
            self.backend.release(prev.mask_tensor.buffer());
        }
        self.step = Some(StepState {
            start,
            batch,
            mask,
            mask_tensor,
        });

        debug!(
            "Step reserved cells {}..{} for {} sequences (high water {})",
            start,
            start + batch,
            batch,
            self.high_water
        );
        Ok(())
    }

    /// Write this step's keys/values for the current layer and return read
    /// views over every live cell together with the mask.
    ///
    /// Payloads are shaped `[dim0, dim1, batch]`; `dim0 × dim1` elements make
    /// up one cell's slot.
    pub fn put(&mut self, key: &Tensor, value: &Tensor) -> Result<KvViews<'_>, CacheError> {
        self.ensure_open()?;
        let layer = self.cur_layer;
        let (start, batch, mask_tensor) = match &self.step {
            Some(s) => (s.start, s.batch, s.mask_tensor),
            None => {
                return Err(CacheError::InvariantViolation(
                    "put called without an active step".to_string(),
                ))
            }
        };

        for payload in [key, value] {
            if payload.dim(2) != batch {
                return Err(CacheError::BatchSizeMismatch {
                    layer,
                    expected: batch,
                    actual: payload.dim(2),
                });
            }
        }

        let key_slot = key.dim(0) * key.dim(1);
        let value_slot = value.dim(0) * value.dim(1);
        let arena = self.arena(layer, key_slot, value_slot)?;

        // One batch: both halves are queued or neither is
        let dst_keys = arena.keys.view_1d(key_slot * start, key_slot * batch)?;
        let dst_values = arena.values.view_1d(value_slot * start, value_slot * batch)?;
        self.backend
            .schedule_copies(&[(*key, dst_keys), (*value, dst_values)])?;

        let keys = arena.keys.view(
            0,
            &[
                (key.dim(0), 1),
                (key.dim(1), key.dim(0)),
                (self.high_water, key_slot),
            ],
        )?;
        let values = arena.values.view(
            0,
            &[
                (value.dim(0), 1),
                (value.dim(1), value.dim(0)),
                (self.high_water, value_slot),
            ],
        )?;

        Ok(KvViews {
            keys,
            values,
            mask: mask_tensor,
            _cache: PhantomData,
        })
    }

    /// `sub_layer(layer)` followed by `put`
    pub fn put_layer(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<KvViews<'_>, CacheError> {
        self.sub_layer(layer).put(key, value)
    }

    /// Get or lazily create the arena for `layer`
    fn arena(
        &mut self,
        layer: usize,
        key_slot: usize,
        value_slot: usize,
    ) -> Result<LayerArena, CacheError> {
        if layer >= self.arenas.len() {
            self.arenas.resize(layer + 1, None);
        }

        if let Some(arena) = self.arenas[layer] {
            if arena.key_slot != key_slot || arena.value_slot != value_slot {
                return Err(CacheError::InvariantViolation(format!(
                    "layer {} slot size changed from {}/{} to {}/{}",
                    layer, arena.key_slot, arena.value_slot, key_slot, value_slot
                )));
            }
            return Ok(arena);
        }

        let keys = self.backend.zeros(self.dtype, key_slot * self.capacity)?;
        let values = match self.backend.zeros(self.dtype, value_slot * self.capacity) {
            Ok(v) => v,
            Err(e) => {
                self.backend.release(keys.buffer());
                return Err(e.into());
            }
        };
        let arena = LayerArena {
            keys,
            values,
            key_slot,
            value_slot,
        };
        self.arenas[layer] = Some(arena);
        debug!(
            "Created arena for layer {}: {} cells x ({} + {}) {}",
            layer, self.capacity, key_slot, value_slot, self.dtype
        );
        Ok(arena)
    }

    /// Fork `[begin, end)` of `src` into `dst` without copying storage.
    ///
    /// Cells holding `src` in range gain an alias for `dst` at the same
    /// position; `dst`'s own entries at or past `end` move up to make room.
    pub fn copy(
        &mut self,
        src: SeqId,
        dst: SeqId,
        begin: usize,
        end: usize,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let end = end.min(self.positions.next(src));
        if begin >= end || src == dst {
            return Ok(());
        }
        let offset = end - begin;

        let mut added = 0;
        for cell in self.cells.iter_mut() {
            if let Some(pos) = cell.position(src) {
                if pos >= begin && pos < end && cell.insert(dst, pos) {
                    added += 1;
                }
            }
            if let Some(pos) = cell.position_mut(dst) {
                if *pos >= end {
                    *pos += offset;
                }
            }
        }

        self.size += added;
        self.positions.advance(dst, offset);
        debug!(
            "Copied seq {} [{}, {}) to seq {} ({} cells aliased)",
            src, begin, end, dst, added
        );
        Ok(())
    }

    /// Renumber `seq`'s positions in `[begin, end)` by `offset`.
    ///
    /// Validation runs before anything changes: results must stay
    /// non-negative and must not collide with the sequence's other
    /// positions. Under `ShiftMode::Contiguous` the sequence must also stay
    /// gap-free.
    pub fn shift(
        &mut self,
        seq: SeqId,
        begin: usize,
        end: usize,
        offset: isize,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        if self.shift_mode == ShiftMode::Disabled {
            return Err(CacheError::UnsupportedOperation(
                "position shift".to_string(),
            ));
        }
        let end = end.min(self.positions.next(seq));
        if begin >= end || offset == 0 {
            return Ok(());
        }

        let entries = self.cells.positions_of(seq);
        let mut updates = Vec::new();
        // Final position -> the old position that produced it. Entries that
        // already shared a position (a fork over existing history) may keep
        // sharing it; only distinct old positions landing together collide.
        let mut result: HashMap<usize, usize> = HashMap::with_capacity(entries.len());

        for &(cell, pos) in &entries {
            let new_pos = if pos >= begin && pos < end {
                let shifted = pos as isize + offset;
                if shifted < 0 {
                    return Err(CacheError::InvalidShift {
                        seq,
                        reason: format!("position {} would become {}", pos, shifted),
                    });
                }
                updates.push((cell, shifted as usize));
                shifted as usize
            } else {
                pos
            };
            match result.get(&new_pos) {
                Some(&from) if from != pos => {
                    return Err(CacheError::InvalidShift {
                        seq,
                        reason: format!(
                            "positions {} and {} would both become {}",
                            from, pos, new_pos
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    result.insert(new_pos, pos);
                }
            }
        }

        if self.shift_mode == ShiftMode::Contiguous && !result.is_empty() {
            let lo = result.keys().min().copied().unwrap_or(0);
            let hi = result.keys().max().copied().unwrap_or(0);
            if hi - lo + 1 != result.len() {
                return Err(CacheError::UnsupportedOperation(format!(
                    "shift would leave gaps in sequence {} positions",
                    seq
                )));
            }
        }

        for &(idx, new_pos) in &updates {
            if let Some(p) = self.cells.get_mut(idx).and_then(|c| c.position_mut(seq)) {
                *p = new_pos;
            }
        }
        if let Some(max) = result.keys().max() {
            self.positions.set(seq, max + 1);
        }

        debug!(
            "Shifted seq {} [{}, {}) by {} ({} entries)",
            seq,
            begin,
            end,
            offset,
            updates.len()
        );
        Ok(())
    }

    /// Drop `seq`'s positions in `[begin, end)` and slide later positions down.
    ///
    /// Cells become free only once their last alias is gone. Stored data is
    /// left in place and overwritten on reuse.
    pub fn remove(&mut self, seq: SeqId, begin: usize, end: usize) -> Result<(), CacheError> {
        self.ensure_open()?;
        let end = end.min(self.positions.next(seq));
        if begin >= end {
            return Ok(());
        }
        let offset = end - begin;

        let mut dropped = 0;
        let mut freed = 0;
        for cell in self.cells.iter_mut() {
            match cell.position(seq) {
                Some(pos) if pos >= begin && pos < end => {
                    cell.remove(seq);
                    dropped += 1;
                    if cell.is_free() {
                        freed += 1;
                    }
                }
                Some(pos) if pos >= end => {
                    if let Some(p) = cell.position_mut(seq) {
                        *p = pos - offset;
                    }
                }
                _ => {}
            }
        }

        self.positions.retreat(seq, offset);
        self.size -= dropped;
        debug!(
            "Removed seq {} [{}, {}): {} entries dropped, {} cells freed",
            seq, begin, end, dropped, freed
        );
        Ok(())
    }

    /// Pack occupied cells (and their stored slots in every layer) towards
    /// the start of the table so all free cells form one run.
    ///
    /// Metadata is committed only after the backend has executed every copy;
    /// a failed `compute()` applies no copies, so the cell table still
    /// matches the stored data.
    /// Invalidates views from the current step. Returns cells moved.
    pub fn defrag(&mut self) -> Result<usize, CacheError> {
        self.ensure_open()?;
        let plan = DefragPlan::build(&self.cells);
        if plan.is_empty() {
            self.high_water = plan.occupied();
            return Ok(0);
        }

        // Every move of every layer goes to the backend as one batch
        let mut copies = Vec::new();
        for arena in self.arenas.iter().flatten() {
            for m in plan.moves() {
                let buffers = [
                    (arena.keys, arena.key_slot),
                    (arena.values, arena.value_slot),
                ];
                for (buf, slot) in buffers {
                    let src = buf
                        .view_1d(m.src * slot, m.len * slot)
                        .map_err(CacheError::DefragmentationFailed)?;
                    let dst = buf
                        .view_1d(m.dst * slot, m.len * slot)
                        .map_err(CacheError::DefragmentationFailed)?;
                    copies.push((src, dst));
                }
            }
        }
        self.backend
            .schedule_copies(&copies)
            .map_err(CacheError::DefragmentationFailed)?;
        if let Err(e) = self.backend.compute() {
            self.backend.discard();
            return Err(CacheError::DefragmentationFailed(e));
        }

        plan.apply(&mut self.cells);
        self.high_water = plan.occupied();
        if let Some(prev) = self.step.take() {
            self.backend.release(prev.mask_tensor.buffer());
        }

        let moved = plan.cells_moved();
        self.defrag_runs += 1;
        self.cells_moved += moved as u64;
        info!(
            "Defragmented KV cache: {} cells moved in {} runs across {} layers, {} cells in use",
            moved,
            plan.moves().len(),
            self.arenas.iter().flatten().count(),
            plan.occupied()
        );
        Ok(moved)
    }

    /// Release every arena and the current mask; further use fails
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for arena in self.arenas.drain(..).flatten() {
            self.backend.release(arena.keys.buffer());
            self.backend.release(arena.values.buffer());
        }
        if let Some(step) = self.step.take() {
            self.backend.release(step.mask_tensor.buffer());
        }
        self.closed = true;
        info!("KV cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shift_mode(&self) -> ShiftMode {
        self.shift_mode
    }

    /// Live (sequence, position) associations
    pub fn active(&self) -> usize {
        self.size
    }

    /// One past the highest cell handed out
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn used_cells(&self) -> usize {
        self.cells.occupied()
    }

    /// Next position to be assigned to `seq`
    pub fn seq_len(&self, seq: SeqId) -> usize {
        self.positions.next(seq)
    }

    /// `(cell, position)` pairs held by `seq`, ordered by position
    pub fn positions(&self, seq: SeqId) -> Vec<(usize, usize)> {
        self.cells.positions_of(seq)
    }

    pub fn cell(&self, idx: usize) -> Option<&Cell> {
        self.cells.get(idx)
    }

    pub fn current_layer(&self) -> usize {
        self.cur_layer
    }

    /// `(start cell, batch size)` of the step in flight
    pub fn current_step(&self) -> Option<(usize, usize)> {
        self.step.as_ref().map(|s| (s.start, s.batch))
    }

    /// Host copy of the current step's mask
    pub fn current_mask(&self) -> Option<&Mask> {
        self.step.as_ref().map(|s| &s.mask)
    }

    pub fn stats(&self) -> CacheStats {
        let arena_bytes = self
            .arenas
            .iter()
            .flatten()
            .map(|a| (a.keys.len() + a.values.len()) * self.dtype.size_bytes())
            .sum();
        CacheStats {
            capacity: self.capacity,
            used_cells: self.cells.occupied(),
            active: self.size,
            high_water: self.high_water,
            sequences: self.positions.live(),
            layers: self.arenas.iter().flatten().count(),
            arena_bytes,
            largest_free_run: longest_free_run(&self.cells),
            defrag_runs: self.defrag_runs,
            cells_moved: self.cells_moved,
        }
    }
}

impl Drop for KvCache {
    fn drop(&mut self) {
        self.close();
    }
}
