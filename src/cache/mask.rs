//! Causal attention mask for one inference step
//!
//! The mask is an additive bias applied before softmax. Column `i` belongs to
//! batch entry `i`; row `j` is cell `j`. A cell is visible (0.0) to column `i`
//! when it holds the column's sequence at a position no later than the one
//! assigned to that column this step, otherwise it is `-inf`.
//!
//! Layout matches what the attention kernel consumes: shape `[width, batch]`
//! with the cell dimension innermost, i.e. `values[i * width + j]`.

use std::collections::HashMap;

use crate::backend::{Backend, BackendError, Tensor};

use super::cells::{CellTable, SeqId};

#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: usize,
    batch: usize,
    values: Vec<f32>,
}

impl Mask {
    /// Build the mask for `seqs` over cells `[0, width)`.
    ///
    /// `origin` holds each sequence's next position as it was before this
    /// step's allocation. A sequence listed more than once advances by one
    /// position per occurrence, so the k-th occurrence sees up to
    /// `origin + k`.
    pub fn build(
        cells: &CellTable,
        seqs: &[SeqId],
        origin: &HashMap<SeqId, usize>,
        width: usize,
    ) -> Self {
        let batch = seqs.len();
        let mut values = vec![f32::NEG_INFINITY; batch * width];
        let mut seen: HashMap<SeqId, usize> = HashMap::new();

        for (i, &seq) in seqs.iter().enumerate() {
            let ordinal = seen.entry(seq).or_insert(0);
            let limit = origin.get(&seq).copied().unwrap_or(0) + *ordinal;
            *ordinal += 1;

            let column = &mut values[i * width..(i + 1) * width];
            for (j, cell) in cells.iter().take(width).enumerate() {
                if matches!(cell.position(seq), Some(p) if p <= limit) {
                    column[j] = 0.0;
                }
            }
        }

        Self {
            width,
            batch,
            values,
        }
    }

    /// Number of cell rows (the high-water mark when built)
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Bias for `cell` as seen from batch column `col`
    pub fn get(&self, cell: usize, col: usize) -> f32 {
        self.values[col * self.width + cell]
    }

    pub fn is_visible(&self, cell: usize, col: usize) -> bool {
        self.get(cell, col) == 0.0
    }

    /// Cells visible to batch column `col`
    pub fn visible_cells(&self, col: usize) -> Vec<usize> {
        (0..self.width)
            .filter(|&j| self.is_visible(j, col))
            .collect()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Upload to the backend as an f32 tensor of shape `[width, batch]`
    pub fn upload(&self, backend: &dyn Backend) -> Result<Tensor, BackendError> {
        backend.from_floats(&self.values, &[self.width, self.batch])
    }
}
