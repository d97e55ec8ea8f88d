//! Cell table: the fixed-capacity slot map behind the cache
//!
//! Each cell holds a small set of `(sequence, position)` pairs. More than one
//! pair means the slot is aliased by forked sequences; an empty set means the
//! slot is free.

/// Sequence identifier
pub type SeqId = u64;

/// One `(sequence, logical position)` association held by a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqPos {
    pub seq: SeqId,
    pub pos: usize,
}

/// A single cache slot. Holds at most one pair per sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    entries: Vec<SeqPos>,
}

impl Cell {
    pub fn is_free(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of `seq` in this cell, if present
    pub fn position(&self, seq: SeqId) -> Option<usize> {
        self.entries.iter().find(|e| e.seq == seq).map(|e| e.pos)
    }

    pub fn position_mut(&mut self, seq: SeqId) -> Option<&mut usize> {
        self.entries
            .iter_mut()
            .find(|e| e.seq == seq)
            .map(|e| &mut e.pos)
    }

    /// Associate `seq` with `pos`; an existing pair for `seq` is overwritten.
    /// Returns true if a new pair was added.
    pub fn insert(&mut self, seq: SeqId, pos: usize) -> bool {
        match self.position_mut(seq) {
            Some(p) => {
                *p = pos;
                false
            }
            None => {
                self.entries.push(SeqPos { seq, pos });
                true
            }
        }
    }

    /// Drop the pair for `seq`, returning its position
    pub fn remove(&mut self, seq: SeqId) -> Option<usize> {
        let idx = self.entries.iter().position(|e| e.seq == seq)?;
        Some(self.entries.swap_remove(idx).pos)
    }

    pub fn entries(&self) -> &[SeqPos] {
        &self.entries
    }

    /// Number of sequences referencing this slot
    pub fn refs(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fixed-size array of cells
#[derive(Debug, Clone)]
pub struct CellTable {
    cells: Vec<Cell>,
}

impl CellTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![Cell::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn get(&self, idx: usize) -> Option<&Cell> {
        self.cells.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Cell> {
        self.cells.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.iter_mut()
    }

    /// Number of cells with at least one association
    pub fn occupied(&self) -> usize {
        self.cells.iter().filter(|c| !c.is_free()).count()
    }

    /// Make `idx` hold exactly one pair
    pub fn assign(&mut self, idx: usize, seq: SeqId, pos: usize) {
        let cell = &mut self.cells[idx];
        cell.clear();
        cell.entries.push(SeqPos { seq, pos });
    }

    /// Empty a cell, returning how many pairs it held
    pub fn release(&mut self, idx: usize) -> usize {
        let n = self.cells[idx].refs();
        self.cells[idx].clear();
        n
    }

    /// Move the pairs of cell `src` into `dst`, leaving `src` free
    pub fn relocate(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let moved = std::mem::take(&mut self.cells[src]);
        self.cells[dst] = moved;
    }

    /// All `(cell, position)` pairs of `seq`, ordered by position
    pub fn positions_of(&self, seq: SeqId) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = self
            .cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.position(seq).map(|p| (i, p)))
            .collect();
        out.sort_by_key(|&(_, p)| p);
        out
    }
}
