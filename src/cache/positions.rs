//! Sequence position index: next logical position per sequence

use std::collections::HashMap;

use super::cells::SeqId;

#[derive(Debug, Clone, Default)]
pub struct SeqPositions {
    next: HashMap<SeqId, usize>,
}

impl SeqPositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unassigned position of `seq` (0 for unseen sequences)
    pub fn next(&self, seq: SeqId) -> usize {
        self.next.get(&seq).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, seq: SeqId, n: usize) {
        *self.next.entry(seq).or_insert(0) += n;
    }

    /// Move the counter back by `n`, never below zero
    pub fn retreat(&mut self, seq: SeqId, n: usize) {
        if let Some(p) = self.next.get_mut(&seq) {
            *p = p.saturating_sub(n);
        }
    }

    pub fn set(&mut self, seq: SeqId, pos: usize) {
        self.next.insert(seq, pos);
    }

    /// Snapshot of the counters for the given sequences
    pub fn snapshot(&self, seqs: &[SeqId]) -> HashMap<SeqId, usize> {
        seqs.iter().map(|&s| (s, self.next(s))).collect()
    }

    /// Sequences that currently have a non-zero counter
    pub fn live(&self) -> usize {
        self.next.values().filter(|&&p| p > 0).count()
    }
}
