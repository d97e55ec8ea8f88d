//! Defragmentation planning
//!
//! Occupied cells are packed towards index 0 in their existing order, which
//! leaves every free cell in one run at the top of the table. The plan is a
//! list of range moves; each move's source and destination ranges are
//! disjoint, so a backend may execute them as plain copies in order.

use super::cells::CellTable;

/// Move `len` consecutive cells from `src` down to `dst`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellMove {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefragPlan {
    moves: Vec<CellMove>,
    /// Occupied cells after compaction (also the new high-water mark)
    occupied: usize,
}

impl DefragPlan {
    pub fn build(cells: &CellTable) -> Self {
        let mut moves: Vec<CellMove> = Vec::new();
        let mut next = 0;

        for (i, cell) in cells.iter().enumerate() {
            if cell.is_free() {
                continue;
            }
            if i != next {
                push_move(&mut moves, i, next);
            }
            next += 1;
        }

        Self {
            moves,
            occupied: next,
        }
    }

    pub fn moves(&self) -> &[CellMove] {
        &self.moves
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Total number of cells relocated
    pub fn cells_moved(&self) -> usize {
        self.moves.iter().map(|m| m.len).sum()
    }

    /// Rewrite the cell table according to the plan
    pub fn apply(&self, cells: &mut CellTable) {
        for m in &self.moves {
            for k in 0..m.len {
                cells.relocate(m.src + k, m.dst + k);
            }
        }
    }
}

/// Extend the last move when contiguous, but never so far that its source
/// range overlaps its destination range.
fn push_move(moves: &mut Vec<CellMove>, src: usize, dst: usize) {
    if let Some(last) = moves.last_mut() {
        let distance = last.src - last.dst;
        if last.src + last.len == src && last.dst + last.len == dst && last.len < distance {
            last.len += 1;
            return;
        }
    }
    moves.push(CellMove { src, dst, len: 1 });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pattern: &str) -> CellTable {
        let mut t = CellTable::new(pattern.len());
        for (i, c) in pattern.chars().enumerate() {
            if c == 'x' {
                t.assign(i, i as u64, 0);
            }
        }
        t
    }

    fn layout(t: &CellTable) -> String {
        t.iter()
            .map(|c| if c.is_free() { '.' } else { 'x' })
            .collect()
    }

    #[test]
    fn test_already_compact() {
        let plan = DefragPlan::build(&table("xxx.."));
        assert!(plan.is_empty());
        assert_eq!(plan.occupied(), 3);
    }

    #[test]
    fn test_moves_pack_to_front() {
        let mut t = table(".x.xx.x");
        let plan = DefragPlan::build(&t);
        assert_eq!(plan.occupied(), 4);
        plan.apply(&mut t);
        assert_eq!(layout(&t), "xxxx...");
        // Sequence ids were the starting cell indices, order is preserved
        let ids: Vec<u64> = t
            .iter()
            .take(4)
            .map(|c| c.entries()[0].seq)
            .collect();
        assert_eq!(ids, vec![1, 3, 4, 6]);
    }

    #[test]
    fn test_runs_are_coalesced_without_overlap() {
        let t = table("....xxxxxx");
        let plan = DefragPlan::build(&t);
        // distance 4: a run of 6 splits into 4 + 2
        assert_eq!(
            plan.moves(),
            &[
                CellMove { src: 4, dst: 0, len: 4 },
                CellMove { src: 8, dst: 4, len: 2 },
            ]
        );
        for m in plan.moves() {
            assert!(m.dst + m.len <= m.src);
        }
        assert_eq!(plan.cells_moved(), 6);
    }

    #[test]
    fn test_short_distance_moves_one_cell_at_a_time() {
        let t = table(".xxx");
        let plan = DefragPlan::build(&t);
        assert_eq!(plan.moves().len(), 3);
        assert!(plan.moves().iter().all(|m| m.len == 1));
    }

    #[test]
    fn test_aliased_cells_move_intact() {
        let mut t = CellTable::new(3);
        t.assign(2, 1, 4);
        t.iter_mut().nth(2).unwrap().insert(2, 4);
        let plan = DefragPlan::build(&t);
        plan.apply(&mut t);
        assert_eq!(t.get(0).unwrap().refs(), 2);
        assert_eq!(t.get(0).unwrap().position(2), Some(4));
    }
}
