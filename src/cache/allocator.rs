//! Slot allocator: first-fit search for a contiguous run of free cells

use super::cells::CellTable;

/// Lowest offset `start` such that cells `[start, start + batch)` are all free.
///
/// Returns `None` when no run of that length exists.
pub fn find_start(cells: &CellTable, batch: usize) -> Option<usize> {
    if batch == 0 {
        return Some(0);
    }
    let mut start = 0;
    let mut count = 0;
    for (i, cell) in cells.iter().enumerate() {
        if cell.is_free() {
            count += 1;
            if count >= batch {
                return Some(start);
            }
        } else {
            start = i + 1;
            count = 0;
        }
    }
    None
}

/// Length of the longest free run, for diagnostics
pub fn longest_free_run(cells: &CellTable) -> usize {
    let mut best = 0;
    let mut count = 0;
    for cell in cells.iter() {
        if cell.is_free() {
            count += 1;
            best = best.max(count);
        } else {
            count = 0;
        }
    }
    best
}
