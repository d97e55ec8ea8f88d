//! End-to-end cache scenarios driven through the public API

use kvcell::{Backend, CacheError, CpuBackend, DType, KvCache, SeqId};
use std::collections::HashMap;
use std::sync::Arc;

fn cache(capacity: usize) -> (Arc<CpuBackend>, KvCache) {
    let backend = Arc::new(CpuBackend::new());
    let cache = KvCache::with_capacity(backend.clone(), capacity, DType::F32);
    (backend, cache)
}

/// Cells 0..4 hold (1,0) (2,0) (1,1) (2,1)
fn two_steps() -> (Arc<CpuBackend>, KvCache) {
    let (backend, mut cache) = cache(4);
    cache.start_step(&[1, 2]).unwrap();
    cache.start_step(&[1, 2]).unwrap();
    (backend, cache)
}

/// Small xorshift so the property tests are reproducible without extra crates
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[test]
fn test_capacity_four_lifecycle() {
    let (_backend, mut cache) = cache(4);

    cache.start_step(&[1, 2]).unwrap();
    assert_eq!(cache.cell(0).unwrap().position(1), Some(0));
    assert_eq!(cache.cell(1).unwrap().position(2), Some(0));
    // Each column sees only its own sequence's cell
    let mask = cache.current_mask().unwrap();
    assert_eq!(mask.visible_cells(0), vec![0]);
    assert_eq!(mask.visible_cells(1), vec![1]);

    cache.start_step(&[1, 2]).unwrap();
    assert_eq!(cache.cell(2).unwrap().position(1), Some(1));
    assert_eq!(cache.cell(3).unwrap().position(2), Some(1));
    assert_eq!(cache.active(), 4);

    let err = cache.start_step(&[1, 2]).unwrap_err();
    assert!(matches!(err, CacheError::CapacityExhausted { capacity: 4 }));
    assert!(err.is_recoverable());
    assert_eq!(cache.active(), 4);

    cache.remove(1, 0, 1).unwrap();
    assert!(cache.cell(0).unwrap().is_free());
    // Sequence 1's later token slid down to position 0
    assert_eq!(cache.cell(2).unwrap().position(1), Some(0));
    assert_eq!(cache.seq_len(1), 1);

    cache.start_step(&[1]).unwrap();
    assert_eq!(cache.current_step(), Some((0, 1)));
    assert_eq!(cache.cell(0).unwrap().position(1), Some(1));
    let mask = cache.current_mask().unwrap();
    assert_eq!(mask.visible_cells(0), vec![0, 2]);
}

#[test]
fn test_fork_aliases_history() {
    let (_backend, mut cache) = two_steps();
    cache.copy(1, 3, 0, 2).unwrap();

    assert_eq!(cache.cell(0).unwrap().position(3), Some(0));
    assert_eq!(cache.cell(2).unwrap().position(3), Some(1));
    assert_eq!(cache.seq_len(3), 2);
    assert_eq!(cache.positions(3), vec![(0, 0), (2, 1)]);
    assert_eq!(cache.used_cells(), 4);
    assert_eq!(cache.active(), 6);
}

#[test]
fn test_forks_of_same_range_are_independent() {
    let (_backend, mut cache) = two_steps();
    cache.copy(1, 3, 0, 2).unwrap();
    cache.copy(1, 4, 0, 2).unwrap();
    assert_eq!(cache.positions(3), cache.positions(4));

    cache.remove(3, 0, 1).unwrap();
    assert_eq!(cache.positions(3), vec![(2, 0)]);
    assert_eq!(cache.positions(4), vec![(0, 0), (2, 1)]);
    assert_eq!(cache.positions(1), vec![(0, 0), (2, 1)]);
}

#[test]
fn test_removing_every_owner_frees_the_cell() {
    let (_backend, mut cache) = two_steps();
    cache.copy(1, 3, 0, 1).unwrap();
    cache.remove(1, 0, 1).unwrap();
    assert!(!cache.cell(0).unwrap().is_free());
    cache.remove(3, 0, 1).unwrap();
    assert!(cache.cell(0).unwrap().is_free());
    assert_eq!(cache.used_cells(), 3);
}

#[test]
fn test_fragmentation_triggers_defrag_and_keeps_data() {
    let (backend, mut cache) = cache(6);
    for t in 0..3 {
        cache.start_step(&[1, 2]).unwrap();
        let data: Vec<f32> = vec![t as f32, t as f32, 10.0 + t as f32, 10.0 + t as f32];
        let k = backend.from_floats(&data, &[2, 1, 2]).unwrap();
        cache.put_layer(0, &k, &k).unwrap();
        backend.compute().unwrap();
    }
    // Free cells 0, 2 and 4: three free cells, no run of two
    cache.remove(1, 0, usize::MAX).unwrap();
    assert_eq!(cache.used_cells(), 3);

    cache.start_step(&[1, 5]).unwrap();
    assert_eq!(cache.stats().defrag_runs, 1);
    assert_eq!(cache.current_step(), Some((3, 2)));
    assert_eq!(cache.positions(2), vec![(0, 0), (1, 1), (2, 2)]);

    let k = backend.from_floats(&[0.0; 4], &[2, 1, 2]).unwrap();
    let views = cache.put_layer(0, &k, &k).unwrap();
    backend.compute().unwrap();
    let keys = backend.read(&views.keys).unwrap();
    assert_eq!(&keys[..6], &[10.0, 10.0, 11.0, 11.0, 12.0, 12.0]);
}

#[test]
fn test_allocator_takes_lowest_fitting_run() {
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    for _ in 0..50 {
        let capacity = 12;
        let (_backend, mut cache) = cache(capacity);
        for seq in 0..capacity as SeqId {
            cache.start_step(&[seq]).unwrap();
        }
        for seq in 0..capacity as SeqId {
            if rng.below(2) == 0 {
                cache.remove(seq, 0, usize::MAX).unwrap();
            }
        }
        let free: Vec<bool> = (0..capacity)
            .map(|i| cache.cell(i).unwrap().is_free())
            .collect();
        let batch = 1 + rng.below(4);
        let expected = (0..=capacity - batch).find(|&s| free[s..s + batch].iter().all(|&f| f));

        let seqs: Vec<SeqId> = (100..100 + batch as SeqId).collect();
        match expected {
            Some(start) => {
                cache.start_step(&seqs).unwrap();
                assert_eq!(cache.current_step(), Some((start, batch)));
                assert_eq!(cache.stats().defrag_runs, 0);
            }
            None => {
                let free_count = free.iter().filter(|&&f| f).count();
                let result = cache.start_step(&seqs);
                if free_count >= batch {
                    // Enough cells overall: defrag makes room
                    result.unwrap();
                    assert_eq!(cache.stats().defrag_runs, 1);
                } else {
                    assert!(matches!(
                        result.unwrap_err(),
                        CacheError::CapacityExhausted { .. }
                    ));
                }
            }
        }
    }
}

#[test]
fn test_mask_matches_histories() {
    let mut rng = Rng(42);
    let (_backend, mut cache) = cache(64);
    let mut expected_len: HashMap<SeqId, usize> = HashMap::new();

    for _ in 0..20 {
        let mut seqs: Vec<SeqId> = (0..6).filter(|_| rng.below(3) != 0).collect();
        if seqs.is_empty() {
            seqs.push(0);
        }
        let origin: Vec<usize> = seqs.iter().map(|&s| cache.seq_len(s)).collect();
        if cache.start_step(&seqs).is_err() {
            break;
        }
        for &s in &seqs {
            *expected_len.entry(s).or_insert(0) += 1;
        }

        let mask = cache.current_mask().unwrap();
        assert_eq!(mask.width(), cache.high_water());
        for (i, &seq) in seqs.iter().enumerate() {
            for cell in 0..mask.width() {
                let holds = cache
                    .cell(cell)
                    .and_then(|c| c.position(seq))
                    .is_some_and(|p| p <= origin[i]);
                assert_eq!(mask.is_visible(cell, i), holds, "cell {} col {}", cell, i);
            }
            assert_eq!(mask.visible_cells(i).len(), expected_len[&seq]);
        }

        // Occasionally trim a sequence to keep histories uneven
        if rng.below(4) == 0 {
            let seq = seqs[rng.below(seqs.len())];
            let len = cache.seq_len(seq);
            if len > 1 {
                cache.remove(seq, 0, 1).unwrap();
                *expected_len.get_mut(&seq).unwrap() -= 1;
            }
        }
    }
}

#[test]
fn test_remove_compaction_property() {
    let mut rng = Rng(7);
    for _ in 0..30 {
        let (_backend, mut cache) = cache(32);
        let len = 4 + rng.below(8);
        for _ in 0..len {
            cache.start_step(&[1, 2]).unwrap();
        }
        let before = cache.positions(1);
        let b = rng.below(len);
        let e = b + 1 + rng.below(len - b);
        cache.remove(1, b, e).unwrap();

        let span = e - b;
        assert_eq!(cache.seq_len(1), len - span);
        let after = cache.positions(1);
        let expected: Vec<(usize, usize)> = before
            .iter()
            .filter(|&&(_, p)| p < b || p >= e)
            .map(|&(c, p)| if p >= e { (c, p - span) } else { (c, p) })
            .collect();
        let mut after_sorted = after.clone();
        after_sorted.sort();
        let mut expected_sorted = expected;
        expected_sorted.sort();
        assert_eq!(after_sorted, expected_sorted);
        // The untouched sequence keeps its full history
        assert_eq!(cache.seq_len(2), len);
        assert_eq!(cache.active(), 2 * len - span);
    }
}

#[test]
fn test_shift_window_then_continue() {
    let (_backend, mut cache) = cache(16);
    for _ in 0..6 {
        cache.start_step(&[1]).unwrap();
    }
    // Drop the two oldest tokens and renumber the rest down
    cache.remove(1, 0, 2).unwrap();
    assert_eq!(cache.seq_len(1), 4);
    cache.shift(1, 2, 4, 2).unwrap();
    assert_eq!(cache.seq_len(1), 6);
    let positions: Vec<usize> = cache.positions(1).iter().map(|&(_, p)| p).collect();
    assert_eq!(positions, vec![0, 1, 4, 5]);

    cache.start_step(&[1]).unwrap();
    assert_eq!(cache.positions(1).last().map(|&(_, p)| p), Some(6));
}

#[test]
fn test_closed_cache_rejects_everything() {
    let (backend, mut cache) = two_steps();
    cache.close();
    assert!(cache.is_closed());
    assert!(matches!(cache.start_step(&[1]), Err(CacheError::Closed)));
    assert!(matches!(cache.copy(1, 3, 0, 1), Err(CacheError::Closed)));
    assert!(matches!(cache.remove(1, 0, 1), Err(CacheError::Closed)));
    assert!(matches!(cache.defrag(), Err(CacheError::Closed)));
    assert_eq!(backend.live_buffers(), 0);
}
