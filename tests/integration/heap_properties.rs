//! Randomized Fibonacci heap tests.
//!
//! Operation sequences are generated from fixed seeds and checked against a
//! `BTreeSet` holding the same `(key, id)` pairs.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tasknet::core::heap::Handle;
use tasknet::{Error, FibonacciHeap};

type Key = (u64, usize);

struct Model {
    heap: FibonacciHeap<Key, usize>,
    reference: BTreeSet<Key>,
    handles: HashMap<usize, (Handle, Key)>,
    next_id: usize,
}

impl Model {
    fn new() -> Self {
        Self {
            heap: FibonacciHeap::new(),
            reference: BTreeSet::new(),
            handles: HashMap::new(),
            next_id: 0,
        }
    }

    fn insert(&mut self, key: u64) {
        let id = self.next_id;
        self.next_id += 1;
        let handle = self.heap.insert((key, id), id);
        self.reference.insert((key, id));
        self.handles.insert(id, (handle, (key, id)));
    }

    fn pick(&self, rng: &mut StdRng) -> Option<usize> {
        if self.handles.is_empty() {
            return None;
        }
        let mut ids: Vec<usize> = self.handles.keys().copied().collect();
        ids.sort_unstable();
        Some(ids[rng.gen_range(0..ids.len())])
    }

    fn extract(&mut self) {
        let expected = self.reference.pop_first();
        let got = self.heap.extract_min().map(|(k, _)| k);
        assert_eq!(got, expected);
        if let Some((_, id)) = got {
            self.handles.remove(&id);
        }
    }

    fn decrease(&mut self, rng: &mut StdRng) {
        let Some(id) = self.pick(rng) else {
            return;
        };
        let (handle, old) = self.handles[&id];
        if old.0 == 0 {
            return;
        }
        let new = (rng.gen_range(0..old.0), id);
        self.heap.decrease_key(handle, new).unwrap();
        self.reference.remove(&old);
        self.reference.insert(new);
        self.handles.insert(id, (handle, new));
    }

    fn delete(&mut self, rng: &mut StdRng) {
        let Some(id) = self.pick(rng) else {
            return;
        };
        let (handle, key) = self.handles.remove(&id).unwrap();
        assert_eq!(self.heap.delete(handle).unwrap(), (key, id));
        self.reference.remove(&key);
        assert!(!self.heap.contains(handle));
    }

    fn check(&self) {
        assert_eq!(self.heap.len(), self.reference.len());
        assert_eq!(
            self.heap.peek_min().map(|(k, _)| *k),
            self.reference.first().copied()
        );
    }
}

/// Test: Random operation sequences match a sorted reference
#[test]
fn test_random_operations_match_reference() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Model::new();
        for _ in 0..500 {
            match rng.gen_range(0..10) {
                0..=3 => model.insert(rng.gen_range(0..1_000)),
                4..=5 => model.extract(),
                6..=7 => model.decrease(&mut rng),
                _ => model.delete(&mut rng),
            }
            model.check();
        }
        assert!(model.heap.validate(), "heap invariants broken for seed {}", seed);
        while !model.reference.is_empty() {
            model.extract();
        }
        assert!(model.heap.is_empty());
    }
}

/// Test: Heap order holds after every decrease-key
/// Given a heap consolidated into deep trees
/// When keys deep inside trees are decreased
/// Then validation passes after each cut and the minimum is tracked
#[test]
fn test_heap_order_after_decrease_key() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut model = Model::new();
    for key in 0..256 {
        model.insert(1_000 + key);
    }
    // Force consolidation so later decreases have parents to cut from.
    model.extract();

    for _ in 0..200 {
        model.decrease(&mut rng);
        assert!(model.heap.validate());
        model.check();
    }
    assert!(model.heap.stats().cuts > 0);
}

/// Test: Stale handles are rejected
#[test]
fn test_stale_handle_after_slot_reuse() {
    let mut heap: FibonacciHeap<u64, &str> = FibonacciHeap::new();
    let old = heap.insert(5, "old");
    heap.extract_min();
    let fresh = heap.insert(7, "fresh");

    assert!(matches!(heap.decrease_key(old, 1), Err(Error::InvalidHandle)));
    assert!(matches!(heap.delete(old), Err(Error::InvalidHandle)));
    assert_eq!(heap.get(fresh), Some((&7, &"fresh")));
}

/// Test: Merged heaps behave as one
#[test]
fn test_merge_then_drain() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut left: FibonacciHeap<u64, u64> = FibonacciHeap::new();
    let mut right: FibonacciHeap<u64, u64> = FibonacciHeap::new();

    for _ in 0..100 {
        let k = rng.gen_range(10..10_000);
        left.insert(k, k);
    }
    left.extract_min();

    let mut right_handles = Vec::new();
    for _ in 0..100 {
        let k = rng.gen_range(10..10_000);
        right_handles.push(right.insert(k, k));
    }
    right.extract_min();

    let translator = left.merge(right);
    assert!(left.validate());

    // A translated handle still addresses its element.
    let live: Vec<Handle> = right_handles
        .iter()
        .map(|h| translator.translate(*h))
        .filter(|h| left.contains(*h))
        .collect();
    assert_eq!(live.len(), 99);
    left.decrease_key(live[0], 0).unwrap();
    assert_eq!(left.peek_min().map(|(k, _)| *k), Some(0));

    let mut previous = 0;
    let mut drained = 0;
    while let Some((k, _)) = left.extract_min() {
        assert!(k >= previous);
        previous = k;
        drained += 1;
    }
    assert_eq!(drained, 198);
}

/// Test: Amortized consolidation work
/// Given n inserts, random decrease-keys and n extracts
/// Then links plus scanned roots stay within O(n log n)
#[test]
fn test_amortized_extract_work() {
    let n: usize = 4_096;
    let mut rng = StdRng::seed_from_u64(1);
    let mut model = Model::new();
    for _ in 0..n {
        model.insert(rng.gen_range(0..1_000_000));
    }
    for _ in 0..n / 2 {
        model.extract();
        model.decrease(&mut rng);
    }
    while !model.reference.is_empty() {
        model.extract();
    }

    let stats = model.heap.stats();
    let log_n = (n as f64).log2().ceil() as u64;
    let max_degree = 2 * log_n + 2;
    let bound = 2
        * (stats.inserts
            + stats.cuts
            + stats.cascading_cuts
            + stats.extracts * (2 * max_degree + 1));
    assert!(
        stats.consolidation_work() <= bound,
        "work {} exceeds bound {} ({:?})",
        stats.consolidation_work(),
        bound,
        stats
    );
    assert_eq!(stats.extracts, n as u64);
}
