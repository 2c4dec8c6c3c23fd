//! Benchmarks for `BwTree` using Divan.
//!
//! Run with: `cargo bench --bench tree`
#![expect(clippy::cast_possible_truncation)]

use std::sync::Arc;

use bwtree::{BwTree, IndexConfig};
use divan::{Bencher, black_box};

fn main() {
    divan::main();
}

const MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

fn scrambled(i: usize) -> u64 {
    (i as u64).wrapping_mul(MULTIPLIER)
}

fn setup_tree(n: usize) -> BwTree<u64, u64> {
    let tree = BwTree::new();
    for i in 0..n {
        let _ = tree.insert(scrambled(i), i as u64);
    }
    tree
}

// =============================================================================
// Construction
// =============================================================================

#[divan::bench_group]
mod construction {
    use super::BwTree;

    #[divan::bench]
    fn new_tree() -> BwTree<u64, u64> {
        BwTree::new()
    }

    #[divan::bench]
    fn default_tree() -> BwTree<u64, u64> {
        BwTree::default()
    }
}

// =============================================================================
// Insert Operations
// =============================================================================

#[divan::bench_group]
mod insert {
    use super::{Bencher, BwTree, IndexConfig, black_box, scrambled, setup_tree};

    #[divan::bench]
    fn insert_single(bencher: Bencher) {
        bencher.with_inputs(BwTree::<u64, u64>::new).bench_local_values(|tree| {
            let _ = tree.insert(black_box(42), black_box(42));
            tree
        });
    }

    #[divan::bench(args = [100, 1_000, 10_000])]
    fn insert_into_existing(bencher: Bencher, n: usize) {
        bencher
            .with_inputs(|| setup_tree(n))
            .bench_local_values(|tree| {
                let _ = tree.insert(black_box(u64::MAX), black_box(1));
                tree
            });
    }

    #[divan::bench(args = [1_000, 10_000])]
    fn bulk_load(bencher: Bencher, n: usize) {
        bencher.bench_local(|| {
            let tree: BwTree<u64, u64> = BwTree::new();
            let worker = tree.participant();
            for i in 0..n {
                let _ = tree.insert_with(scrambled(i), i as u64, &worker);
            }
            drop(worker);
            tree
        });
    }

    /// Longer chains mean cheaper writes and more expensive reads.
    #[divan::bench(args = [2, 8, 32])]
    fn bulk_load_consolidate_threshold(bencher: Bencher, threshold: usize) {
        bencher.bench_local(|| {
            let tree: BwTree<u64, u64> =
                BwTree::with_config(IndexConfig::default().with_consolidate_threshold(threshold));
            let worker = tree.participant();
            for i in 0..5_000 {
                let _ = tree.insert_with(scrambled(i), i as u64, &worker);
            }
            drop(worker);
            tree
        });
    }
}

// =============================================================================
// Lookup Operations
// =============================================================================

#[divan::bench_group]
mod get {
    use super::{Bencher, BwTree, black_box, scrambled, setup_tree};

    #[divan::bench]
    fn get_from_empty(bencher: Bencher) {
        let tree: BwTree<u64, u64> = BwTree::new();
        bencher.bench_local(|| tree.get(black_box(&1)));
    }

    #[divan::bench(args = [100, 1_000, 10_000, 100_000])]
    fn get_hit(bencher: Bencher, n: usize) {
        let tree = setup_tree(n);
        let worker = tree.participant();
        let mut i = 0usize;
        bencher.bench_local(|| {
            i = (i + 1) % n;
            tree.get_with(black_box(&scrambled(i)), &worker)
        });
    }

    #[divan::bench(args = [1_000, 100_000])]
    fn get_miss(bencher: Bencher, n: usize) {
        let tree = setup_tree(n);
        let worker = tree.participant();
        bencher.bench_local(|| tree.get_with(black_box(&(scrambled(n) + 1)), &worker));
    }

    /// The short form registers a participant per call.
    #[divan::bench]
    fn get_transient_participant(bencher: Bencher) {
        let tree = setup_tree(10_000);
        bencher.bench_local(|| tree.get(black_box(&scrambled(5_000))));
    }
}

// =============================================================================
// Scans
// =============================================================================

#[divan::bench_group]
mod scan {
    use super::{Bencher, setup_tree};

    #[divan::bench(args = [1_000, 100_000])]
    fn full_scan(bencher: Bencher, n: usize) {
        let tree = setup_tree(n);
        bencher.bench_local(|| tree.iter().count());
    }

    #[divan::bench]
    fn range_from_100(bencher: Bencher) {
        let tree = setup_tree(100_000);
        bencher.bench_local(|| tree.range_from(&(u64::MAX / 2)).take(100).count());
    }
}

// =============================================================================
// Concurrent Operations
// =============================================================================

#[divan::bench_group]
mod concurrent {
    use super::{Arc, Bencher, BwTree, black_box, scrambled, setup_tree};

    #[divan::bench(threads = [1, 2, 4, 8])]
    fn concurrent_get(bencher: Bencher) {
        let tree = Arc::new(setup_tree(100_000));
        bencher.bench(|| {
            let worker = tree.participant();
            for i in 0..64 {
                black_box(tree.get_with(&scrambled(i * 1_000), &worker));
            }
        });
    }

    #[divan::bench(threads = [1, 2, 4, 8])]
    fn concurrent_insert(bencher: Bencher) {
        let tree: Arc<BwTree<u64, u64>> = Arc::new(BwTree::new());
        let next = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        bencher.bench(|| {
            let worker = tree.participant();
            let base = next.fetch_add(64, std::sync::atomic::Ordering::Relaxed);
            for i in base..base + 64 {
                let _ = tree.insert_with(scrambled(i), i as u64, &worker);
            }
        });
    }
}
