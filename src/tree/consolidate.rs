//! Delta-chain compaction.
//!
//! A long chain is folded into a fresh base node with the same logical
//! content, and the base is CASed over the observed head. The whole old
//! chain is retired as one unit. Losing the CAS just drops the new base;
//! whoever changed the page will trigger consolidation again if needed.

use crate::comparator::KeyComparator;
use crate::epoch::Guard;
use crate::mapping::Pid;
use crate::node::Node;
use crate::tracing_helpers::{debug_log, trace_log};

use super::BwTree;

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Replace the chain headed by `head` with one base node.
    ///
    /// Returns whether the new base was installed.
    pub(super) fn try_consolidate(&self, pid: Pid, head: &Node<K, V>, guard: &Guard<'_>) -> bool {
        let base: Box<Node<K, V>> = if head.is_leaf() {
            let base: Box<Node<K, V>> = Node::leaf(head.materialize_leaf(&self.comparator));
            debug_assert_eq!(base.count(), head.count(), "leaf count drifted from content");
            base
        } else {
            Node::inner(head.materialize_inner(&self.comparator))
        };

        match self.install(pid, head, base, guard) {
            Ok(_) => {
                self.retire_chain(head, guard);
                debug_log!(pid, chain_len = head.chain_len(), "consolidated page");
                true
            }

            Err(_) => {
                trace_log!(pid, "consolidation CAS lost");
                false
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use crate::config::IndexConfig;
    use crate::tree::BwTree;

    fn collect(tree: &BwTree<u64, u64>) -> Vec<(u64, u64)> {
        tree.iter().collect()
    }

    #[test]
    fn test_consolidation_preserves_content() {
        let config = IndexConfig::default()
            .with_duplicates(true)
            .with_page_bytes(4096)
            .with_consolidate_threshold(1_000);
        let tree: BwTree<u64, u64> = BwTree::with_config(config);

        for k in 0..40 {
            tree.insert(k % 10, k).unwrap();
        }
        tree.erase_pair(&3, &13).unwrap();
        tree.erase(&7).unwrap();

        let before = collect(&tree);
        let worker = tree.participant();
        {
            let guard = worker.pin();
            let target = tree.find_leaf(&0, &guard);
            assert!(target.head.chain_len() > 40);
            assert!(tree.try_consolidate(target.pid, target.head, &guard));

            let after = tree.find_leaf(&0, &guard);
            assert_eq!(after.head.chain_len(), 0);
            assert_eq!(after.head.count(), before.len());
        }

        assert_eq!(collect(&tree), before);
        assert_eq!(tree.get_all(&3), vec![3, 23, 33]);
        assert_eq!(tree.count(&7), 0);
    }

    #[test]
    fn test_consolidation_against_stale_head_fails() {
        let config = IndexConfig::default().with_consolidate_threshold(1_000);
        let tree: BwTree<u64, u64> = BwTree::with_config(config);
        tree.insert(1, 1).unwrap();

        let worker = tree.participant();
        let guard = worker.pin();
        let stale = tree.find_leaf(&1, &guard);
        tree.insert_with(2, 2, &worker).unwrap();

        assert!(!tree.try_consolidate(stale.pid, stale.head, &guard));
        assert_eq!(tree.get_with(&2, &worker), Some(2));
    }

    #[test]
    fn test_old_chain_retired_and_reclaimed() {
        let config = IndexConfig::default()
            .with_consolidate_threshold(2)
            .with_gc_flush_threshold(0);
        let tree: BwTree<u64, u64> = BwTree::with_config(config);

        let worker = tree.participant();
        for k in 0..30 {
            tree.insert_with(k, k, &worker).unwrap();
        }
        worker.flush();

        let epoch = tree.epoch();
        assert!(epoch.retired_count() > 0);
        assert_eq!(epoch.pending_count(), 0);
    }

    #[test]
    fn test_readers_see_same_content_during_consolidation() {
        let config = IndexConfig::default()
            .with_duplicates(true)
            .with_page_bytes(4096)
            .with_consolidate_threshold(2);
        let tree: Arc<BwTree<u64, u64>> = Arc::new(BwTree::with_config(config));
        for k in 0..64 {
            tree.insert(k, k).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let tree = Arc::clone(&tree);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let worker = tree.participant();
                    while !stop.load(Ordering::Relaxed) {
                        for k in 0..64 {
                            assert_eq!(tree.get_with(&k, &worker), Some(k), "key {k}");
                        }
                    }
                })
            })
            .collect();

        // Insert and erase keys the readers never ask for: every mutation
        // lengthens the chain and consolidation keeps replacing the page.
        let writer = tree.participant();
        for round in 0..2_000 {
            let key: u64 = 1_000 + round % 7;
            tree.insert_with(key, round, &writer).unwrap();
            tree.erase_with(&key, &writer).unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(tree.len(), 64);
    }
}
