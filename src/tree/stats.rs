//! Structural statistics and invariant validation.
//!
//! Both walk every page and are meant for tests, tooling and debugging.
//! They are safe to call concurrently with mutations, but only a quiescent
//! index gives exact numbers, and [`BwTree::validate_with`] may report a
//! transient state (a counter mid-update, a page mid-split) as a violation.

use std::fmt as StdFmt;

use crate::comparator::KeyComparator;
use crate::epoch::{Guard, Participant};
use crate::mapping::{MAX_PID, Pid};
use crate::node::{InnerNode, LeafNode, Node};

use super::BwTree;

/// Shape of the index at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Live pages.
    pub pages: usize,
    /// Leaf pages.
    pub leaf_pages: usize,
    /// Inner pages.
    pub inner_pages: usize,
    /// Levels from the root to the leaves.
    pub height: usize,
    /// Entries, summed over leaf pages.
    pub entries: usize,
    /// Delta records over all pages.
    pub delta_records: usize,
    /// Longest delta chain.
    pub longest_chain: usize,
    /// Leaves below the underflow mark. Pages are never merged.
    pub sparse_leaves: usize,
}

/// A broken structural invariant found by [`BwTree::validate_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Page where the problem was found.
    pub pid: Pid,
    /// What is wrong.
    pub reason: &'static str,
}

impl StdFmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "page {}: {}", self.pid, self.reason)
    }
}

impl std::error::Error for InvariantViolation {}

const fn violation(pid: Pid, reason: &'static str) -> InvariantViolation {
    InvariantViolation { pid, reason }
}

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Levels from the root to the leaves (1 for a single leaf).
    pub fn height(&self) -> usize {
        self.height_with(&self.participant())
    }

    /// [`BwTree::height`] inside `participant`'s epoch scope.
    pub fn height_with(&self, participant: &Participant<'_>) -> usize {
        let guard: Guard<'_> = self.pin(participant);
        self.leftmost_height(&guard)
    }

    /// Page and chain statistics.
    pub fn stats(&self) -> TreeStats {
        self.stats_with(&self.participant())
    }

    /// [`BwTree::stats`] inside `participant`'s epoch scope.
    pub fn stats_with(&self, participant: &Participant<'_>) -> TreeStats {
        let guard: Guard<'_> = self.pin(participant);
        let mut stats = TreeStats {
            height: self.leftmost_height(&guard),
            ..TreeStats::default()
        };

        for pid in 0..self.mapping.allocated() {
            let Some(head) = self.try_load(pid, &guard) else {
                continue;
            };

            stats.pages += 1;
            stats.delta_records += head.chain_len();
            stats.longest_chain = stats.longest_chain.max(head.chain_len());

            if head.is_leaf() {
                stats.leaf_pages += 1;
                stats.entries += head.count();
                if head.count() < self.limits.leaf_min {
                    stats.sparse_leaves += 1;
                }
            } else {
                stats.inner_pages += 1;
            }
        }

        stats
    }

    /// Check ordering, bounds and routing of every page.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<TreeStats, InvariantViolation> {
        self.validate_with(&self.participant())
    }

    /// [`BwTree::validate`] inside `participant`'s epoch scope.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate_with(&self, participant: &Participant<'_>) -> Result<TreeStats, InvariantViolation> {
        {
            let guard: Guard<'_> = self.pin(participant);
            for pid in 0..self.mapping.allocated() {
                if let Some(head) = self.try_load(pid, &guard) {
                    if !head.is_leaf() {
                        self.check_inner(pid, &head.materialize_inner(&self.comparator))?;
                    }
                }
            }
            self.check_leaf_chain(&guard)?;
        }

        let stats: TreeStats = self.stats_with(participant);
        if stats.entries != self.len() {
            return Err(violation(self.root_pid(), "entry counter disagrees with leaf pages"));
        }
        Ok(stats)
    }

    fn check_inner(&self, pid: Pid, inner: &InnerNode<K>) -> Result<(), InvariantViolation> {
        let cmp: &C = &self.comparator;

        if inner.children.len() != inner.keys.len() + 1 {
            return Err(violation(pid, "inner page child count is not separators + 1"));
        }
        if inner.keys.windows(2).any(|pair: &[K]| !cmp.less(&pair[0], &pair[1])) {
            return Err(violation(pid, "separators not strictly increasing"));
        }
        if let (Some(high), Some(last)) = (&inner.high_key, inner.keys.last()) {
            if !cmp.less(last, high) {
                return Err(violation(pid, "separator above the page's high key"));
            }
        }
        Ok(())
    }

    /// Walk the sibling chain from the head leaf.
    fn check_leaf_chain(&self, guard: &Guard<'_>) -> Result<(), InvariantViolation> {
        let cmp: &C = &self.comparator;
        let mut pid: Pid = self.head_leaf;
        let mut left_high: Option<K> = None;
        // Leaves passed so far, in chain order.
        let mut walked: Vec<Pid> = Vec::new();

        while pid != MAX_PID {
            let head: &Node<K, V> = self.load(pid, guard);
            if !head.is_leaf() {
                return Err(violation(pid, "sibling chain reaches a non-leaf page"));
            }

            let leaf: LeafNode<K, V> = head.materialize_leaf(cmp);
            if leaf.len() != head.count() {
                return Err(violation(pid, "cached entry count drifted from content"));
            }
            if leaf.keys.windows(2).any(|pair: &[K]| cmp.less(&pair[1], &pair[0])) {
                return Err(violation(pid, "leaf keys out of order"));
            }
            if let (Some(high), Some(last)) = (&leaf.high_key, leaf.keys.last()) {
                if cmp.less(high, last) {
                    return Err(violation(pid, "leaf key above the page's high key"));
                }
            }
            if let (Some(bound), Some(first)) = (&left_high, leaf.keys.first()) {
                if !cmp.less(bound, first) {
                    return Err(violation(pid, "leaf overlaps its left sibling"));
                }
            }

            check_prev_leaf(pid, leaf.prev_leaf, &walked)?;

            if let Some(first) = leaf.keys.first() {
                if self.find_leaf(first, guard).pid != pid {
                    return Err(violation(pid, "descent does not route a key to its leaf"));
                }
            }

            walked.push(pid);
            left_high = leaf.high_key;
            pid = leaf.next_leaf;
        }

        let leaves: usize = (0..self.mapping.allocated())
            .filter_map(|pid: Pid| self.try_load(pid, guard))
            .filter(|head: &&Node<K, V>| head.is_leaf())
            .count();
        if leaves != walked.len() {
            return Err(violation(self.head_leaf, "leaf page missing from the sibling chain"));
        }
        Ok(())
    }
}

/// `prev` is the previous-leaf hint of `pid`, `walked` the leaves before it.
///
/// The hint is exact when a split creates the page. Splits further left
/// insert younger pages between the two, which PID order tells apart.
fn check_prev_leaf(pid: Pid, prev: Pid, walked: &[Pid]) -> Result<(), InvariantViolation> {
    if walked.is_empty() {
        return if prev == MAX_PID {
            Ok(())
        } else {
            Err(violation(pid, "head leaf has a previous leaf"))
        };
    }

    let Some(at) = walked.iter().rposition(|&left: &Pid| left == prev) else {
        return Err(violation(pid, "previous-leaf hint does not name a leaf to the left"));
    };
    if walked[at + 1..].iter().any(|&between: &Pid| between < pid) {
        return Err(violation(pid, "previous-leaf hint skips an older leaf"));
    }
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use crate::config::IndexConfig;
    use crate::epoch::Guard;
    use crate::mapping::{MAX_PID, Pid};
    use crate::node::Node;
    use crate::tree::BwTree;

    fn small_tree() -> BwTree<u64, u64> {
        BwTree::with_config(IndexConfig::default().with_page_bytes(64))
    }

    /// `(pid, prev_leaf)` of every leaf in sibling order.
    fn leaf_chain(tree: &BwTree<u64, u64>, guard: &Guard<'_>) -> Vec<(Pid, Pid)> {
        let mut out = Vec::new();
        let mut pid = tree.head_leaf;
        while pid != MAX_PID {
            let leaf = tree.load(pid, guard).materialize_leaf(&tree.comparator);
            out.push((pid, leaf.prev_leaf));
            pid = leaf.next_leaf;
        }
        out
    }

    #[test]
    fn test_single_leaf_stats() {
        let tree: BwTree<u64, u64> = BwTree::new();
        tree.insert(1, 1).unwrap();
        tree.insert(2, 2).unwrap();

        let stats = tree.validate().unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.leaf_pages, 1);
        assert_eq!(stats.height, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.delta_records, 2);
    }

    #[test]
    fn test_height_grows_past_one_leaf() {
        let tree: BwTree<u64, u64> = BwTree::new();
        let leaf_max: u64 = tree.limits().leaf_max as u64;
        for k in 0..=leaf_max * 4 {
            tree.insert(k, k).unwrap();
        }

        assert!(tree.height() >= 2);
        let stats = tree.validate().unwrap();
        assert!(stats.leaf_pages > 1);
        assert!(stats.inner_pages >= 1);
        assert_eq!(stats.entries, tree.len());
        for k in 0..=leaf_max * 4 {
            assert!(tree.exists(&k), "key {k}");
        }
    }

    #[test]
    fn test_erased_pages_go_sparse() {
        let tree: BwTree<u64, u64> = BwTree::with_config(IndexConfig::default().with_page_bytes(128));
        for k in 0..200 {
            tree.insert(k, k).unwrap();
        }
        for k in (0..200).filter(|k| k % 8 != 0) {
            assert_eq!(tree.erase(&k), Ok(1));
        }

        let stats = tree.validate().unwrap();
        assert_eq!(stats.entries, 25);
        assert!(stats.sparse_leaves > 0);
        let keys: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (0..200).step_by(8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_ascending_load_keeps_prev_leaf_exact() {
        let tree = small_tree();
        for k in 0..60 {
            tree.insert(k, k).unwrap();
        }
        tree.validate().unwrap();

        let worker = tree.participant();
        let guard = worker.pin();
        let chain = leaf_chain(&tree, &guard);
        assert!(chain.len() > 4);
        assert_eq!(chain[0].1, MAX_PID);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].1, pair[0].0, "leaf {}", pair[1].0);
        }
    }

    #[test]
    fn test_lower_splits_leave_prev_leaf_behind() {
        let tree = small_tree();
        for k in (0..60).rev() {
            tree.insert(k, k).unwrap();
        }
        tree.validate().unwrap();

        let worker = tree.participant();
        let guard = worker.pin();
        let chain = leaf_chain(&tree, &guard);
        assert!(chain.windows(2).any(|pair| pair[1].1 != pair[0].0));
    }

    #[test]
    fn test_prev_leaf_skipping_an_older_leaf_is_reported() {
        let tree = small_tree();
        for k in 0..20 {
            tree.insert(k, k).unwrap();
        }

        let worker = tree.participant();
        let third: Pid = {
            let guard = worker.pin();
            let chain = leaf_chain(&tree, &guard);
            let (third, _) = chain[2];
            let head = tree.load(third, &guard);
            let mut leaf = head.materialize_leaf(&tree.comparator);
            leaf.prev_leaf = chain[0].0;
            assert!(tree.install(third, head, Node::leaf(leaf), &guard).is_ok());
            tree.retire_chain(head, &guard);
            third
        };

        let err = tree.validate_with(&worker).unwrap_err();
        assert_eq!(err.pid, third);
        assert_eq!(err.reason, "previous-leaf hint skips an older leaf");
    }

    #[test]
    fn test_prev_leaf_checks() {
        use super::check_prev_leaf;

        assert!(check_prev_leaf(0, MAX_PID, &[]).is_ok());
        assert!(check_prev_leaf(0, 4, &[]).is_err());
        assert!(check_prev_leaf(5, 0, &[0]).is_ok());
        // 9 is younger than 5: created by a later split of 0.
        assert!(check_prev_leaf(5, 0, &[0, 9]).is_ok());
        assert!(check_prev_leaf(5, 0, &[0, 3]).is_err());
        assert!(check_prev_leaf(5, 7, &[0, 3]).is_err());
    }

    #[test]
    fn test_violation_display() {
        let v = super::violation(3, "leaf keys out of order");
        assert_eq!(v.to_string(), "page 3: leaf keys out of order");
    }
}
