//! Iteration over the leaf sibling chain.
//!
//! An iterator copies one leaf at a time. Each refill pins the epoch only
//! for the duration of the copy, so a long-lived iterator never holds back
//! reclamation. A leaf's content and its right link come from the same head,
//! so consecutive copies cover disjoint, increasing key ranges even while
//! pages split underneath the scan.
//!
//! There is no snapshot: a mutation made after the iterator was created is
//! seen if its leaf has not been copied yet.
//!
//! [`RevIter`] scans from the tail leaf to the left. Previous-leaf links are
//! hints that may lag behind splits, so stepping left walks right from the
//! hint until it reaches the page whose right link is the current leaf. Page
//! low bounds never move, so that page ends exactly where the current one
//! starts.

use std::fmt as StdFmt;
use std::iter::FusedIterator;
use std::vec::IntoIter as VecIntoIter;

use crate::comparator::{KeyComparator, OrdComparator};
use crate::epoch::{Guard, Participant};
use crate::mapping::{MAX_PID, Pid};
use crate::node::{LeafNode, Node, structural_anomaly};

use super::BwTree;

/// Participant used by an iterator: its own, or the caller's.
enum Worker<'t> {
    Owned(Participant<'t>),
    Borrowed(&'t Participant<'t>),
}

impl<'t> Worker<'t> {
    fn get(&self) -> &Participant<'t> {
        match self {
            Self::Owned(participant) => participant,
            Self::Borrowed(participant) => *participant,
        }
    }
}

/// Where a scan starts.
enum Start<K> {
    /// Leftmost leaf.
    First,
    /// First key not less than this one.
    From(K),
    /// Nothing to yield.
    End,
}

/// Lazy, finite, restartable scan yielding `(key, value)` pairs in key order.
pub struct Iter<'t, K, V, C = OrdComparator<K>> {
    tree: &'t BwTree<K, V, C>,
    worker: Worker<'t>,
    start: Start<K>,
    buffer: VecIntoIter<(K, V)>,
    /// Next leaf to copy, `MAX_PID` when the chain is exhausted.
    next_leaf: Pid,
    started: bool,
}

impl<K, V, C> StdFmt::Debug for Iter<'_, K, V, C> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Iter")
            .field("buffered", &self.buffer.len())
            .field("next_leaf", &self.next_leaf)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl<'t, K, V, C> Iter<'t, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    fn new(tree: &'t BwTree<K, V, C>, worker: Worker<'t>, start: Start<K>) -> Self {
        Self {
            tree,
            worker,
            start,
            buffer: Vec::new().into_iter(),
            next_leaf: MAX_PID,
            started: false,
        }
    }

    /// Whether the iterator was created at the end (a `find` miss).
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self.start, Start::End)
    }

    /// Rewind to the starting position. Pages are re-read, so the restarted
    /// scan reflects mutations made since the first pass.
    pub fn restart(&mut self) {
        self.buffer = Vec::new().into_iter();
        self.next_leaf = MAX_PID;
        self.started = false;
    }

    /// Copy the next leaf into the buffer. Returns `false` at the end.
    fn refill(&mut self) -> bool {
        let guard: Guard<'_> = self.worker.get().pin();

        let (head, lower): (&Node<K, V>, Option<&K>) = if self.started {
            if self.next_leaf == MAX_PID {
                return false;
            }
            (self.tree.load(self.next_leaf, &guard), None)
        } else {
            self.started = true;
            match &self.start {
                Start::End => return false,
                Start::First => (self.tree.load(self.tree.head_leaf, &guard), None),
                Start::From(key) => (self.tree.find_leaf(key, &guard).head, Some(key)),
            }
        };

        let leaf: LeafNode<K, V> = head.materialize_leaf(&self.tree.comparator);
        self.next_leaf = leaf.next_leaf;

        let cmp: &C = &self.tree.comparator;
        let entries: Vec<(K, V)> = leaf
            .keys
            .into_iter()
            .zip(leaf.values)
            .filter(|(key, _)| lower.is_none_or(|bound: &K| !cmp.less(key, bound)))
            .collect();
        self.buffer = entries.into_iter();
        true
    }
}

impl<K, V, C> Iterator for Iter<'_, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.next() {
                return Some(entry);
            }
            if !self.refill() {
                return None;
            }
        }
    }
}

impl<K, V, C> FusedIterator for Iter<'_, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
}

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Scan the whole index in key order.
    pub fn iter(&self) -> Iter<'_, K, V, C> {
        Iter::new(self, Worker::Owned(self.participant()), Start::First)
    }

    /// [`BwTree::iter`] using `participant` for its epoch scopes.
    pub fn iter_with<'t>(&'t self, participant: &'t Participant<'t>) -> Iter<'t, K, V, C> {
        self.check_participant(participant);
        Iter::new(self, Worker::Borrowed(participant), Start::First)
    }

    /// Scan entries whose key is not less than `key`.
    pub fn range_from(&self, key: &K) -> Iter<'_, K, V, C> {
        Iter::new(self, Worker::Owned(self.participant()), Start::From(key.clone()))
    }

    /// [`BwTree::range_from`] using `participant` for its epoch scopes.
    pub fn range_from_with<'t>(&'t self, key: &K, participant: &'t Participant<'t>) -> Iter<'t, K, V, C> {
        self.check_participant(participant);
        Iter::new(self, Worker::Borrowed(participant), Start::From(key.clone()))
    }

    /// Iterator positioned at the first entry for `key`, or an end iterator
    /// (see [`Iter::is_end`]) if `key` is absent.
    pub fn find(&self, key: &K) -> Iter<'_, K, V, C> {
        let worker: Participant<'_> = self.participant();
        let start: Start<K> = self.find_start(key, &worker);
        Iter::new(self, Worker::Owned(worker), start)
    }

    /// [`BwTree::find`] using `participant` for its epoch scopes.
    pub fn find_with<'t>(&'t self, key: &K, participant: &'t Participant<'t>) -> Iter<'t, K, V, C> {
        let start: Start<K> = self.find_start(key, participant);
        Iter::new(self, Worker::Borrowed(participant), start)
    }

    fn find_start(&self, key: &K, participant: &Participant<'_>) -> Start<K> {
        if self.exists_with(key, participant) {
            Start::From(key.clone())
        } else {
            Start::End
        }
    }
}

/// Lazy, finite, restartable scan yielding `(key, value)` pairs in
/// descending key order. Equal keys come out in the reverse of [`Iter`]'s
/// order.
pub struct RevIter<'t, K, V, C = OrdComparator<K>> {
    tree: &'t BwTree<K, V, C>,
    worker: Worker<'t>,
    buffer: VecIntoIter<(K, V)>,
    /// Leaf copied last, `MAX_PID` before the first refill.
    current: Pid,
    exhausted: bool,
}

impl<K, V, C> StdFmt::Debug for RevIter<'_, K, V, C> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("RevIter")
            .field("buffered", &self.buffer.len())
            .field("current", &self.current)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl<'t, K, V, C> RevIter<'t, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    fn new(tree: &'t BwTree<K, V, C>, worker: Worker<'t>) -> Self {
        Self {
            tree,
            worker,
            buffer: Vec::new().into_iter(),
            current: MAX_PID,
            exhausted: false,
        }
    }

    /// Rewind to the tail of the index.
    pub fn restart(&mut self) {
        self.buffer = Vec::new().into_iter();
        self.current = MAX_PID;
        self.exhausted = false;
    }

    fn refill(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        let guard: Guard<'_> = self.worker.get().pin();

        let step: Option<(Pid, &Node<K, V>)> = if self.current == MAX_PID {
            Some(self.tree.tail_leaf(&guard))
        } else {
            self.tree.left_neighbour(self.current, &guard)
        };
        let Some((pid, head)) = step else {
            self.exhausted = true;
            return false;
        };
        self.current = pid;

        let leaf: LeafNode<K, V> = head.materialize_leaf(&self.tree.comparator);
        let mut entries: Vec<(K, V)> = leaf.keys.into_iter().zip(leaf.values).collect();
        entries.reverse();
        self.buffer = entries.into_iter();
        true
    }
}

impl<K, V, C> Iterator for RevIter<'_, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.next() {
                return Some(entry);
            }
            if !self.refill() {
                return None;
            }
        }
    }
}

impl<K, V, C> FusedIterator for RevIter<'_, K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
}

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Scan the whole index in descending key order.
    pub fn iter_rev(&self) -> RevIter<'_, K, V, C> {
        RevIter::new(self, Worker::Owned(self.participant()))
    }

    /// [`BwTree::iter_rev`] using `participant` for its epoch scopes.
    pub fn iter_rev_with<'t>(&'t self, participant: &'t Participant<'t>) -> RevIter<'t, K, V, C> {
        self.check_participant(participant);
        RevIter::new(self, Worker::Borrowed(participant))
    }

    /// The rightmost leaf: descend through last children and follow right
    /// links until a page has no upper bound.
    fn tail_leaf<'g>(&'g self, guard: &'g Guard<'_>) -> (Pid, &'g Node<K, V>) {
        let mut pid: Pid = self.root_pid();
        loop {
            let head: &'g Node<K, V> = self.load(pid, guard);
            let (high, right) = head.high_and_right();
            if high.is_some() {
                pid = right;
                continue;
            }
            if head.is_leaf() {
                return (pid, head);
            }

            let Some(&last) = head.materialize_inner(&self.comparator).children.last() else {
                structural_anomaly("inner page without children");
            };
            pid = last;
        }
    }

    /// The leaf whose right link is `pid`, or `None` for the head leaf.
    fn left_neighbour<'g>(&'g self, pid: Pid, guard: &'g Guard<'_>) -> Option<(Pid, &'g Node<K, V>)> {
        let mut at: Pid = self.load(pid, guard).prev_leaf();
        while at != MAX_PID {
            let head: &'g Node<K, V> = self.load(at, guard);
            let (_, right) = head.high_and_right();
            if right == pid {
                return Some((at, head));
            }
            at = right;
        }
        if pid != self.head_leaf {
            structural_anomaly("previous-leaf hint is not left of its page");
        }
        None
    }
}

impl<'t, K, V, C> IntoIterator for &'t BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    type Item = (K, V);
    type IntoIter = Iter<'t, K, V, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::config::IndexConfig;
    use crate::tree::BwTree;

    fn small_tree() -> BwTree<u64, u64> {
        BwTree::with_config(IndexConfig::default().with_page_bytes(64))
    }

    #[test]
    fn test_empty_tree_iterates_nothing() {
        let tree = small_tree();
        assert_eq!(tree.iter().count(), 0);
        assert!(tree.find(&1).is_end());
        assert_eq!(tree.find(&1).next(), None);
    }

    #[test]
    fn test_iter_in_key_order_across_leaves() {
        let tree = small_tree();
        for k in (0..200).rev() {
            tree.insert(k, k + 1).unwrap();
        }

        let entries: Vec<(u64, u64)> = tree.iter().collect();
        let expected: Vec<(u64, u64)> = (0..200).map(|k| (k, k + 1)).collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_find_positions_at_key() {
        let tree = small_tree();
        for k in (0..100).step_by(2) {
            tree.insert(k, k).unwrap();
        }

        let mut it = tree.find(&40);
        assert!(!it.is_end());
        assert_eq!(it.next(), Some((40, 40)));
        assert_eq!(it.next(), Some((42, 42)));

        assert!(tree.find(&41).is_end());
    }

    #[test]
    fn test_range_from_between_keys() {
        let tree = small_tree();
        for k in (0..100).step_by(10) {
            tree.insert(k, k).unwrap();
        }

        let keys: Vec<u64> = tree.range_from(&35).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![40, 50, 60, 70, 80, 90]);
        assert_eq!(tree.range_from(&95).count(), 0);
    }

    #[test]
    fn test_duplicates_yield_every_value() {
        let tree: BwTree<u64, u64> =
            BwTree::with_config(IndexConfig::default().with_page_bytes(64).with_duplicates(true));
        for v in 0..3 {
            tree.insert(1, v).unwrap();
            tree.insert(2, v).unwrap();
        }

        let entries: Vec<(u64, u64)> = tree.find(&2).collect();
        assert_eq!(entries, vec![(2, 0), (2, 1), (2, 2)]);
    }

    #[test]
    fn test_restart_sees_later_mutations() {
        let tree = small_tree();
        let worker = tree.participant();
        for k in 0..10 {
            tree.insert_with(k, k, &worker).unwrap();
        }

        let mut it = tree.iter_with(&worker);
        assert_eq!(it.by_ref().count(), 10);
        assert_eq!(it.next(), None);

        tree.insert_with(10, 10, &worker).unwrap();
        tree.erase_with(&0, &worker).unwrap();
        it.restart();
        let keys: Vec<u64> = it.map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_reverse_scan_mirrors_forward_scan() {
        let tree = small_tree();
        assert_eq!(tree.iter_rev().count(), 0);

        // Descending inserts split the head leaf over and over, so most
        // previous-leaf hints lag behind.
        for k in (0..200).rev() {
            tree.insert(k, k + 1).unwrap();
        }
        for k in 200..260 {
            tree.insert(k, k + 1).unwrap();
        }

        let mut forward: Vec<(u64, u64)> = tree.iter().collect();
        forward.reverse();
        let backward: Vec<(u64, u64)> = tree.iter_rev().collect();
        assert_eq!(backward.len(), 260);
        assert_eq!(backward, forward);
    }

    #[test]
    fn test_reverse_scan_of_duplicates() {
        let tree: BwTree<u64, u64> =
            BwTree::with_config(IndexConfig::default().with_page_bytes(64).with_duplicates(true));
        for v in 0..3 {
            tree.insert(1, v).unwrap();
            tree.insert(2, v).unwrap();
        }

        let entries: Vec<(u64, u64)> = tree.iter_rev().collect();
        assert_eq!(entries, vec![(2, 2), (2, 1), (2, 0), (1, 2), (1, 1), (1, 0)]);
    }

    #[test]
    fn test_reverse_restart_and_pinning() {
        let tree = small_tree();
        let worker = tree.participant();
        for k in 0..30 {
            tree.insert_with(k, k, &worker).unwrap();
        }

        let mut it = tree.iter_rev_with(&worker);
        assert_eq!(it.next(), Some((29, 29)));
        assert!(!worker.is_active());
        assert_eq!(it.by_ref().count(), 29);
        assert_eq!(it.next(), None);

        tree.insert_with(30, 30, &worker).unwrap();
        it.restart();
        assert_eq!(it.next(), Some((30, 30)));
    }

    #[test]
    fn test_reverse_scan_races_lower_splits() {
        let tree: Arc<BwTree<u64, u64>> = Arc::new(small_tree());
        for k in (1_000..2_000).step_by(2) {
            tree.insert(k, k).unwrap();
        }

        let writer = {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let worker = tree.participant();
                for k in (1_001..2_000).step_by(2) {
                    tree.insert_with(k, k, &worker).unwrap();
                }
            })
        };

        for _ in 0..20 {
            let keys: Vec<u64> = tree.iter_rev().map(|(k, _)| k).collect();
            assert!(keys.windows(2).all(|pair| pair[0] > pair[1]));
            // Keys present before the scan started are never skipped.
            assert!((1_000..2_000).step_by(2).all(|k| keys.binary_search_by(|other| k.cmp(other)).is_ok()));
        }

        writer.join().unwrap();
        assert_eq!(tree.iter_rev().count(), 1_000);
        tree.validate().unwrap();
    }

    #[test]
    fn test_iterator_does_not_pin_between_leaves() {
        let tree = small_tree();
        for k in 0..50 {
            tree.insert(k, k).unwrap();
        }

        let worker = tree.participant();
        let mut it = tree.iter_with(&worker);
        assert!(it.next().is_some());
        assert!(!worker.is_active());
    }
}
