//! Page representation: base nodes and the delta records layered on them.
//!
//! A page is a singly linked chain, newest first:
//!
//! ```text
//!   mapping[pid] -> Insert(k9) -> Delete(k3) -> Split(sep, side) -> Leaf{...}
//! ```
//!
//! Every node kind is one variant of [`NodeKind`]; the common header
//! ([`Node`]) carries the `origin` link and cached chain facts (delta count,
//! logical entry count). Nodes are immutable once published, so a reader
//! holding any node of a chain may walk to its base without synchronisation.
//!
//! # Key ranges
//!
//! A page covers `(low, high]`. After a split at separator `s` the page keeps
//! `(low, s]` and the new sibling takes `(s, high]`. Inner routing follows
//! the same rule: child `i` covers `(keys[i-1], keys[i]]`.
//!
//! Base nodes carry their own `high_key` and right link, so consolidating a
//! page that has an in-flight split keeps the redirect.

use std::fmt as StdFmt;
use std::ptr as StdPtr;

use crate::comparator::{KeyComparator, lower_bound, upper_bound};
use crate::mapping::{MAX_PID, Pid};
use crate::tracing_helpers::error_log;

// ============================================================================
//  Node kinds
// ============================================================================

/// Leaf base node: sorted slot arrays plus sibling links.
#[derive(Clone)]
pub(crate) struct LeafNode<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    /// Hint: a page whose keys are not greater than this page's.
    pub(crate) prev_leaf: Pid,
    /// Right sibling; also the redirect target for keys above `high_key`.
    pub(crate) next_leaf: Pid,
    /// Inclusive upper bound of this page, `None` for +inf.
    pub(crate) high_key: Option<K>,
}

impl<K, V> LeafNode<K, V> {
    pub(crate) const fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            prev_leaf: MAX_PID,
            next_leaf: MAX_PID,
            high_key: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Inner base node: `keys.len() + 1` children.
#[derive(Clone)]
pub(crate) struct InnerNode<K> {
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<Pid>,
    /// Inclusive upper bound of this page, `None` for +inf.
    pub(crate) high_key: Option<K>,
    /// Right sibling at the same level, `MAX_PID` if none.
    pub(crate) side_link: Pid,
}

/// One inserted record.
pub(crate) struct DeltaInsert<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
}

/// Logical removal of `key`; of only the `(key, value)` pairs when `value`
/// is set.
pub(crate) struct DeltaDelete<K, V> {
    pub(crate) key: K,
    pub(crate) value: Option<V>,
}

/// Index-term delta: keys in `(key_left, key_right]` now route to `child`
/// instead of `old_child`.
pub(crate) struct DeltaUpdate<K> {
    pub(crate) key_left: K,
    pub(crate) key_right: Option<K>,
    pub(crate) child: Pid,
    pub(crate) old_child: Pid,
}

/// The page was split: keys above `key` live in `side_link`.
pub(crate) struct DeltaSplit<K> {
    pub(crate) key: K,
    pub(crate) side_link: Pid,
    pub(crate) removed: usize,
}

/// The six node kinds.
pub(crate) enum NodeKind<K, V> {
    Leaf(LeafNode<K, V>),
    Inner(InnerNode<K>),
    Insert(DeltaInsert<K, V>),
    Delete(DeltaDelete<K, V>),
    Update(DeltaUpdate<K>),
    Split(DeltaSplit<K>),
}

// ============================================================================
//  Node
// ============================================================================

/// A node of a page chain.
///
/// `Box<Node>` does not own `origin`; chains are freed as a whole by
/// [`reclaim_chain`].
pub(crate) struct Node<K, V> {
    origin: *const Node<K, V>,
    chain_len: usize,
    count: usize,
    leaf: bool,
    pub(crate) kind: NodeKind<K, V>,
}

// SAFETY: Nodes are immutable after publication; the raw origin link is
// only dereferenced under an epoch guard.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Node<K, V> {}
// SAFETY: See above.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

impl<K, V> StdFmt::Debug for Node<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let kind: &str = match self.kind {
            NodeKind::Leaf(_) => "Leaf",
            NodeKind::Inner(_) => "Inner",
            NodeKind::Insert(_) => "DeltaInsert",
            NodeKind::Delete(_) => "DeltaDelete",
            NodeKind::Update(_) => "DeltaUpdate",
            NodeKind::Split(_) => "DeltaSplit",
        };
        f.debug_struct("Node")
            .field("kind", &kind)
            .field("chain_len", &self.chain_len)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<K, V> Node<K, V> {
    /// New leaf base node.
    pub(crate) fn leaf(leaf: LeafNode<K, V>) -> Box<Self> {
        Box::new(Self {
            origin: StdPtr::null(),
            chain_len: 0,
            count: leaf.len(),
            leaf: true,
            kind: NodeKind::Leaf(leaf),
        })
    }

    /// New inner base node.
    pub(crate) fn inner(inner: InnerNode<K>) -> Box<Self> {
        debug_assert_eq!(inner.children.len(), inner.keys.len() + 1);
        Box::new(Self {
            origin: StdPtr::null(),
            chain_len: 0,
            count: inner.keys.len(),
            leaf: false,
            kind: NodeKind::Inner(inner),
        })
    }

    /// New delta on top of `origin` with logical entry count `count`.
    pub(crate) fn delta(kind: NodeKind<K, V>, origin: &Self, count: usize) -> Box<Self> {
        debug_assert!(!matches!(kind, NodeKind::Leaf(_) | NodeKind::Inner(_)));
        Box::new(Self {
            origin: StdPtr::from_ref(origin),
            chain_len: origin.chain_len + 1,
            count,
            leaf: origin.leaf,
            kind,
        })
    }

    /// New leaf delta not yet linked into a chain.
    ///
    /// Mutators build the record once and [`rebase`](Self::rebase) it onto
    /// each head they try to replace.
    pub(crate) fn detached(kind: NodeKind<K, V>) -> Box<Self> {
        debug_assert!(matches!(kind, NodeKind::Insert(_) | NodeKind::Delete(_)));
        Box::new(Self {
            origin: StdPtr::null(),
            chain_len: 1,
            count: 0,
            leaf: true,
            kind,
        })
    }

    /// Relink an unpublished delta on top of `origin`.
    pub(crate) fn rebase(&mut self, origin: &Self, count: usize) {
        self.origin = StdPtr::from_ref(origin);
        self.chain_len = origin.chain_len + 1;
        self.count = count;
    }

    /// Key of an insert or delete record.
    pub(crate) fn record_key(&self) -> &K {
        match &self.kind {
            NodeKind::Insert(ins) => &ins.key,
            NodeKind::Delete(del) => &del.key,
            _ => structural_anomaly("record key of a non-record node"),
        }
    }

    /// Next older node of the chain; `None` at the base.
    #[inline]
    pub(crate) fn origin(&self) -> Option<&Self> {
        // SAFETY: A chain is retired as a unit, never below a live head, so
        // the origin outlives any reference to a node above it.
        unsafe { self.origin.as_ref() }
    }

    /// Number of delta records above the base (0 for a base node).
    #[inline]
    pub(crate) const fn chain_len(&self) -> usize {
        self.chain_len
    }

    /// Logical entries (leaf) or separators (inner) of the page.
    #[inline]
    pub(crate) const fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) const fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Iterate the chain from this node down to its base.
    pub(crate) const fn chain(&self) -> Chain<'_, K, V> {
        Chain { next: Some(self) }
    }

    /// Previous-leaf hint of a leaf chain. Deltas never change it.
    pub(crate) fn prev_leaf(&self) -> Pid {
        match self.chain().last().map(|node| &node.kind) {
            Some(NodeKind::Leaf(leaf)) => leaf.prev_leaf,
            _ => structural_anomaly("leaf chain without a leaf base"),
        }
    }

    /// Upper bound the page had before its newest split.
    ///
    /// `None` when that bound is unknown (the split was consolidated into the
    /// base) or the page was unbounded; either way it adds no cap.
    pub(crate) fn pre_split_high(&self) -> Option<&K> {
        self.chain()
            .find(|node: &&Self| matches!(node.kind, NodeKind::Split(_)))
            .and_then(Self::origin)
            .and_then(|older| older.high_and_right().0)
    }

    /// Newest split record of the chain or the base's bound: `(high, right)`.
    pub(crate) fn high_and_right(&self) -> (Option<&K>, Pid) {
        for node in self.chain() {
            match &node.kind {
                NodeKind::Split(split) => return (Some(&split.key), split.side_link),
                NodeKind::Leaf(leaf) => return (leaf.high_key.as_ref(), leaf.next_leaf),
                NodeKind::Inner(inner) => return (inner.high_key.as_ref(), inner.side_link),
                _ => {}
            }
        }
        structural_anomaly("chain without a base node")
    }
}

/// Iterator over a chain, newest first.
pub(crate) struct Chain<'n, K, V> {
    next: Option<&'n Node<K, V>>,
}

impl<'n, K, V> Iterator for Chain<'n, K, V> {
    type Item = &'n Node<K, V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let node: &'n Node<K, V> = self.next?;
        self.next = node.origin();
        Some(node)
    }
}

// ============================================================================
//  Leaf resolution
// ============================================================================

/// Outcome of resolving a key against a leaf chain.
pub(crate) enum LeafProbe<'n, V> {
    /// Matching values in iteration order (possibly empty).
    Values(Vec<&'n V>),
    /// The key lives on the right sibling.
    Redirect(Pid),
}

impl<K, V: PartialEq> Node<K, V> {
    /// Resolve `key` against this leaf chain.
    ///
    /// Deltas are folded newest first: an insert or delete for `key` shadows
    /// every older record for `key`. A split whose separator is below `key`
    /// redirects to the sibling.
    pub(crate) fn probe_leaf<C>(&self, key: &K, cmp: &C) -> LeafProbe<'_, V>
    where
        C: KeyComparator<K> + ?Sized,
    {
        // Values found in deltas, newest first.
        let mut newer: Vec<&V> = Vec::new();
        // Values removed by pair deletes seen so far.
        let mut excluded: Vec<&V> = Vec::new();

        for node in self.chain() {
            match &node.kind {
                NodeKind::Insert(ins) => {
                    if cmp.equal(&ins.key, key) && !excluded.contains(&&ins.value) {
                        newer.push(&ins.value);
                    }
                }

                NodeKind::Delete(del) => {
                    if cmp.equal(&del.key, key) {
                        match &del.value {
                            None => {
                                newer.reverse();
                                return LeafProbe::Values(newer);
                            }
                            Some(value) => excluded.push(value),
                        }
                    }
                }

                NodeKind::Split(split) => {
                    if cmp.less(&split.key, key) {
                        return LeafProbe::Redirect(split.side_link);
                    }
                }

                NodeKind::Leaf(leaf) => {
                    if leaf.high_key.as_ref().is_some_and(|high: &K| cmp.less(high, key)) {
                        return LeafProbe::Redirect(leaf.next_leaf);
                    }

                    let lo: usize = lower_bound(cmp, &leaf.keys, key);
                    let hi: usize = upper_bound(cmp, &leaf.keys, key);
                    let mut found: Vec<&V> = leaf.values[lo..hi]
                        .iter()
                        .filter(|value: &&V| !excluded.contains(value))
                        .collect();
                    found.extend(newer.into_iter().rev());
                    return LeafProbe::Values(found);
                }

                NodeKind::Inner(_) | NodeKind::Update(_) => {
                    structural_anomaly("inner node in a leaf chain")
                }
            }
        }

        structural_anomaly("leaf chain without a base node")
    }
}

impl<K: Clone, V: Clone + PartialEq> Node<K, V> {
    /// Fold this leaf chain into a fresh base node.
    ///
    /// Applies deltas oldest first onto a copy of the base's slot arrays.
    /// Produces exactly the content [`Node::probe_leaf`] observes.
    pub(crate) fn materialize_leaf<C>(&self, cmp: &C) -> LeafNode<K, V>
    where
        C: KeyComparator<K> + ?Sized,
    {
        let chain: Vec<&Self> = self.chain().collect();
        let Some((base, deltas)) = chain.split_last() else {
            structural_anomaly("empty chain");
        };
        let NodeKind::Leaf(base) = &base.kind else {
            structural_anomaly("leaf chain ends in a non-leaf base");
        };

        let mut out: LeafNode<K, V> = base.clone();

        for node in deltas.iter().rev() {
            match &node.kind {
                NodeKind::Insert(ins) => {
                    let at: usize = upper_bound(cmp, &out.keys, &ins.key);
                    out.keys.insert(at, ins.key.clone());
                    out.values.insert(at, ins.value.clone());
                }

                NodeKind::Delete(del) => {
                    let lo: usize = lower_bound(cmp, &out.keys, &del.key);
                    let hi: usize = upper_bound(cmp, &out.keys, &del.key);
                    match &del.value {
                        None => {
                            out.keys.drain(lo..hi);
                            out.values.drain(lo..hi);
                        }
                        Some(value) => {
                            let mut i: usize = hi;
                            while i > lo {
                                i -= 1;
                                if out.values[i] == *value {
                                    out.keys.remove(i);
                                    out.values.remove(i);
                                }
                            }
                        }
                    }
                }

                NodeKind::Split(split) => {
                    let keep: usize = upper_bound(cmp, &out.keys, &split.key);
                    debug_assert_eq!(out.keys.len() - keep, split.removed);
                    out.keys.truncate(keep);
                    out.values.truncate(keep);
                    out.high_key = Some(split.key.clone());
                    out.next_leaf = split.side_link;
                }

                NodeKind::Leaf(_) | NodeKind::Inner(_) | NodeKind::Update(_) => {
                    structural_anomaly("unexpected node in a leaf chain")
                }
            }
        }

        out
    }
}

// ============================================================================
//  Inner resolution
// ============================================================================

/// Outcome of routing a key through an inner chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InnerRoute<'n, K> {
    /// Descend into `pid`, whose range in this page ends at `high`.
    Child { pid: Pid, high: Option<&'n K> },
    /// The key belongs to the right sibling at this level.
    Sibling(Pid),
}

impl<K, V> Node<K, V> {
    /// Route `key` through this inner chain.
    ///
    /// An index-term delta whose range holds `key` short-circuits the rest
    /// of the chain. A split below `key` redirects to the sibling.
    pub(crate) fn route_inner<C>(&self, key: &K, cmp: &C) -> InnerRoute<'_, K>
    where
        C: KeyComparator<K> + ?Sized,
    {
        // Smallest separator at or above `key` seen so far: caps every child range.
        let mut cap: Option<&K> = None;

        for node in self.chain() {
            match &node.kind {
                NodeKind::Update(update) => {
                    let above_left: bool = cmp.less(&update.key_left, key);
                    let below_right: bool = update
                        .key_right
                        .as_ref()
                        .is_none_or(|right: &K| cmp.less_eq(key, right));
                    if above_left && below_right {
                        return InnerRoute::Child {
                            pid: update.child,
                            high: min_bound(update.key_right.as_ref(), cap, cmp),
                        };
                    }
                    if !above_left {
                        cap = min_bound(Some(&update.key_left), cap, cmp);
                    }
                }

                NodeKind::Split(split) => {
                    if cmp.less(&split.key, key) {
                        return InnerRoute::Sibling(split.side_link);
                    }
                    cap = min_bound(Some(&split.key), cap, cmp);
                }

                NodeKind::Inner(inner) => {
                    if inner.high_key.as_ref().is_some_and(|high: &K| cmp.less(high, key)) {
                        return InnerRoute::Sibling(inner.side_link);
                    }

                    let i: usize = lower_bound(cmp, &inner.keys, key);
                    let Some(&pid) = inner.children.get(i) else {
                        structural_anomaly("inner node with too few children");
                    };
                    let bound: Option<&K> = inner.keys.get(i).or(inner.high_key.as_ref());
                    return InnerRoute::Child {
                        pid,
                        high: min_bound(bound, cap, cmp),
                    };
                }

                NodeKind::Leaf(_) | NodeKind::Insert(_) | NodeKind::Delete(_) => {
                    structural_anomaly("leaf node in an inner chain")
                }
            }
        }

        structural_anomaly("inner chain without a base node")
    }
}

impl<K: Clone, V> Node<K, V> {
    /// Fold this inner chain into a fresh base node.
    pub(crate) fn materialize_inner<C>(&self, cmp: &C) -> InnerNode<K>
    where
        C: KeyComparator<K> + ?Sized,
    {
        let chain: Vec<&Self> = self.chain().collect();
        let Some((base, deltas)) = chain.split_last() else {
            structural_anomaly("empty chain");
        };
        let NodeKind::Inner(base) = &base.kind else {
            structural_anomaly("inner chain ends in a non-inner base");
        };

        let mut out: InnerNode<K> = base.clone();

        for node in deltas.iter().rev() {
            match &node.kind {
                NodeKind::Update(update) => {
                    // Routed past a later split of this page: the sibling
                    // gets its own index term.
                    let in_range: bool = out
                        .high_key
                        .as_ref()
                        .is_none_or(|high: &K| cmp.less(&update.key_left, high));
                    if !in_range {
                        continue;
                    }

                    let at: usize = lower_bound(cmp, &out.keys, &update.key_left);
                    if out.keys.get(at).is_some_and(|k: &K| cmp.equal(k, &update.key_left)) {
                        continue;
                    }
                    debug_assert_eq!(out.children.get(at), Some(&update.old_child));
                    out.keys.insert(at, update.key_left.clone());
                    out.children.insert(at + 1, update.child);
                }

                NodeKind::Split(split) => {
                    let keep: usize = lower_bound(cmp, &out.keys, &split.key);
                    out.keys.truncate(keep);
                    out.children.truncate(keep + 1);
                    out.high_key = Some(split.key.clone());
                    out.side_link = split.side_link;
                }

                NodeKind::Leaf(_) | NodeKind::Inner(_) | NodeKind::Insert(_) | NodeKind::Delete(_) => {
                    structural_anomaly("unexpected node in an inner chain")
                }
            }
        }

        out
    }
}

/// Smaller of two optional upper bounds (`None` is +inf).
fn min_bound<'a, K, C>(a: Option<&'a K>, b: Option<&'a K>, cmp: &C) -> Option<&'a K>
where
    C: KeyComparator<K> + ?Sized,
{
    match (a, b) {
        (Some(x), Some(y)) => Some(if cmp.less_eq(x, y) { x } else { y }),
        (x, None) => x,
        (None, y) => y,
    }
}

// ============================================================================
//  Reclamation and anomalies
// ============================================================================

/// Free a whole chain: the node at `ptr` and every node below it.
///
/// Epoch-manager callback.
///
/// # Safety
///
/// - `ptr` must be the head of a chain whose nodes were all created by
///   `Box::into_raw(Node::..)` and are owned by no other chain.
/// - No participant may still observe any node of the chain.
pub(crate) unsafe fn reclaim_chain<K, V>(ptr: *mut u8) {
    let mut cursor: *mut Node<K, V> = ptr.cast::<Node<K, V>>();
    while !cursor.is_null() {
        // SAFETY: Caller guarantees exclusive ownership of the chain.
        let node: Box<Node<K, V>> = unsafe { Box::from_raw(cursor) };
        cursor = node.origin.cast_mut();
    }
}

/// Abort on an inconsistent chain. Continuing could return wrong data.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn structural_anomaly(what: &str) -> ! {
    error_log!(anomaly = what, "structural anomaly in page chain");
    panic!("bwtree structural anomaly: {what}");
}

// ============================================================================
//  Tests
// ============================================================================
