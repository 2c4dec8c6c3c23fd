//! `BwTree` - a latch-free ordered index built from delta chains.
//!
//! This module holds the tree handle, its error type and the public
//! operations. Each protocol step lives in its own submodule:
//!
//! - [`traverse`]: root-to-leaf descent, following split redirects
//! - [`mutate`]: insert/erase delta installation and the retry loop
//! - [`split`]: two-step split, help-along and root growth
//! - [`consolidate`]: delta-chain compaction
//! - [`iter`]: forward scans over the leaf sibling chain
//! - [`stats`]: structural statistics and invariant validation
//!
//! Every operation runs inside an epoch scope of a [`Participant`]. The
//! `*_with` methods take the caller's participant; the short forms register
//! a transient one per call.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::comparator::{KeyComparator, OrdComparator};
use crate::config::{IndexConfig, SlotLimits};
use crate::epoch::{EpochManager, Guard, Participant};
use crate::mapping::{MappingTable, Pid};
use crate::node::{LeafNode, Node, reclaim_chain, structural_anomaly};
use crate::ordering::{READ_ORD, RELAXED};
use crate::tracing_helpers::{debug_log, warn_log};

mod consolidate;
mod iter;
mod mutate;
mod split;
mod stats;
mod traverse;


#[cfg(test)]
pub(crate) mod test_hooks;

pub use iter::{Iter, RevIter};
pub use stats::{InvariantViolation, TreeStats};

// ============================================================================
//  IndexError
// ============================================================================

/// Errors surfaced by mutating operations.
///
/// Contention is never an error: a lost CAS re-traverses and retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The key is already present and the index holds unique keys.
    /// The page was not modified.
    DuplicateKey,

    /// The operation lost its CAS more often than
    /// [`IndexConfig::max_retries`] allows.
    RetryLimitExceeded {
        /// Attempts made before giving up.
        attempts: usize,
    },
}

impl StdFmt::Display for IndexError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "key already present in a unique index"),

            Self::RetryLimitExceeded { attempts } => {
                write!(f, "gave up after {attempts} contended attempts")
            }
        }
    }
}

impl std::error::Error for IndexError {}

// ============================================================================
//  BwTree
// ============================================================================

/// A concurrent ordered index mapping `K` to one value (map) or many values
/// (multiset) of type `V`.
///
/// Pages are named by PIDs; the mapping table holds the head of each page's
/// delta chain and is only ever changed by compare-and-swap. Keys are ordered
/// by `C`, never by `K`'s own traits.
///
/// # Example
///
/// ```rust
/// use bwtree::{BwTree, IndexConfig, IndexError};
///
/// let tree: BwTree<u64, &str> = BwTree::new();
/// tree.insert(5, "a").unwrap();
/// assert_eq!(tree.insert(5, "b"), Err(IndexError::DuplicateKey));
/// assert_eq!(tree.get(&5), Some("a"));
///
/// let multi: BwTree<u64, &str> = BwTree::with_config(IndexConfig::default().with_duplicates(true));
/// multi.insert(5, "a").unwrap();
/// multi.insert(5, "b").unwrap();
/// assert_eq!(multi.count(&5), 2);
/// ```
pub struct BwTree<K, V, C = OrdComparator<K>> {
    /// PID -> current page head.
    mapping: MappingTable<Node<K, V>>,

    /// PID of the root page. Changes only when the root grows.
    root: AtomicU64,

    /// Leftmost leaf. Splits move the upper half away, so it never changes
    /// until [`BwTree::clear`].
    head_leaf: Pid,

    comparator: C,

    config: IndexConfig,

    limits: SlotLimits,

    /// Deferred reclamation of unlinked chains.
    epoch: EpochManager,

    /// Logical number of entries.
    count: AtomicUsize,

    #[cfg(test)]
    hooks: test_hooks::SplitHooks,
}

impl<K, V, C> StdFmt::Debug for BwTree<K, V, C> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BwTree")
            .field("root", &self.root.load(RELAXED))
            .field("head_leaf", &self.head_leaf)
            .field("len", &self.count.load(RELAXED))
            .field("pages", &self.mapping.allocated())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
{
    /// Create an empty unique-key index with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(IndexConfig::default())
    }

    /// Create an empty index ordered by `K: Ord`.
    #[must_use]
    pub fn with_config(config: IndexConfig) -> Self {
        Self::with_comparator(config, OrdComparator::new())
    }
}

impl<K, V> Default for BwTree<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Create an empty index ordered by `comparator`.
    #[must_use]
    pub fn with_comparator(config: IndexConfig, comparator: C) -> Self {
        let mapping: MappingTable<Node<K, V>> = MappingTable::new();
        let head_leaf: Pid = allocate_root_leaf(&mapping);
        let limits: SlotLimits = config.slot_limits::<K, V>();

        debug_log!(
            leaf_max = limits.leaf_max,
            inner_max = limits.inner_max,
            allow_duplicates = config.allow_duplicates,
            "created index"
        );

        Self {
            mapping,
            root: AtomicU64::new(head_leaf),
            head_leaf,
            comparator,
            epoch: EpochManager::new(config.gc_flush_threshold),
            config,
            limits,
            count: AtomicUsize::new(0),
            #[cfg(test)]
            hooks: test_hooks::SplitHooks::default(),
        }
    }

    // ========================================================================
    //  Handles and configuration
    // ========================================================================

    /// Register a worker with this index's epoch manager.
    ///
    /// Keep one per thread and pass it to the `*_with` methods.
    pub fn participant(&self) -> Participant<'_> {
        self.epoch.register()
    }

    /// The epoch manager reclaiming this index's retired pages.
    #[must_use]
    pub const fn epoch(&self) -> &EpochManager {
        &self.epoch
    }

    /// Construction-time configuration.
    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Slot limits derived from the page budget.
    #[must_use]
    pub const fn limits(&self) -> SlotLimits {
        self.limits
    }

    /// The key comparator.
    #[must_use]
    pub const fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Number of entries. Exact when no mutation is in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(RELAXED)
    }

    /// Whether the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    //  Point operations
    // ========================================================================

    /// Insert `(key, value)`.
    ///
    /// # Errors
    ///
    /// [`IndexError::DuplicateKey`] if the key exists and duplicates are not
    /// allowed; [`IndexError::RetryLimitExceeded`] under unbounded contention.
    pub fn insert(&self, key: K, value: V) -> Result<(), IndexError> {
        self.insert_with(key, value, &self.participant())
    }

    /// Insert `(key, value)` inside `participant`'s epoch scope.
    ///
    /// # Errors
    ///
    /// See [`BwTree::insert`].
    pub fn insert_with(&self, key: K, value: V, participant: &Participant<'_>) -> Result<(), IndexError> {
        let guard: Guard<'_> = self.pin(participant);
        self.insert_record(key, value, &guard)
    }

    /// Remove every entry for `key`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`IndexError::RetryLimitExceeded`] under unbounded contention.
    pub fn erase(&self, key: &K) -> Result<usize, IndexError> {
        self.erase_with(key, &self.participant())
    }

    /// [`BwTree::erase`] inside `participant`'s epoch scope.
    ///
    /// # Errors
    ///
    /// See [`BwTree::erase`].
    pub fn erase_with(&self, key: &K, participant: &Participant<'_>) -> Result<usize, IndexError> {
        let guard: Guard<'_> = self.pin(participant);
        self.erase_records(key, None, &guard)
    }

    /// Remove the entries matching both `key` and `value`.
    ///
    /// # Errors
    ///
    /// [`IndexError::RetryLimitExceeded`] under unbounded contention.
    pub fn erase_pair(&self, key: &K, value: &V) -> Result<usize, IndexError> {
        self.erase_pair_with(key, value, &self.participant())
    }

    /// [`BwTree::erase_pair`] inside `participant`'s epoch scope.
    ///
    /// # Errors
    ///
    /// See [`BwTree::erase_pair`].
    pub fn erase_pair_with(
        &self,
        key: &K,
        value: &V,
        participant: &Participant<'_>,
    ) -> Result<usize, IndexError> {
        let guard: Guard<'_> = self.pin(participant);
        self.erase_records(key, Some(value), &guard)
    }

    /// Whether `key` has at least one entry.
    pub fn exists(&self, key: &K) -> bool {
        self.exists_with(key, &self.participant())
    }

    /// [`BwTree::exists`] inside `participant`'s epoch scope.
    pub fn exists_with(&self, key: &K, participant: &Participant<'_>) -> bool {
        self.count_with(key, participant) > 0
    }

    /// Number of entries for `key`.
    pub fn count(&self, key: &K) -> usize {
        self.count_with(key, &self.participant())
    }

    /// [`BwTree::count`] inside `participant`'s epoch scope.
    pub fn count_with(&self, key: &K, participant: &Participant<'_>) -> usize {
        let guard: Guard<'_> = self.pin(participant);
        self.find_leaf(key, &guard).values.len()
    }

    /// First value stored for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_with(key, &self.participant())
    }

    /// [`BwTree::get`] inside `participant`'s epoch scope.
    pub fn get_with(&self, key: &K, participant: &Participant<'_>) -> Option<V> {
        let guard: Guard<'_> = self.pin(participant);
        let values: Vec<&V> = self.find_leaf(key, &guard).values;
        values.first().map(|value: &&V| (*value).clone())
    }

    /// Every value stored for `key`, in iteration order.
    pub fn get_all(&self, key: &K) -> Vec<V> {
        self.get_all_with(key, &self.participant())
    }

    /// [`BwTree::get_all`] inside `participant`'s epoch scope.
    pub fn get_all_with(&self, key: &K, participant: &Participant<'_>) -> Vec<V> {
        let guard: Guard<'_> = self.pin(participant);
        self.find_leaf(key, &guard)
            .values
            .into_iter()
            .cloned()
            .collect()
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    /// Drop every page and restart with a single empty leaf.
    pub fn clear(&mut self) {
        self.free_pages();
        // No participant can exist under `&mut self`: every orphan is free.
        self.epoch.flush();

        let head_leaf: Pid = allocate_root_leaf(&self.mapping);
        *self.root.get_mut() = head_leaf;
        self.head_leaf = head_leaf;
        *self.count.get_mut() = 0;

        debug_log!(head_leaf, "cleared index");
    }

    // ========================================================================
    //  Page access (shared by the protocol submodules)
    // ========================================================================

    /// Enter `participant`'s epoch scope.
    ///
    /// # Panics
    ///
    /// Panics if `participant` belongs to another index: its epoch would not
    /// protect this index's pages.
    fn pin<'p>(&self, participant: &'p Participant<'_>) -> Guard<'p> {
        self.check_participant(participant);
        participant.pin()
    }

    fn check_participant(&self, participant: &Participant<'_>) {
        assert!(
            StdPtr::eq(participant.manager(), &self.epoch),
            "participant registered with a different index"
        );
    }

    #[inline]
    fn root_pid(&self) -> Pid {
        self.root.load(READ_ORD)
    }

    /// Current head of page `pid`.
    #[inline]
    fn load<'g>(&'g self, pid: Pid, guard: &'g Guard<'_>) -> &'g Node<K, V> {
        match self.try_load(pid, guard) {
            Some(head) => head,
            None => structural_anomaly("reference to a PID without a page"),
        }
    }

    /// Current head of page `pid`, `None` if the PID names no page.
    #[inline]
    fn try_load<'g>(&'g self, pid: Pid, _guard: &'g Guard<'_>) -> Option<&'g Node<K, V>> {
        let head: *mut Node<K, V> = self.mapping.get(pid);
        // SAFETY: The guard keeps us inside an epoch scope, so a chain
        // unlinked after this load is not freed before the guard drops.
        unsafe { head.as_ref() }
    }

    /// Replace the head of `pid` with `node` if it is still `expected`.
    ///
    /// Gives `node` back when the CAS loses.
    fn install<'g>(
        &'g self,
        pid: Pid,
        expected: &Node<K, V>,
        node: Box<Node<K, V>>,
        _guard: &'g Guard<'_>,
    ) -> Result<&'g Node<K, V>, Box<Node<K, V>>> {
        let new: *mut Node<K, V> = Box::into_raw(node);
        let old: *mut Node<K, V> = StdPtr::from_ref(expected).cast_mut();

        if self.mapping.compare_and_swap(pid, old, new) {
            // SAFETY: Published; freed only through the epoch manager.
            Ok(unsafe { &*new })
        } else {
            // SAFETY: The CAS failed, so `new` was never published.
            Err(unsafe { Box::from_raw(new) })
        }
    }

    /// Publish a fresh base node under a new PID.
    fn allocate_page(&self, node: Box<Node<K, V>>) -> Option<Pid> {
        let ptr: *mut Node<K, V> = Box::into_raw(node);
        match self.mapping.allocate(ptr) {
            Ok(pid) => Some(pid),

            Err(_) => {
                // SAFETY: Allocation failed, so `ptr` was never published.
                drop(unsafe { Box::from_raw(ptr) });
                warn_log!("no PID available for a new page");
                None
            }
        }
    }

    /// Unpublish a page nobody was told about and retire its node.
    fn abandon_page(&self, pid: Pid, guard: &Guard<'_>) {
        let head: *mut Node<K, V> = self.mapping.get(pid);
        if !head.is_null() && self.mapping.compare_and_swap(pid, head, StdPtr::null_mut()) {
            // SAFETY: Unlinked by the CAS above; the node owns no other chain.
            unsafe { guard.retire(head.cast(), reclaim_chain::<K, V>) };
            debug_log!(pid, "abandoned unreachable page");
        }
    }

    /// Hand a chain that a successful CAS just unlinked to the epoch manager.
    fn retire_chain(&self, head: &Node<K, V>, guard: &Guard<'_>) {
        let ptr: *mut u8 = StdPtr::from_ref(head).cast_mut().cast();
        // SAFETY: The caller unlinked `head` from the mapping table, and no
        // other chain shares its nodes.
        unsafe { guard.retire(ptr, reclaim_chain::<K, V>) };
    }
}

impl<K, V, C> BwTree<K, V, C> {
    /// Free every page chain. Requires that no participant is alive.
    fn free_pages(&mut self) {
        for (_pid, head) in self.mapping.drain() {
            // SAFETY: Exclusive access; each head owns its whole chain.
            unsafe { reclaim_chain::<K, V>(head.cast()) };
        }
    }
}

impl<K, V, C> Drop for BwTree<K, V, C> {
    fn drop(&mut self) {
        self.free_pages();
    }
}

/// Publish the first (empty) leaf of a fresh or cleared index.
fn allocate_root_leaf<K, V>(mapping: &MappingTable<Node<K, V>>) -> Pid {
    let ptr: *mut Node<K, V> = Box::into_raw(Node::leaf(LeafNode::empty()));
    match mapping.allocate(ptr) {
        Ok(pid) => pid,

        Err(_) => {
            // SAFETY: Never published.
            drop(unsafe { Box::from_raw(ptr) });
            structural_anomaly("no PID left for the root leaf")
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
