//! Epoch-based reclamation for retired page nodes.
//!
//! A node unlinked from the mapping table may still be referenced by an
//! operation that loaded it earlier. Such nodes are *retired* instead of
//! freed: they go on the retiring participant's list, tagged with the global
//! epoch observed at retirement, and are freed only once every active
//! participant entered its scope after that epoch.
//!
//! # Participants
//!
//! Each worker thread registers once with [`EpochManager::register`] and
//! gets a [`Participant`]. The participant is the context object that owns
//! the worker's retirement list, so retirement bookkeeping never contends
//! across threads. A participant is `!Sync`; it may move between threads
//! while no [`Guard`] is alive.
//!
//! # Protocol
//!
//! - `enter` (first [`Participant::pin`]): publish the current global epoch
//!   as the participant's local epoch.
//! - `retire` ([`Guard::retire`]): append `(node, global epoch)` to the list.
//! - `exit` (dropping the outermost [`Guard`]): publish quiescence, advance
//!   the global epoch, and, once the list reaches the flush threshold, free
//!   every entry whose epoch is strictly older than the minimum local epoch
//!   of all active participants.
//!
//! ```rust
//! use bwtree::epoch::EpochManager;
//!
//! let manager = EpochManager::new(0);
//! let worker = manager.register();
//! {
//!     let guard = worker.pin();
//!     assert!(guard.epoch() <= manager.global_epoch());
//! } // exit: epoch advances
//! assert!(manager.global_epoch() >= 1);
//! ```

use std::cell::{Cell, RefCell};
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, fence};

use parking_lot::Mutex;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, EPOCH_ORD, READ_ORD, RELAXED};
use crate::tracing_helpers::trace_log;

/// Local epoch value of a participant outside any scope.
const QUIESCENT: u64 = u64::MAX;

/// Reclamation callback: frees whatever `ptr` owns.
pub type Reclaim = unsafe fn(*mut u8);

// ============================================================================
//  Retired
// ============================================================================

/// A node waiting for reclamation.
struct Retired {
    ptr: *mut u8,
    reclaim: Reclaim,
    epoch: u64,
}

// SAFETY: A retired pointer is exclusively owned by the retirement list;
// `Guard::retire` requires the pointee to be `Send`-safe to free elsewhere.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    ///
    /// Must be called once, after no participant can reach `ptr`.
    unsafe fn reclaim(self) {
        // SAFETY: Forwarded from caller.
        unsafe { (self.reclaim)(self.ptr) };
    }
}

// ============================================================================
//  Registry
// ============================================================================

/// One slot of the participant registry.
///
/// Records are pushed onto a lock-free list and never unlinked until the
/// manager drops; a dropped participant releases its record for reuse.
struct LocalRecord {
    epoch: AtomicU64,
    in_use: AtomicBool,
    next: *mut LocalRecord,
}

// SAFETY: `next` is written once before the record is published and is
// read-only afterwards; the other fields are atomics.
unsafe impl Send for LocalRecord {}
// SAFETY: See above.
unsafe impl Sync for LocalRecord {}

// ============================================================================
//  EpochManager
// ============================================================================

/// Global epoch clock plus the registry of participants.
pub struct EpochManager {
    global: AtomicU64,
    registry: AtomicPtr<LocalRecord>,

    /// Lists of participants that dropped before their nodes became free.
    orphans: Mutex<Vec<Retired>>,

    flush_threshold: usize,

    retired: AtomicU64,
    reclaimed: AtomicU64,
}

// SAFETY: Registry records are only mutated through atomics; orphans are
// behind a mutex.
unsafe impl Send for EpochManager {}
// SAFETY: See above.
unsafe impl Sync for EpochManager {}

impl StdFmt::Debug for EpochManager {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("EpochManager")
            .field("global", &self.global_epoch())
            .field("retired", &self.retired_count())
            .field("reclaimed", &self.reclaimed_count())
            .finish_non_exhaustive()
    }
}

impl EpochManager {
    /// Create a manager whose participants try to reclaim once their
    /// retirement list holds `flush_threshold` entries.
    #[must_use]
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            global: AtomicU64::new(0),
            registry: AtomicPtr::new(StdPtr::null_mut()),
            orphans: Mutex::new(Vec::new()),
            flush_threshold,
            retired: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn global_epoch(&self) -> u64 {
        self.global.load(EPOCH_ORD)
    }

    /// Total nodes handed to [`Guard::retire`].
    #[must_use]
    pub fn retired_count(&self) -> u64 {
        self.retired.load(RELAXED)
    }

    /// Total retired nodes actually freed.
    #[must_use]
    pub fn reclaimed_count(&self) -> u64 {
        self.reclaimed.load(RELAXED)
    }

    /// Nodes retired but not yet freed.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.retired_count().saturating_sub(self.reclaimed_count())
    }

    /// Register a new participant.
    pub fn register(&self) -> Participant<'_> {
        Participant {
            manager: self,
            record: self.acquire_record(),
            depth: Cell::new(0),
            retired: RefCell::new(Vec::new()),
        }
    }

    /// Advance the epoch and free every orphaned node that has become safe.
    pub fn flush(&self) {
        self.global.fetch_add(1, EPOCH_ORD);
        let min: u64 = self.min_active_epoch();
        let mut orphans = self.orphans.lock();
        self.reclaim_older_than(&mut orphans, min);
    }

    fn acquire_record(&self) -> &LocalRecord {
        let mut cursor: *mut LocalRecord = self.registry.load(READ_ORD);
        while !cursor.is_null() {
            // SAFETY: Records live until the manager drops.
            let record: &LocalRecord = unsafe { &*cursor };
            if record
                .in_use
                .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return record;
            }
            cursor = record.next;
        }

        let fresh: *mut LocalRecord = Box::into_raw(Box::new(LocalRecord {
            epoch: AtomicU64::new(QUIESCENT),
            in_use: AtomicBool::new(true),
            next: StdPtr::null_mut(),
        }));

        let mut head: *mut LocalRecord = self.registry.load(READ_ORD);
        loop {
            // SAFETY: `fresh` is unpublished; we are its only writer.
            unsafe { (*fresh).next = head };
            match self
                .registry
                .compare_exchange_weak(head, fresh, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        // SAFETY: Published and never freed before the manager.
        unsafe { &*fresh }
    }

    /// Smallest local epoch among participants currently inside a scope.
    fn min_active_epoch(&self) -> u64 {
        fence(EPOCH_ORD);
        let mut min: u64 = QUIESCENT;
        let mut cursor: *mut LocalRecord = self.registry.load(READ_ORD);
        while !cursor.is_null() {
            // SAFETY: Records live until the manager drops.
            let record: &LocalRecord = unsafe { &*cursor };
            min = min.min(record.epoch.load(EPOCH_ORD));
            cursor = record.next;
        }
        min
    }

    fn reclaim_older_than(&self, list: &mut Vec<Retired>, min: u64) {
        let before: usize = list.len();
        let mut kept: Vec<Retired> = Vec::with_capacity(before);

        for retired in list.drain(..) {
            if retired.epoch < min {
                // SAFETY: Every active participant entered after `retired.epoch`,
                // so none of them loaded the node before it was unlinked.
                unsafe { retired.reclaim() };
            } else {
                kept.push(retired);
            }
        }

        let freed: usize = before - kept.len();
        *list = kept;
        if freed > 0 {
            self.reclaimed.fetch_add(freed as u64, RELAXED);
            trace_log!(freed, pending = list.len(), min_epoch = min, "reclaimed retired nodes");
        }
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // No participant can outlive the manager, so every orphan is unreachable.
        for retired in self.orphans.get_mut().drain(..) {
            // SAFETY: Exclusive access; nothing can observe the node.
            unsafe { retired.reclaim() };
        }

        let mut cursor: *mut LocalRecord = *self.registry.get_mut();
        while !cursor.is_null() {
            // SAFETY: Records were created by `Box::into_raw` in `acquire_record`.
            let record: Box<LocalRecord> = unsafe { Box::from_raw(cursor) };
            cursor = record.next;
        }
    }
}

// ============================================================================
//  Participant
// ============================================================================

/// A worker's handle on the epoch manager, carrying its retirement list.
pub struct Participant<'m> {
    manager: &'m EpochManager,
    record: &'m LocalRecord,
    depth: Cell<usize>,
    retired: RefCell<Vec<Retired>>,
}

impl StdFmt::Debug for Participant<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Participant")
            .field("active", &self.is_active())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<'m> Participant<'m> {
    /// Enter an epoch scope. Scopes nest; only the outermost guard exits.
    #[must_use]
    pub fn pin(&self) -> Guard<'_> {
        let depth: usize = self.depth.get();
        if depth == 0 {
            self.enter();
        }
        self.depth.set(depth + 1);
        Guard { participant: self }
    }

    /// Whether a guard of this participant is alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    /// Nodes this participant retired that are not yet freed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.retired.borrow().len()
    }

    /// The manager this participant is registered with.
    #[must_use]
    pub const fn manager(&self) -> &'m EpochManager {
        self.manager
    }

    /// Advance the epoch and try to free this participant's list now,
    /// regardless of the flush threshold. No-op inside a scope.
    pub fn flush(&self) {
        if self.is_active() {
            return;
        }
        self.manager.global.fetch_add(1, EPOCH_ORD);
        self.collect();
    }

    fn enter(&self) {
        let epoch: u64 = self.manager.global.load(EPOCH_ORD);
        self.record.epoch.store(epoch, EPOCH_ORD);
        fence(EPOCH_ORD);
    }

    fn exit(&self) {
        self.record.epoch.store(QUIESCENT, EPOCH_ORD);
        self.manager.global.fetch_add(1, EPOCH_ORD);

        if self.retired.borrow().len() >= self.manager.flush_threshold {
            self.collect();
        }
    }

    fn collect(&self) {
        let min: u64 = self.manager.min_active_epoch();
        {
            let mut list = self.retired.borrow_mut();
            self.manager.reclaim_older_than(&mut list, min);
        }

        if let Some(mut orphans) = self.manager.orphans.try_lock() {
            if !orphans.is_empty() {
                self.manager.reclaim_older_than(&mut orphans, min);
            }
        }
    }
}

impl Drop for Participant<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(self.depth.get(), 0, "participant dropped inside a scope");

        self.collect();
        let leftover: Vec<Retired> = std::mem::take(self.retired.get_mut());
        if !leftover.is_empty() {
            self.manager.orphans.lock().extend(leftover);
        }

        self.record.epoch.store(QUIESCENT, EPOCH_ORD);
        self.record.in_use.store(false, EPOCH_ORD);
    }
}

// ============================================================================
//  Guard
// ============================================================================

/// Scoped epoch membership. Dropping the outermost guard exits the epoch,
/// on every path including unwinding.
///
/// References loaded from the tree are bounded by the guard's lifetime.
pub struct Guard<'p> {
    participant: &'p Participant<'p>,
}

impl StdFmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Guard")
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Guard<'_> {
    /// Local epoch published when the outermost scope was entered.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.participant.record.epoch.load(RELAXED)
    }

    /// Hand `ptr` to the epoch manager; `reclaim(ptr)` runs once no
    /// participant can still observe it.
    ///
    /// # Safety
    ///
    /// - `ptr` must already be unreachable for operations that start later
    ///   (unlinked by a successful CAS).
    /// - `reclaim` must be sound to call exactly once on `ptr`, from any thread.
    pub unsafe fn retire(&self, ptr: *mut u8, reclaim: Reclaim) {
        fence(EPOCH_ORD);
        let epoch: u64 = self.participant.manager.global.load(EPOCH_ORD);
        self.participant.retired.borrow_mut().push(Retired {
            ptr,
            reclaim,
            epoch,
        });
        self.participant.manager.retired.fetch_add(1, RELAXED);
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let depth: usize = self.participant.depth.get() - 1;
        self.participant.depth.set(depth);
        if depth == 0 {
            self.participant.exit();
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
