//! The mapping table: logical page id to current page head.
//!
//! Every page of the tree is named by a [`Pid`]. Node memory never refers to
//! another node by address across pages; it stores PIDs, and the mapping
//! table is the single atomically swappable point of truth for "what is page
//! P right now". A slot's content changes only through
//! [`MappingTable::compare_and_swap`].
//!
//! # Layout
//!
//! The table is a two-level directory of fixed-size segments. Segments are
//! allocated lazily and installed with a CAS, so the table grows without a
//! lock and without ever moving a slot (a slot address stays valid for the
//! lifetime of the table).
//!
//! ```text
//!   directory[pid >> SEGMENT_BITS] -> segment
//!   segment[pid & SEGMENT_MASK]    -> page head
//! ```
//!
//! PIDs come from a monotonically increasing counter and are never reused,
//! so a stale PID can never alias a different logical page.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};
use crate::tracing_helpers::{trace_log, warn_log};

/// Logical page identifier.
pub type Pid = u64;

/// Sentinel PID meaning "no page" (end of a sibling chain, absent parent).
pub const MAX_PID: Pid = u64::MAX;

/// log2 of slots per segment.
const SEGMENT_BITS: u32 = 12;

/// Slots per segment.
const SEGMENT_SIZE: usize = 1 << SEGMENT_BITS;

const SEGMENT_MASK: u64 = (SEGMENT_SIZE as u64) - 1;

/// Number of directory entries.
const DIRECTORY_SIZE: usize = 1 << 12;

/// Total number of pages a table can name.
pub const MAPPING_CAPACITY: u64 = (SEGMENT_SIZE as u64) * (DIRECTORY_SIZE as u64);

/// Returned when every PID has been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingTableFull;

impl StdFmt::Display for MappingTableFull {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "mapping table exhausted ({MAPPING_CAPACITY} pages)")
    }
}

impl std::error::Error for MappingTableFull {}

type Segment<T> = [AtomicPtr<T>];

/// Lock-free, growable PID -> `*mut T` table.
///
/// The table does not own the `T`s it points to. The owner drains the table
/// with [`MappingTable::drain`] before dropping it.
pub struct MappingTable<T> {
    directory: Box<[AtomicPtr<AtomicPtr<T>>]>,
    next_pid: AtomicU64,
}

// SAFETY: The table only stores pointers; synchronisation of the pointees
// is the responsibility of the owner (the tree, via CAS publication).
unsafe impl<T: Send> Send for MappingTable<T> {}
// SAFETY: All shared access goes through atomics.
unsafe impl<T: Send> Sync for MappingTable<T> {}

impl<T> StdFmt::Debug for MappingTable<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("MappingTable")
            .field("allocated", &self.allocated())
            .finish_non_exhaustive()
    }
}

impl<T> Default for MappingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MappingTable<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        let directory: Box<[AtomicPtr<AtomicPtr<T>>]> = (0..DIRECTORY_SIZE)
            .map(|_| AtomicPtr::new(StdPtr::null_mut()))
            .collect();

        Self {
            directory,
            next_pid: AtomicU64::new(0),
        }
    }

    /// Number of PIDs handed out so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.next_pid.load(RELAXED).min(MAPPING_CAPACITY)
    }

    /// Hand out a fresh PID whose slot initially holds `node`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingTableFull`] when the PID space is exhausted. The
    /// caller keeps ownership of `node` in that case.
    pub fn allocate(&self, node: *mut T) -> Result<Pid, MappingTableFull> {
        let pid: Pid = self.next_pid.fetch_add(1, RELAXED);
        if pid >= MAPPING_CAPACITY {
            warn_log!(pid, "mapping table exhausted");
            return Err(MappingTableFull);
        }

        let slot: &AtomicPtr<T> = self.slot_or_grow(pid);
        let installed: bool = slot
            .compare_exchange(StdPtr::null_mut(), node, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        debug_assert!(installed, "fresh PID {pid} already had a page");

        trace_log!(pid, "allocated page");
        Ok(pid)
    }

    /// Current head of page `pid`, or null if `pid` names no page.
    #[inline]
    #[must_use]
    pub fn get(&self, pid: Pid) -> *mut T {
        self.slot(pid)
            .map_or(StdPtr::null_mut(), |slot: &AtomicPtr<T>| slot.load(READ_ORD))
    }

    /// Replace the head of page `pid` with `new` if it is still `expected`.
    ///
    /// This is the only way a page changes.
    #[inline]
    pub fn compare_and_swap(&self, pid: Pid, expected: *mut T, new: *mut T) -> bool {
        self.slot(pid).is_some_and(|slot: &AtomicPtr<T>| {
            slot.compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
        })
    }

    /// Remove every page head from the table.
    ///
    /// Returns the heads in PID order. Requires exclusive access, so no
    /// concurrent reader can observe the emptied slots. The PID counter is
    /// kept: drained PIDs are never handed out again.
    pub fn drain(&mut self) -> Vec<(Pid, *mut T)> {
        let allocated: u64 = self.allocated();
        let mut heads: Vec<(Pid, *mut T)> = Vec::new();

        for pid in 0..allocated {
            if let Some(slot) = self.slot(pid) {
                let head: *mut T = slot.swap(StdPtr::null_mut(), RELAXED);
                if !head.is_null() {
                    heads.push((pid, head));
                }
            }
        }

        heads
    }

    #[inline]
    fn slot(&self, pid: Pid) -> Option<&AtomicPtr<T>> {
        if pid >= MAPPING_CAPACITY {
            return None;
        }

        let segment: *mut AtomicPtr<T> = self.directory[dir_index(pid)].load(READ_ORD);
        if segment.is_null() {
            return None;
        }

        // SAFETY: A published segment holds SEGMENT_SIZE slots and is only
        // freed when the table drops, which needs exclusive access.
        Some(unsafe { &*segment.add(slot_index(pid)) })
    }

    fn slot_or_grow(&self, pid: Pid) -> &AtomicPtr<T> {
        let entry: &AtomicPtr<AtomicPtr<T>> = &self.directory[dir_index(pid)];
        let mut segment: *mut AtomicPtr<T> = entry.load(READ_ORD);

        if segment.is_null() {
            let fresh: *mut AtomicPtr<T> = new_segment::<T>();
            match entry.compare_exchange(StdPtr::null_mut(), fresh, CAS_SUCCESS, CAS_FAILURE) {
                Ok(_) => segment = fresh,
                Err(winner) => {
                    // SAFETY: `fresh` was never published.
                    unsafe { free_segment(fresh) };
                    segment = winner;
                }
            }
        }

        // SAFETY: `segment` is published and holds SEGMENT_SIZE slots.
        unsafe { &*segment.add(slot_index(pid)) }
    }
}

impl<T> Drop for MappingTable<T> {
    fn drop(&mut self) {
        for entry in &mut *self.directory {
            let segment: *mut AtomicPtr<T> = *entry.get_mut();
            if !segment.is_null() {
                // SAFETY: Exclusive access; each segment was created by `new_segment`.
                unsafe { free_segment(segment) };
            }
        }
    }
}

#[inline(always)]
#[expect(clippy::cast_possible_truncation, reason = "pid < MAPPING_CAPACITY")]
const fn dir_index(pid: Pid) -> usize {
    (pid >> SEGMENT_BITS) as usize
}

#[inline(always)]
#[expect(clippy::cast_possible_truncation, reason = "masked to SEGMENT_BITS")]
const fn slot_index(pid: Pid) -> usize {
    (pid & SEGMENT_MASK) as usize
}

fn new_segment<T>() -> *mut AtomicPtr<T> {
    let segment: Box<Segment<T>> = (0..SEGMENT_SIZE)
        .map(|_| AtomicPtr::new(StdPtr::null_mut()))
        .collect();
    Box::into_raw(segment).cast::<AtomicPtr<T>>()
}

/// # Safety
///
/// `segment` must come from [`new_segment`] and not be freed twice.
unsafe fn free_segment<T>(segment: *mut AtomicPtr<T>) {
    let slice: *mut Segment<T> = StdPtr::slice_from_raw_parts_mut(segment, SEGMENT_SIZE);
    // SAFETY: Caller guarantees provenance from `new_segment`.
    unsafe { drop(Box::from_raw(slice)) };
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn boxed(v: u32) -> *mut u32 {
        Box::into_raw(Box::new(v))
    }

    fn free_all(table: &mut MappingTable<u32>) {
        for (_, head) in table.drain() {
            // SAFETY: every head came from `boxed`.
            unsafe { drop(Box::from_raw(head)) };
        }
    }

    #[test]
    fn test_allocate_and_get() {
        let mut table: MappingTable<u32> = MappingTable::new();
        let a: Pid = table.allocate(boxed(1)).unwrap();
        let b: Pid = table.allocate(boxed(2)).unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        // SAFETY: pointers are live until `free_all`.
        unsafe {
            assert_eq!(*table.get(a), 1);
            assert_eq!(*table.get(b), 2);
        }
        assert!(table.get(99).is_null());
        assert!(table.get(MAX_PID).is_null());

        free_all(&mut table);
    }

    #[test]
    fn test_cas_requires_expected_head() {
        let mut table: MappingTable<u32> = MappingTable::new();
        let first: *mut u32 = boxed(1);
        let pid: Pid = table.allocate(first).unwrap();

        let second: *mut u32 = boxed(2);
        let stale: *mut u32 = boxed(3);
        assert!(!table.compare_and_swap(pid, stale, second));
        assert!(table.compare_and_swap(pid, first, second));
        assert_eq!(table.get(pid), second);

        // SAFETY: both unlinked pointers are exclusively ours.
        unsafe {
            drop(Box::from_raw(first));
            drop(Box::from_raw(stale));
        }
        free_all(&mut table);
    }

    #[test]
    fn test_growth_across_segments() {
        let mut table: MappingTable<u32> = MappingTable::new();
        let n: u32 = (SEGMENT_SIZE as u32) * 2 + 5;

        for i in 0..n {
            let pid: Pid = table.allocate(boxed(i)).unwrap();
            assert_eq!(pid, u64::from(i));
        }
        // SAFETY: live until `free_all`.
        unsafe { assert_eq!(*table.get(u64::from(n - 1)), n - 1) };
        assert_eq!(table.allocated(), u64::from(n));

        free_all(&mut table);
        assert!(table.get(0).is_null());

        let next: Pid = table.allocate(boxed(0)).unwrap();
        assert_eq!(next, u64::from(n), "drained PIDs are not reused");
        free_all(&mut table);
    }

    #[test]
    fn test_concurrent_allocation_unique_pids() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 3000;

        let table: Arc<MappingTable<u32>> = Arc::new(MappingTable::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| table.allocate(boxed((t * PER_THREAD + i) as u32)).unwrap())
                        .collect::<Vec<Pid>>()
                })
            })
            .collect();

        let mut pids: Vec<Pid> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), THREADS * PER_THREAD);

        let mut table = Arc::try_unwrap(table).unwrap();
        free_all(&mut table);
    }
}
