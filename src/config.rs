//! Construction-time configuration for a [`BwTree`](crate::BwTree).

use std::mem::size_of;

use crate::mapping::Pid;

/// Per-page byte budget used when none is configured.
pub const DEFAULT_PAGE_BYTES: usize = 256;

/// Delta-chain length above which a page is consolidated.
pub const DEFAULT_CONSOLIDATE_THRESHOLD: usize = 8;

/// Retirement-list length at which a scope exit tries to reclaim.
pub const DEFAULT_GC_FLUSH_THRESHOLD: usize = 64;

/// Upper bound on CAS retries for a single operation.
pub const DEFAULT_MAX_RETRIES: usize = 1_000_000;

/// Smallest slot capacity a page may have. A split needs at least two
/// entries on each side to make progress.
const MIN_SLOTS: usize = 4;

/// Configuration for a [`BwTree`](crate::BwTree).
///
/// # Example
///
/// ```rust
/// use bwtree::IndexConfig;
///
/// let config = IndexConfig::default()
///     .with_duplicates(true)
///     .with_page_bytes(4096);
/// assert!(config.allow_duplicates);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexConfig {
    /// Multiset semantics when `true`, unique keys when `false`.
    pub allow_duplicates: bool,

    /// Byte budget of one page. Drives the leaf and inner slot limits.
    pub page_bytes: usize,

    /// Delta-chain length that triggers consolidation of a page.
    pub consolidate_threshold: usize,

    /// Retirement-list length at which an epoch exit attempts reclamation.
    /// Zero attempts reclamation on every exit.
    pub gc_flush_threshold: usize,

    /// Maximum CAS attempts before an insert or erase gives up.
    pub max_retries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            page_bytes: DEFAULT_PAGE_BYTES,
            consolidate_threshold: DEFAULT_CONSOLIDATE_THRESHOLD,
            gc_flush_threshold: DEFAULT_GC_FLUSH_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl IndexConfig {
    /// Set map (`false`) or multiset (`true`) semantics.
    #[must_use]
    pub const fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Set the per-page byte budget.
    #[must_use]
    pub const fn with_page_bytes(mut self, bytes: usize) -> Self {
        self.page_bytes = bytes;
        self
    }

    /// Set the delta-chain length that triggers consolidation.
    #[must_use]
    pub const fn with_consolidate_threshold(mut self, len: usize) -> Self {
        self.consolidate_threshold = len;
        self
    }

    /// Set the retirement-list flush threshold.
    #[must_use]
    pub const fn with_gc_flush_threshold(mut self, len: usize) -> Self {
        self.gc_flush_threshold = len;
        self
    }

    /// Set the CAS retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, attempts: usize) -> Self {
        self.max_retries = attempts;
        self
    }

    /// Derive the slot limits for key type `K` and value type `V`.
    #[must_use]
    pub const fn slot_limits<K, V>(&self) -> SlotLimits {
        SlotLimits::for_types::<K, V>(self.page_bytes)
    }

    /// Consolidation threshold with the zero case folded to one.
    #[inline]
    pub(crate) const fn chain_limit(&self) -> usize {
        if self.consolidate_threshold == 0 {
            1
        } else {
            self.consolidate_threshold
        }
    }

    /// Retry bound with the zero case folded to one.
    #[inline]
    pub(crate) const fn retry_limit(&self) -> usize {
        if self.max_retries == 0 { 1 } else { self.max_retries }
    }
}

/// Slot capacities derived from a page byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLimits {
    /// `SLOT_LEAF_MAX`: entries a leaf holds before it splits.
    pub leaf_max: usize,
    /// `SLOT_LEAF_MIN`: underflow mark for leaves (reported only; pages are never merged).
    pub leaf_min: usize,
    /// `SLOT_INNER_MAX`: separators an inner page holds before it splits.
    pub inner_max: usize,
    /// `SLOT_INNER_MIN`: underflow mark for inner pages.
    pub inner_min: usize,
}

impl SlotLimits {
    /// Compute limits for `page_bytes` with key `K` and value `V`.
    #[must_use]
    pub const fn for_types<K, V>(page_bytes: usize) -> Self {
        let leaf_slot: usize = nonzero(size_of::<K>() + size_of::<V>());
        let inner_slot: usize = nonzero(size_of::<K>() + size_of::<Pid>());

        let leaf_max: usize = clamp_slots(page_bytes / leaf_slot);
        let inner_max: usize = clamp_slots(page_bytes / inner_slot);

        Self {
            leaf_max,
            leaf_min: leaf_max / 2,
            inner_max,
            inner_min: inner_max / 2,
        }
    }
}

const fn nonzero(n: usize) -> usize {
    if n == 0 { 1 } else { n }
}

const fn clamp_slots(n: usize) -> usize {
    if n < MIN_SLOTS { MIN_SLOTS } else { n }
}
