//! Standard memory orderings for mapping-table and epoch access.
//!
//! These constants keep ordering usage consistent across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loading a page head from the mapping table.
/// Pairs with the `Release` half of the installing CAS.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for a successful mapping-table or root CAS.
/// Publishes the fully built node to later `READ_ORD` loads.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for a failed CAS.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for counters and statistics that carry no data dependency.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for epoch publication and the global epoch clock.
///
/// Entering a scope must be ordered before every mapping-table load the
/// scope performs, and a collector's scan of local epochs must be ordered
/// after the unlinking CAS of what it frees. Both need a single total order.
pub const EPOCH_ORD: Ordering = Ordering::SeqCst;
