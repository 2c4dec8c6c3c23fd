//! # `bwtree`
//!
//! A latch-free, in-memory ordered index in the Bw-Tree style.
//!
//! Pages are never modified in place. Every change is a small immutable
//! *delta record* prepended to the page's chain with one compare-and-swap on
//! a *mapping table* slot, which maps a logical page id ([`Pid`]) to the
//! current chain head. Long chains are periodically consolidated into a
//! fresh base node, full pages split in two CAS steps that any thread may
//! finish, and unlinked nodes are reclaimed by an epoch scheme.
//!
//! | Feature | Status |
//! |---------|--------|
//! | Point lookups | lock-free, never block writers |
//! | Insert / erase | prepend-CAS with bounded retry |
//! | Duplicate keys | per-index flag, off by default |
//! | Splits | two-step, help-along, root growth |
//! | Page merges | not implemented, pages may run sparse |
//! | Forward and reverse scans | leaf-at-a-time copies, no snapshot |
//! | Reclamation | epoch-based, per-participant lists |
//!
//! ## Thread Safety
//!
//! `BwTree<K, V>` is `Send + Sync` for `Send + Sync` keys and values. Each
//! worker thread should register a [`Participant`] once and use the `*_with`
//! methods. The short forms register a transient participant per call.
//!
//! ```rust
//! use bwtree::BwTree;
//!
//! let tree: BwTree<u64, &str> = BwTree::new();
//! let worker = tree.participant();
//!
//! tree.insert_with(1, "one", &worker).unwrap();
//! tree.insert_with(2, "two", &worker).unwrap();
//! assert_eq!(tree.get_with(&1, &worker), Some("one"));
//!
//! let keys: Vec<u64> = tree.iter_with(&worker).map(|(k, _)| k).collect();
//! assert_eq!(keys, vec![1, 2]);
//! ```
//!
//! ## Key Order
//!
//! Keys are ordered by a [`KeyComparator`] fixed at construction.
//! [`BwTree::new`] uses [`OrdComparator`]; any `Fn(&K, &K) -> Ordering`
//! closure works through [`BwTree::with_comparator`].

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod comparator;
pub mod config;
pub mod epoch;
pub mod mapping;
mod node;
pub mod ordering;
pub mod tree;

mod tracing_helpers;

// Re-export main types for convenience
pub use comparator::{KeyComparator, OrdComparator};
pub use config::{IndexConfig, SlotLimits};
pub use epoch::{EpochManager, Guard, Participant};
pub use mapping::{MAX_PID, Pid};
pub use tree::{BwTree, IndexError, InvariantViolation, Iter, RevIter, TreeStats};
