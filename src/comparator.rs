//! Key ordering and key equality supplied at construction.
//!
//! The index never assumes `K: Ord`. Every key comparison goes through a
//! [`KeyComparator`], so callers can index types whose order lives outside
//! the type (collations, descending columns, composite keys).

use std::cmp::Ordering;
use std::fmt as StdFmt;
use std::marker::PhantomData;

/// Total order over keys plus the key-equality checker.
///
/// `equal` defaults to `compare(..) == Equal`. Override it when equality is
/// cheaper to decide than order; it must agree with `compare`.
pub trait KeyComparator<K>: Send + Sync {
    /// Compare two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// Return whether two keys are equal.
    #[inline]
    fn equal(&self, a: &K, b: &K) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// `a < b`
    #[inline]
    fn less(&self, a: &K, b: &K) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    /// `a <= b`
    #[inline]
    fn less_eq(&self, a: &K, b: &K) -> bool {
        self.compare(a, b) != Ordering::Greater
    }
}

/// Comparator using the key type's own [`Ord`] implementation.
pub struct OrdComparator<K>(PhantomData<fn(&K)>);

impl<K> OrdComparator<K> {
    /// Create a comparator.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for OrdComparator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for OrdComparator<K> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<K> StdFmt::Debug for OrdComparator<K> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.write_str("OrdComparator")
    }
}

impl<K: Ord> KeyComparator<K> for OrdComparator<K> {
    #[inline(always)]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }

    #[inline(always)]
    fn equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Any `Fn(&K, &K) -> Ordering` closure is a comparator.
impl<K, F> KeyComparator<K> for F
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// Index of the first element in `keys` not less than `key`.
///
/// Inner-page routing uses this: child `i` covers `(keys[i-1], keys[i]]`.
pub(crate) fn lower_bound<K, C: KeyComparator<K> + ?Sized>(cmp: &C, keys: &[K], key: &K) -> usize {
    keys.partition_point(|probe: &K| cmp.less(probe, key))
}

/// Index of the first element in `keys` greater than `key`.
pub(crate) fn upper_bound<K, C: KeyComparator<K> + ?Sized>(cmp: &C, keys: &[K], key: &K) -> usize {
    keys.partition_point(|probe: &K| cmp.less_eq(probe, key))
}
