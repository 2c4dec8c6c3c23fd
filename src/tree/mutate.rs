//! Insert and erase: prepend one record delta with a CAS.
//!
//! A mutation descends, checks the key against the observed head, links its
//! delta on top of that head and CASes the page slot. Losing the CAS means
//! the page changed underneath; the delta is relinked after a fresh descent.
//! A successful CAS may leave the page over its slot limit or with a long
//! chain, in which case the mutator splits or consolidates it on the way
//! out. Both are advisory and never fail the mutation.

use crate::comparator::KeyComparator;
use crate::epoch::Guard;
use crate::mapping::Pid;
use crate::node::{DeltaDelete, DeltaInsert, Node, NodeKind};
use crate::ordering::RELAXED;
use crate::tracing_helpers::trace_log;

use super::traverse::LeafTarget;
use super::{BwTree, IndexError};

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Install `DeltaInsert{key, value}` on the leaf owning `key`.
    #[cfg_attr(not(feature = "tracing"), expect(unused_variables, reason = "attempt is only logged"))]
    pub(super) fn insert_record(&self, key: K, value: V, guard: &Guard<'_>) -> Result<(), IndexError> {
        let attempts: usize = self.config.retry_limit();
        let mut record: Box<Node<K, V>> = Node::detached(NodeKind::Insert(DeltaInsert { key, value }));

        for attempt in 1..=attempts {
            let target: LeafTarget<'_, K, V> = self.find_leaf(record.record_key(), guard);

            if !self.config.allow_duplicates && !target.values.is_empty() {
                return Err(IndexError::DuplicateKey);
            }

            record.rebase(target.head, target.head.count() + 1);
            match self.install(target.pid, target.head, record, guard) {
                Ok(head) => {
                    self.count.fetch_add(1, RELAXED);
                    self.maintain(target.pid, head, &target.path, guard);
                    return Ok(());
                }

                Err(lost) => {
                    trace_log!(pid = target.pid, attempt, "insert CAS lost");
                    record = lost;
                }
            }
        }

        Err(IndexError::RetryLimitExceeded { attempts })
    }

    /// Install `DeltaDelete` for `key`, or for `(key, value)` when `value` is
    /// set. Returns the number of entries removed; installs nothing when
    /// there is nothing to remove.
    #[cfg_attr(not(feature = "tracing"), expect(unused_variables, reason = "attempt is only logged"))]
    pub(super) fn erase_records(
        &self,
        key: &K,
        value: Option<&V>,
        guard: &Guard<'_>,
    ) -> Result<usize, IndexError> {
        let attempts: usize = self.config.retry_limit();

        for attempt in 1..=attempts {
            let target: LeafTarget<'_, K, V> = self.find_leaf(key, guard);

            let removed: usize = match value {
                None => target.values.len(),
                Some(wanted) => target
                    .values
                    .iter()
                    .filter(|found: &&&V| ***found == *wanted)
                    .count(),
            };
            if removed == 0 {
                return Ok(0);
            }

            debug_assert!(target.head.count() >= removed);
            let record: Box<Node<K, V>> = Node::delta(
                NodeKind::Delete(DeltaDelete {
                    key: key.clone(),
                    value: value.cloned(),
                }),
                target.head,
                target.head.count() - removed,
            );

            match self.install(target.pid, target.head, record, guard) {
                Ok(head) => {
                    self.count.fetch_sub(removed, RELAXED);
                    self.maintain(target.pid, head, &target.path, guard);
                    return Ok(removed);
                }

                Err(_) => {
                    trace_log!(pid = target.pid, attempt, "erase CAS lost");
                }
            }
        }

        Err(IndexError::RetryLimitExceeded { attempts })
    }

    /// Split `pid` if `head` is over its slot limit, else consolidate it if
    /// its chain is too long.
    pub(super) fn maintain(&self, pid: Pid, head: &Node<K, V>, path: &[Pid], guard: &Guard<'_>) {
        let max: usize = if head.is_leaf() {
            self.limits.leaf_max
        } else {
            self.limits.inner_max
        };

        if head.count() > max && self.try_split(pid, head, path, guard) {
            return;
        }

        if head.chain_len() > self.config.chain_limit() {
            self.try_consolidate(pid, head, guard);
        }
    }
}
