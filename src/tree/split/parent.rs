//! Parent step of a split: index terms and root growth.

use crate::comparator::KeyComparator;
use crate::epoch::Guard;
use crate::mapping::{MAX_PID, Pid};
use crate::node::{DeltaUpdate, InnerNode, InnerRoute, Node, NodeKind};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS};
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

use crate::tree::BwTree;

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Route `(separator, high]` of `parent` to `side` instead of `child`.
    ///
    /// `high` is the parent's bound for the range `probe` routes to, capped by
    /// `page_high`, the bound `child` had before it split. Returns the new
    /// parent head, or `None` when there is
    /// nothing to do: the term is already present, or the parent no longer
    /// routes `probe` to `child` (it split, or a newer split of `child` was
    /// installed first). In the last case a later descent fixes the parent.
    #[expect(clippy::too_many_arguments, reason = "State passed explicitly")]
    #[cfg_attr(not(feature = "tracing"), expect(unused_variables, reason = "attempt is only logged"))]
    pub(super) fn install_index_term<'g>(
        &'g self,
        parent: Pid,
        child: Pid,
        separator: &K,
        side: Pid,
        probe: &K,
        page_high: Option<&K>,
        guard: &'g Guard<'_>,
    ) -> Option<&'g Node<K, V>> {
        for attempt in 1..=self.config.retry_limit() {
            let head: &'g Node<K, V> = self.load(parent, guard);

            let high: Option<&K> = match head.route_inner(probe, &self.comparator) {
                InnerRoute::Child { pid, high } if pid == child => match (high, page_high) {
                    (Some(high), Some(page)) if self.comparator.less(page, high) => Some(page),
                    (None, page) => page,
                    (high, _) => high,
                },

                InnerRoute::Child { pid, .. } if pid == side => {
                    trace_log!(parent, side, "index term already installed");
                    return None;
                }

                InnerRoute::Child { .. } | InnerRoute::Sibling(_) => {
                    debug_log!(parent, child, "parent no longer routes to split page");
                    return None;
                }
            };

            let update: Box<Node<K, V>> = Node::delta(
                NodeKind::Update(DeltaUpdate {
                    key_left: separator.clone(),
                    key_right: high.cloned(),
                    child: side,
                    old_child: child,
                }),
                head,
                head.count() + 1,
            );

            match self.install(parent, head, update, guard) {
                Ok(new_head) => {
                    debug_log!(parent, child, side, "split parent step installed");
                    return Some(new_head);
                }

                Err(_) => {
                    trace_log!(parent, attempt, "index term CAS lost");
                }
            }
        }

        warn_log!(parent, child, "gave up installing index term");
        None
    }

    /// Replace root `old_root`, which split at `separator` into `side`, by a
    /// new inner root over both halves.
    ///
    /// No-op if the root already moved on.
    pub(super) fn grow_root(&self, old_root: Pid, separator: &K, side: Pid, guard: &Guard<'_>) {
        if self.root_pid() != old_root {
            return;
        }

        let root: Box<Node<K, V>> = Node::inner(InnerNode {
            keys: vec![separator.clone()],
            children: vec![old_root, side],
            high_key: None,
            side_link: MAX_PID,
        });
        let Some(new_root) = self.allocate_page(root) else {
            return;
        };

        match self
            .root
            .compare_exchange(old_root, new_root, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => {
                debug_log!(old_root, new_root, "grew root");
            }

            Err(_) => {
                trace_log!(old_root, "root growth lost the race");
                self.abandon_page(new_root, guard);
            }
        }
    }
}
