//! Two-step page split.
//!
//! 1. **Child step**: the upper half of an overfull page is published as a
//!    new page `Q`, then `DeltaSplit{sep, Q}` is CASed onto the page. From
//!    here on every reader redirects keys above `sep` to `Q`.
//! 2. **Parent step**: `DeltaUpdate{(sep, high] -> Q}` is CASed onto the
//!    parent so descents reach `Q` directly. When the split page is the
//!    root, a new root over both halves is installed instead.
//!
//! Step 2 may be run by any thread. A descent that meets a redirect runs it
//! for the page it passed through ([`BwTree::help_split`]); the step
//! re-routes a probe key through the parent's current head, which makes a
//! second run a no-op.
//!
//! # Module Organization
//!
//! - `plan`: choosing the split point and building the sibling page
//! - `parent`: index-term installation and root growth

mod parent;
mod plan;

use crate::comparator::KeyComparator;
use crate::epoch::Guard;
use crate::mapping::Pid;
use crate::node::{DeltaSplit, Node, NodeKind, structural_anomaly};
use crate::tracing_helpers::{debug_log, trace_log};

use super::BwTree;
use plan::SplitPlan;

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Split page `pid` whose head is `head`. `path` holds the inner pages
    /// that routed to it, root first.
    ///
    /// Returns `true` once the child step is installed. Returns `false` if
    /// the page has no valid split point, no PID is left, or another thread
    /// changed the page first.
    pub(super) fn try_split(&self, pid: Pid, head: &Node<K, V>, path: &[Pid], guard: &Guard<'_>) -> bool {
        let planned: Option<SplitPlan<K, V>> = if head.is_leaf() {
            plan::leaf_split(pid, &head.materialize_leaf(&self.comparator), &self.comparator)
        } else {
            plan::inner_split(head.materialize_inner(&self.comparator))
        };

        let Some(SplitPlan {
            separator,
            probe,
            right,
            left_count,
            removed,
        }) = planned
        else {
            debug_log!(pid, count = head.count(), "overfull page has no split point");
            return false;
        };

        let Some(side) = self.allocate_page(right) else {
            return false;
        };

        let split: Box<Node<K, V>> = Node::delta(
            NodeKind::Split(DeltaSplit {
                key: separator.clone(),
                side_link: side,
                removed,
            }),
            head,
            left_count,
        );

        if self.install(pid, head, split, guard).is_err() {
            trace_log!(pid, side, "split CAS lost");
            self.abandon_page(side, guard);
            return false;
        }
        debug_log!(pid, side, removed, "split child step installed");

        #[cfg(test)]
        {
            self.hooks.call_between_steps();
            if self.hooks.skip_parent_step() {
                return true;
            }
        }

        self.complete_split(pid, &separator, side, &probe, head.high_and_right().0, path, guard);
        true
    }

    /// Finish the split of `pid` that a descent for `probe` was redirected
    /// by.
    pub(super) fn help_split(&self, pid: Pid, head: &Node<K, V>, probe: &K, path: &[Pid], guard: &Guard<'_>) {
        let (Some(separator), side) = head.high_and_right() else {
            structural_anomaly("redirect from a page without an upper bound");
        };
        trace_log!(pid, side, "helping split");
        self.complete_split(pid, separator, side, probe, head.pre_split_high(), path, guard);
    }

    /// Parent step for the split of `pid` at `separator` into `side`.
    ///
    /// `probe` is any key in `(separator, high]`; it locates the slot of
    /// `pid` in the parent. `page_high` is the bound `pid` had before the
    /// split, if known.
    #[expect(clippy::too_many_arguments, reason = "State passed explicitly")]
    fn complete_split(
        &self,
        pid: Pid,
        separator: &K,
        side: Pid,
        probe: &K,
        page_high: Option<&K>,
        path: &[Pid],
        guard: &Guard<'_>,
    ) {
        match path.split_last() {
            None => self.grow_root(pid, separator, side, guard),

            Some((&parent, ancestors)) => {
                if let Some(head) = self.install_index_term(parent, pid, separator, side, probe, page_high, guard) {
                    self.maintain(parent, head, ancestors, guard);
                }
            }
        }
    }
}
