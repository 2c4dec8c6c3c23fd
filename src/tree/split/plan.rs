//! Split-point selection.
//!
//! Both functions take the page's materialized content and return the
//! separator, the sibling page and the entry counts, or `None` when the page
//! cannot be split.

use crate::comparator::{KeyComparator, lower_bound, upper_bound};
use crate::mapping::Pid;
use crate::node::{InnerNode, LeafNode, Node};

/// What the child step installs.
pub(super) struct SplitPlan<K, V> {
    /// Largest key kept on the left: the left page covers `(low, separator]`.
    pub(super) separator: K,

    /// A key of the right half, used to find the page's slot in its parent.
    pub(super) probe: K,

    /// Base node of the new sibling.
    pub(super) right: Box<Node<K, V>>,

    /// Entries (leaf) or separators (inner) left on the split page.
    pub(super) left_count: usize,

    /// Entries (leaf) or separators (inner) no longer on the split page.
    pub(super) removed: usize,
}

/// Split a leaf roughly in half without cutting a run of equal keys.
///
/// The left half keeps every copy of the separator. When the run around the
/// midpoint reaches the end, the run moves right instead; a page holding a
/// single key cannot be split.
pub(super) fn leaf_split<K, V, C>(pid: Pid, content: &LeafNode<K, V>, cmp: &C) -> Option<SplitPlan<K, V>>
where
    K: Clone,
    V: Clone,
    C: KeyComparator<K> + ?Sized,
{
    let n: usize = content.len();
    if n < 2 {
        return None;
    }

    let mid: usize = n / 2;
    let mut cut: usize = upper_bound(cmp, &content.keys, &content.keys[mid - 1]);
    if cut == n {
        cut = lower_bound(cmp, &content.keys, &content.keys[mid]);
        if cut == 0 {
            return None;
        }
    }

    let right: LeafNode<K, V> = LeafNode {
        keys: content.keys[cut..].to_vec(),
        values: content.values[cut..].to_vec(),
        prev_leaf: pid,
        next_leaf: content.next_leaf,
        high_key: content.high_key.clone(),
    };

    Some(SplitPlan {
        separator: content.keys[cut - 1].clone(),
        probe: content.keys[cut].clone(),
        right: Node::leaf(right),
        left_count: cut,
        removed: n - cut,
    })
}

/// Split an inner page around its middle separator, which moves up.
pub(super) fn inner_split<K, V>(mut content: InnerNode<K>) -> Option<SplitPlan<K, V>>
where
    K: Clone,
{
    let n: usize = content.keys.len();
    if n < 3 {
        return None;
    }

    let mid: usize = n / 2;
    let right_keys: Vec<K> = content.keys.split_off(mid + 1);
    let right_children: Vec<Pid> = content.children.split_off(mid + 1);
    let separator: K = content.keys.pop()?;
    let probe: K = right_keys.first()?.clone();

    let right: InnerNode<K> = InnerNode {
        keys: right_keys,
        children: right_children,
        high_key: content.high_key,
        side_link: content.side_link,
    };

    Some(SplitPlan {
        separator,
        probe,
        right: Node::inner(right),
        left_count: mid,
        removed: n - mid,
    })
}
