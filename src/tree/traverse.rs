//! Root-to-leaf descent.
//!
//! The descent reads each page's head once and resolves its chain in place:
//! an index-term delta covering the key short-circuits the inner chain, a
//! split whose separator is below the key sends the descent to the sibling.
//! Every redirect is a sign of a split whose parent step may be missing, so
//! the descent helps finish it before moving on.

use crate::comparator::KeyComparator;
use crate::epoch::Guard;
use crate::mapping::Pid;
use crate::node::{InnerRoute, LeafProbe, Node};

use super::BwTree;

/// Where a key lives, as observed by one descent.
pub(super) struct LeafTarget<'g, K, V> {
    /// Leaf page owning the key.
    pub(super) pid: Pid,

    /// Head observed for `pid`; a mutation CASes against exactly this node.
    pub(super) head: &'g Node<K, V>,

    /// Values stored for the key, in iteration order.
    pub(super) values: Vec<&'g V>,

    /// Inner pages whose routing led here, root first. The last entry is the
    /// parent used for this leaf's index terms.
    pub(super) path: Vec<Pid>,
}

impl<K, V, C> BwTree<K, V, C>
where
    K: Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    C: KeyComparator<K>,
{
    /// Descend from the root to the leaf page owning `key`.
    pub(super) fn find_leaf<'g>(&'g self, key: &K, guard: &'g Guard<'_>) -> LeafTarget<'g, K, V> {
        let mut path: Vec<Pid> = Vec::new();
        let mut pid: Pid = self.root_pid();

        loop {
            let head: &'g Node<K, V> = self.load(pid, guard);

            if head.is_leaf() {
                match head.probe_leaf(key, &self.comparator) {
                    LeafProbe::Values(values) => {
                        return LeafTarget {
                            pid,
                            head,
                            values,
                            path,
                        };
                    }

                    LeafProbe::Redirect(side) => {
                        self.help_split(pid, head, key, &path, guard);
                        pid = side;
                    }
                }
                continue;
            }

            match head.route_inner(key, &self.comparator) {
                InnerRoute::Child { pid: child, .. } => {
                    path.push(pid);
                    pid = child;
                }

                InnerRoute::Sibling(side) => {
                    self.help_split(pid, head, key, &path, guard);
                    pid = side;
                }
            }
        }
    }

    /// Number of levels, counted along the leftmost edge.
    pub(super) fn leftmost_height(&self, guard: &Guard<'_>) -> usize {
        let mut height: usize = 1;
        let mut pid: Pid = self.root_pid();

        loop {
            let head: &Node<K, V> = self.load(pid, guard);
            if head.is_leaf() {
                return height;
            }
            let inner = head.materialize_inner(&self.comparator);
            pid = inner.children[0];
            height += 1;
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use crate::config::IndexConfig;
    use crate::tree::BwTree;

    #[test]
    fn test_descent_reaches_every_key_after_splits() {
        let tree: BwTree<u64, u64> = BwTree::with_config(IndexConfig::default().with_page_bytes(64));
        for k in 0..500 {
            tree.insert(k, k * 2).unwrap();
        }

        let worker = tree.participant();
        let guard = worker.pin();
        for k in 0..500 {
            let target = tree.find_leaf(&k, &guard);
            assert_eq!(target.values, vec![&(k * 2)], "key {k}");
            assert!(!target.path.is_empty(), "root is no longer a leaf");
        }
        assert!(tree.leftmost_height(&guard) >= 3);
    }

    #[test]
    fn test_descent_path_starts_at_root() {
        let tree: BwTree<u64, u64> = BwTree::with_config(IndexConfig::default().with_page_bytes(64));
        for k in 0..64 {
            tree.insert(k, k).unwrap();
        }

        let worker = tree.participant();
        let guard = worker.pin();
        let target = tree.find_leaf(&63, &guard);
        assert_eq!(target.path.first(), Some(&tree.root_pid()));
        assert!(target.head.is_leaf());
    }
}
