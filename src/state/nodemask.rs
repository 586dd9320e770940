//! Node Sets
//!
//! Fixed-width bit set of node identities. Bit `id - 1` represents node `id`,
//! so a cluster holds at most [`MAX_NODES`] nodes.

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Maximum number of nodes a cluster can hold
pub const MAX_NODES: usize = 64;

/// Set of node identities
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeMask(u64);

impl NodeMask {
    /// The empty set
    pub const EMPTY: NodeMask = NodeMask(0);

    /// Check that a node id fits in a mask
    pub fn is_valid_id(id: NodeId) -> bool {
        id >= 1 && (id as usize) <= MAX_NODES
    }

    fn bit(id: NodeId) -> u64 {
        assert!(
            Self::is_valid_id(id),
            "Node ID must be 1-{}, got {}",
            MAX_NODES,
            id
        );
        1u64 << (id - 1)
    }

    /// Create from raw bits
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Get the raw bits
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Set containing nodes `1..=count`
    pub fn first_n(count: usize) -> Self {
        match count {
            0 => Self::EMPTY,
            n if n >= MAX_NODES => Self(u64::MAX),
            n => Self((1u64 << n) - 1),
        }
    }

    /// Set containing a single node
    pub fn single(id: NodeId) -> Self {
        Self(Self::bit(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        Self::is_valid_id(id) && self.0 & Self::bit(id) != 0
    }

    pub fn insert(&mut self, id: NodeId) {
        self.0 |= Self::bit(id);
    }

    /// Remove a node, returning whether it was present
    pub fn remove(&mut self, id: NodeId) -> bool {
        let present = self.contains(id);
        self.0 &= !Self::bit(id);
        present
    }

    pub fn union(self, other: NodeMask) -> NodeMask {
        NodeMask(self.0 | other.0)
    }

    pub fn intersection(self, other: NodeMask) -> NodeMask {
        NodeMask(self.0 & other.0)
    }

    /// Nodes in `self` that are not in `other`
    pub fn difference(self, other: NodeMask) -> NodeMask {
        NodeMask(self.0 & !other.0)
    }

    /// Check that every node of `self` is also in `other`
    pub fn is_subset(&self, other: NodeMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest node id in the set
    pub fn first(&self) -> Option<NodeId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as NodeId + 1)
        }
    }

    /// Iterate node ids in ascending order
    pub fn iter(&self) -> NodeMaskIter {
        NodeMaskIter(self.0)
    }
}

/// Iterator over the node ids of a [`NodeMask`]
pub struct NodeMaskIter(u64);

impl Iterator for NodeMaskIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.0 == 0 {
            return None;
        }
        let idx = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(idx as NodeId + 1)
    }
}

impl IntoIterator for NodeMask {
    type Item = NodeId;
    type IntoIter = NodeMaskIter;

    fn into_iter(self) -> NodeMaskIter {
        self.iter()
    }
}

impl FromIterator<NodeId> for NodeMask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut mask = NodeMask::EMPTY;
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

impl std::fmt::Display for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.iter().map(|id| id.to_string()).collect();
        write!(f, "{{{}}}", ids.join(","))
    }
}

impl std::fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeMask{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let all = NodeMask::first_n(3);
        assert_eq!(all.len(), 3);
        assert_eq!(all.to_string(), "{1,2,3}");

        let disabled = NodeMask::single(3);
        let participants = all.difference(disabled).difference(NodeMask::single(1));
        assert_eq!(participants, NodeMask::single(2));
        assert!(participants.is_subset(all));
        assert_eq!(disabled.union(participants), [2, 3].into_iter().collect());
        assert_eq!(all.intersection(disabled), disabled);
    }

    #[test]
    fn test_insert_remove() {
        let mut mask = NodeMask::EMPTY;
        mask.insert(64);
        mask.insert(1);
        assert!(mask.contains(64));
        assert!(!mask.contains(0));
        assert!(!mask.contains(65));
        assert_eq!(mask.first(), Some(1));

        assert!(mask.remove(1));
        assert!(!mask.remove(1));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![64]);
        assert_eq!(NodeMask::first_n(MAX_NODES).bits(), u64::MAX);
    }

    #[test]
    fn test_matches_ordered_set() {
        use rand::Rng;
        use std::collections::BTreeSet;

        let mut rng = rand::thread_rng();
        let mut mask = NodeMask::EMPTY;
        let mut set = BTreeSet::new();
        for _ in 0..500 {
            let id = rng.gen_range(1..=MAX_NODES as NodeId);
            if rng.gen_bool(0.5) {
                mask.insert(id);
                set.insert(id);
            } else {
                assert_eq!(mask.remove(id), set.remove(&id));
            }
            assert_eq!(mask.len(), set.len());
        }
        assert_eq!(mask.iter().collect::<Vec<_>>(), set.into_iter().collect::<Vec<_>>());
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_id() {
        NodeMask::single(65);
    }
}
