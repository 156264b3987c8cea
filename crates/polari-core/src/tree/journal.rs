//! Undo journal for atomic tree mutations.
//!
//! A frame remembers the first-seen value of every slot a mutation touches,
//! plus the arena lengths when the frame opened. Rolling back restores the
//! remembered values and truncates anything allocated since. Frames nest:
//! a committed inner frame folds into its parent so the outer scope can
//! still undo it.

use super::instance::{Instance, InstanceHandle};
use super::object_tree::TreeKey;
use super::path::{NodeId, TreeNode};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub(crate) struct Frame {
    pub(crate) node_len: usize,
    pub(crate) instance_len: usize,
    pub(crate) nodes: HashMap<NodeId, Option<TreeNode>>,
    pub(crate) instances: HashMap<InstanceHandle, Option<Instance>>,
    pub(crate) owners: HashMap<InstanceHandle, Option<NodeId>>,
    pub(crate) keys: HashMap<TreeKey, Option<InstanceHandle>>,
    pub(crate) placements: HashMap<InstanceHandle, Vec<NodeId>>,
}

impl Frame {
    pub(crate) fn new(node_len: usize, instance_len: usize) -> Self {
        Self {
            node_len,
            instance_len,
            ..Self::default()
        }
    }

    /// Fold a committed inner frame into this one, keeping older values.
    pub(crate) fn absorb(&mut self, inner: Frame) {
        for (k, v) in inner.nodes {
            self.nodes.entry(k).or_insert(v);
        }
        for (k, v) in inner.instances {
            self.instances.entry(k).or_insert(v);
        }
        for (k, v) in inner.owners {
            self.owners.entry(k).or_insert(v);
        }
        for (k, v) in inner.keys {
            self.keys.entry(k).or_insert(v);
        }
        for (k, v) in inner.placements {
            self.placements.entry(k).or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_keeps_outer_values() {
        let mut outer = Frame::new(1, 1);
        outer.owners.insert(InstanceHandle::new(0), None);

        let mut inner = Frame::new(3, 2);
        inner.owners.insert(InstanceHandle::new(0), Some(NodeId(2)));
        inner.owners.insert(InstanceHandle::new(1), Some(NodeId(1)));

        outer.absorb(inner);
        assert_eq!(outer.owners.get(&InstanceHandle::new(0)), Some(&None));
        assert_eq!(outer.owners.get(&InstanceHandle::new(1)), Some(&Some(NodeId(1))));
        assert_eq!(outer.node_len, 1);
    }
}
