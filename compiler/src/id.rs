// id.rs — Stable handles for nodes and output ports
//
// A `NodeId` is an index into the owning model's node arena, assigned on
// insertion in monotonically increasing order. Because a node may only read
// outputs of nodes inserted before it, id order is always a valid topological
// order. Cross-node references are `PortRef` pairs, never Rust references.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle of a node inside one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Reference to this node's output port at `index`.
    pub fn port(self, index: usize) -> PortRef {
        PortRef::new(self, index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identity of one output port: owning node plus the port's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeId,
    pub index: usize,
}

impl PortRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        PortRef { node, index }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.index)
    }
}

/// Allocator for node handles. Produces ids in insertion order.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct IdAllocator {
    next_node: u32,
}

impl IdAllocator {
    pub(crate) fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.alloc_node(), NodeId(0));
        assert_eq!(ids.alloc_node(), NodeId(1));
        assert_eq!(ids.alloc_node(), NodeId(2));
    }

    #[test]
    fn port_display() {
        assert_eq!(NodeId(4).port(1).to_string(), "n4:1");
    }
}
