// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topology/routing-tree trait boundary (spec §1: message-aggregation
//! routing is configured per-cluster and delegated, not hardcoded).
//!
//! The controller uplink and the RPC dispatcher ask a `RoutingTree` for a
//! node's fan-out children rather than computing `agentd_core::reverse_tree`
//! directly, so a cluster can plug in a topology-aware tree (rack/switch
//! aware) without the dispatcher caring. The reference implementation here
//! is the depth-first static tree `agentd_core::reverse_tree` already
//! describes.

use agentd_core::{reverse_tree, NodeId};

/// This node's position in the aggregation tree for a given node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPosition {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Computes routing positions over an ordered node list.
pub trait RoutingTree: Send + Sync {
    fn position(&self, nodes: &[NodeId], local: &NodeId) -> RoutingPosition;
}

/// Reference `RoutingTree`: a depth-first static tree with fixed fan-in,
/// delegating the arithmetic to `agentd_core::reverse_tree`.
pub struct StaticRoutingTree {
    fan_in: u32,
}

impl StaticRoutingTree {
    pub fn new(fan_in: u32) -> Self {
        Self { fan_in }
    }
}

impl Default for StaticRoutingTree {
    fn default() -> Self {
        Self::new(16)
    }
}

impl RoutingTree for StaticRoutingTree {
    fn position(&self, nodes: &[NodeId], local: &NodeId) -> RoutingPosition {
        let Some(rank) = nodes.iter().position(|n| n == local) else {
            return RoutingPosition { parent: None, children: Vec::new() };
        };

        let pos = reverse_tree::position(rank as u32, nodes.len() as u32, self.fan_in);
        RoutingPosition {
            parent: pos.parent.and_then(|p| nodes.get(p as usize).cloned()),
            children: pos.children.iter().filter_map(|&c| nodes.get(c as usize).cloned()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn root_node_has_no_parent() {
        let tree = StaticRoutingTree::new(3);
        let node_list = nodes(&["n0", "n1", "n2", "n3"]);
        let pos = tree.position(&node_list, &node_list[0]);
        assert_eq!(pos.parent, None);
    }

    #[test]
    fn leaf_node_has_no_children() {
        let tree = StaticRoutingTree::new(1);
        let node_list = nodes(&["n0", "n1", "n2"]);
        let pos = tree.position(&node_list, &node_list[2]);
        assert!(pos.children.is_empty());
    }

    #[test]
    fn node_not_in_list_gets_empty_position() {
        let tree = StaticRoutingTree::default();
        let node_list = nodes(&["n0", "n1"]);
        let pos = tree.position(&node_list, &NodeId::from("ghost"));
        assert_eq!(pos.parent, None);
        assert!(pos.children.is_empty());
    }
}
