//! Node pool and executor slot accounting.

use foreman_core::{Node, NodeRef};
use serde::Serialize;
use tracing::warn;

/// Handle to one reserved executor slot.
///
/// Identifies the node the slot was taken from; giving it back to
/// [`NodePool::release`] frees the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId(usize);

/// Occupancy of one node at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    pub node: NodeRef,
    pub in_use: u32,
    pub capacity: u32,
}

#[derive(Debug)]
struct NodeState {
    node: Node,
    in_use: u32,
}

/// The nodes of one distributor together with their current occupancy.
///
/// Owned by the scheduler loop; nothing else mutates the counters.
#[derive(Debug)]
pub(crate) struct NodePool {
    nodes: Vec<NodeState>,
}

impl NodePool {
    pub(crate) fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| NodeState { node, in_use: 0 })
                .collect(),
        }
    }

    /// Reserve a slot on the first node, in declaration order, with spare
    /// capacity.
    pub(crate) fn reserve(&mut self) -> Option<SlotId> {
        let (index, state) = self
            .nodes
            .iter_mut()
            .enumerate()
            .find(|(_, state)| state.in_use < state.node.max_executors_count)?;
        state.in_use += 1;
        Some(SlotId(index))
    }

    pub(crate) fn release(&mut self, slot: SlotId) {
        match self.nodes.get_mut(slot.0) {
            Some(state) if state.in_use > 0 => state.in_use -= 1,
            Some(state) => {
                warn!(node = %state.node.reference(), "Released a slot on an idle node")
            }
            None => warn!(slot = slot.0, "Released a slot of an unknown node"),
        }
    }

    pub(crate) fn node(&self, slot: SlotId) -> Option<&Node> {
        self.nodes.get(slot.0).map(|state| &state.node)
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.nodes.iter().map(|state| state.in_use).sum()
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.nodes
            .iter()
            .map(|state| state.node.max_executors_count)
            .sum()
    }

    pub(crate) fn usage(&self) -> Vec<NodeUsage> {
        self.nodes
            .iter()
            .map(|state| NodeUsage {
                node: state.node.reference(),
                in_use: state.in_use,
                capacity: state.node.max_executors_count,
            })
            .collect()
    }
}
