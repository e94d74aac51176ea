//! Graph traversal utilities

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashSet;

use super::{Graph, NodeId};
use crate::error::{CompileError, Result};

impl Graph {
    /// Fails if a node reads a tensor that is neither a graph input nor
    /// produced by some node.
    pub fn validate_inputs(&self) -> Result<()> {
        for node in self.nodes() {
            for input in &node.inputs {
                if self.producer(input).is_none() && !self.is_graph_input(input) {
                    return Err(CompileError::UnknownTensor(input.clone()));
                }
            }
        }
        Ok(())
    }

    /// Topological order (producers before consumers).
    ///
    /// Ties are broken by node id, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        self.validate_inputs()?;
        let mut indegree: Vec<usize> = self
            .nodes()
            .iter()
            .map(|n| self.node_producers(n.id).len())
            .collect();
        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(NodeId(i)))
            .collect();

        let mut order = Vec::with_capacity(self.node_count());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for user in self.node_consumers(id) {
                indegree[user.0] -= 1;
                if indegree[user.0] == 0 {
                    ready.push(Reverse(user));
                }
            }
        }

        if order.len() != self.node_count() {
            let placed: FxHashSet<NodeId> = order.iter().copied().collect();
            let stuck = self
                .nodes()
                .iter()
                .find(|n| !placed.contains(&n.id))
                .map(|n| n.name.clone())
                .unwrap_or_default();
            return Err(CompileError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Position of every node in [`Graph::topological_order`], indexed by id.
    pub fn topological_positions(&self) -> Result<Vec<usize>> {
        let order = self.topological_order()?;
        let mut positions = vec![0; self.node_count()];
        for (pos, id) in order.into_iter().enumerate() {
            positions[id.0] = pos;
        }
        Ok(positions)
    }
}
