use std::fmt;

use rustc_hash::FxHashSet;

use crate::error::{CompileError, Result};
use crate::graph::{Graph, NodeId, PatternKind};

/// Dense index of a fusion group, ordered by the topological position of
/// the group's first member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A set of nodes lowered into one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionGroup {
    pub id: GroupId,
    /// Members in topological order.
    pub nodes: Vec<NodeId>,
    pub pattern: PatternKind,
    /// Tensors read by a member but produced outside the group, in first-use
    /// order.
    pub external_inputs: Vec<String>,
    /// Members whose output leaves the group, is a graph output, or is not
    /// read at all.
    pub output_nodes: Vec<NodeId>,
}

impl FusionGroup {
    /// Derives the pattern and the group boundary of `nodes`, which must be
    /// topologically sorted.
    pub fn from_nodes(graph: &Graph, id: GroupId, nodes: Vec<NodeId>) -> Self {
        let members: FxHashSet<NodeId> = nodes.iter().copied().collect();
        let pattern = PatternKind::dominant(nodes.iter().map(|&n| graph.node(n).pattern))
            .unwrap_or(PatternKind::ElementWise);

        let mut external_inputs: Vec<String> = Vec::new();
        for &n in &nodes {
            for t in &graph.node(n).inputs {
                let internal = graph.producer(t).is_some_and(|p| members.contains(&p));
                if !internal && !external_inputs.contains(t) {
                    external_inputs.push(t.clone());
                }
            }
        }

        let output_nodes = nodes
            .iter()
            .copied()
            .filter(|&n| {
                graph.node(n).outputs.iter().any(|t| {
                    let users = graph.consumers(t);
                    graph.is_graph_output(t) || users.is_empty() || users.iter().any(|u| !members.contains(u))
                })
            })
            .collect();

        Self {
            id,
            nodes,
            pattern,
            external_inputs,
            output_nodes,
        }
    }

    /// Function name derived from the member names.
    pub fn name(&self, graph: &Graph) -> String {
        let members: Vec<&str> = self.nodes.iter().map(|&n| graph.node(n).name.as_str()).collect();
        format!("fn_{}", members.join("_"))
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn is_reduce(&self) -> bool {
        self.pattern == PatternKind::Reduce
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_output_node(&self, node: NodeId) -> bool {
        self.output_nodes.contains(&node)
    }
}

/// Group index of every node, `None` for nodes outside all groups.
pub(crate) fn owner_table(graph: &Graph, groups: &[Vec<NodeId>]) -> Vec<Option<usize>> {
    let mut owner = vec![None; graph.node_count()];
    for (g, members) in groups.iter().enumerate() {
        for n in members {
            owner[n.0] = Some(g);
        }
    }
    owner
}

/// Distinct successor groups of every group in the coarse graph.
pub(crate) fn group_successors(graph: &Graph, groups: &[Vec<NodeId>]) -> Vec<Vec<usize>> {
    let owner = owner_table(graph, groups);
    let mut succ: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
    for edge in graph.edges() {
        if let (Some(from), Some(to)) = (owner[edge.producer.0], owner[edge.consumer.0]) {
            if from != to && !succ[from].contains(&to) {
                succ[from].push(to);
            }
        }
    }
    for s in succ.iter_mut() {
        s.sort_unstable();
    }
    succ
}

/// Sorts members and groups topologically and assigns dense ids, then
/// checks the partition.
pub fn finalize_groups(graph: &Graph, mut groups: Vec<Vec<NodeId>>) -> Result<Vec<FusionGroup>> {
    let positions = graph.topological_positions()?;
    groups.retain(|g| !g.is_empty());
    for members in groups.iter_mut() {
        members.sort_by_key(|n| positions[n.0]);
    }
    groups.sort_by_key(|members| positions[members[0].0]);
    let groups: Vec<FusionGroup> = groups
        .into_iter()
        .enumerate()
        .map(|(i, members)| FusionGroup::from_nodes(graph, GroupId(i), members))
        .collect();
    verify_groups(graph, &groups)?;
    Ok(groups)
}

/// Every node belongs to exactly one group and the coarse graph is acyclic.
pub fn verify_groups(graph: &Graph, groups: &[FusionGroup]) -> Result<()> {
    let mut seen = vec![0usize; graph.node_count()];
    for (i, group) in groups.iter().enumerate() {
        if group.id != GroupId(i) || group.is_empty() {
            return Err(CompileError::DisconnectedGroup(group.id.0));
        }
        for n in &group.nodes {
            seen[n.0] += 1;
        }
    }
    if let Some((n, &count)) = seen.iter().enumerate().find(|(_, c)| **c != 1) {
        return Err(CompileError::GroupCoverage(format!(
            "node `{}` is in {count} groups",
            graph.node(NodeId(n)).name
        )));
    }

    let members: Vec<Vec<NodeId>> = groups.iter().map(|g| g.nodes.clone()).collect();
    let succ = group_successors(graph, &members);
    let mut indegree = vec![0usize; groups.len()];
    for s in &succ {
        for &t in s {
            indegree[t] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..groups.len()).filter(|&g| indegree[g] == 0).collect();
    let mut visited = 0;
    while let Some(g) = ready.pop() {
        visited += 1;
        for &t in &succ[g] {
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.push(t);
            }
        }
    }
    if visited != groups.len() {
        let stuck = (0..groups.len())
            .find(|&g| indegree[g] > 0)
            .map(|g| groups[g].name(graph))
            .unwrap_or_default();
        return Err(CompileError::Cycle(stuck));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrMap, Graph};
    use crate::ir::DType;

    fn chain() -> Graph {
        let mut g = Graph::default();
        g.add_input("A", DType::F32, vec![8]).unwrap();
        let b = g.add_op("relu", &["A"], AttrMap::new()).unwrap();
        let c = g.add_op("exp", &[b.as_str()], AttrMap::new()).unwrap();
        g.add_op("neg", &[c.as_str()], AttrMap::new()).unwrap();
        g
    }

    #[test]
    fn test_group_boundary() {
        let g = chain();
        let group = FusionGroup::from_nodes(&g, GroupId(0), vec![NodeId(0), NodeId(1)]);
        assert_eq!(group.external_inputs, vec!["A".to_string()]);
        assert_eq!(group.output_nodes, vec![NodeId(1)]);
        assert_eq!(group.pattern, PatternKind::ElementWise);
        assert_eq!(group.name(&g), "fn_relu_0_exp_1");
    }

    #[test]
    fn test_finalize_orders_groups() {
        let g = chain();
        let groups = finalize_groups(&g, vec![vec![NodeId(2)], vec![NodeId(1), NodeId(0)]]).unwrap();
        assert_eq!(groups[0].nodes, vec![NodeId(0), NodeId(1)]);
        assert_eq!(groups[1].id, GroupId(1));
    }

    #[test]
    fn test_coverage_violation() {
        let g = chain();
        let err = finalize_groups(&g, vec![vec![NodeId(0)], vec![NodeId(1)]]).unwrap_err();
        assert!(matches!(err, CompileError::GroupCoverage(_)));
    }

    #[test]
    fn test_coarse_cycle_detected() {
        let g = chain();
        // {0, 2} -> {1} -> {0, 2}
        let groups = vec![
            FusionGroup::from_nodes(&g, GroupId(0), vec![NodeId(0), NodeId(2)]),
            FusionGroup::from_nodes(&g, GroupId(1), vec![NodeId(1)]),
        ];
        assert!(matches!(verify_groups(&g, &groups), Err(CompileError::Cycle(_))));
    }
}
