use log::{debug, info, trace};
use rustc_hash::FxHashSet;

use super::group::{finalize_groups, FusionGroup};
use super::{producer_fits, ReduceInfo};
use crate::error::Result;
use crate::graph::{Graph, NodeId, PatternKind};
use crate::ops::broadcastable;
use crate::opt::GraphPass;

/// Initial fusion: walks consumers before producers and pulls each node into
/// the group of its consumers when the shapes allow it.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpFusionPass;

impl GraphPass for OpFusionPass {
    fn name(&self) -> &'static str {
        "OpFusionPass"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        let groups = op_fusion(graph)?;
        info!("{}: {} nodes -> {} groups", self.name(), graph.node_count(), groups.len());
        graph.fusion_groups = groups;
        Ok(())
    }
}

/// Computes the initial partition without touching `graph.fusion_groups`.
pub fn op_fusion(graph: &Graph) -> Result<Vec<FusionGroup>> {
    graph.validate_inputs()?;
    graph.check_tensor_info()?;
    let order = graph.topological_order()?;

    let mut owner: Vec<Option<usize>> = vec![None; graph.node_count()];
    let mut groups: Vec<Vec<NodeId>> = Vec::new();

    for &id in order.iter().rev() {
        let node = graph.node(id);
        let consumers = graph.node_consumers(id);
        let candidate = if node.pattern == PatternKind::Opaque || consumers.is_empty() {
            None
        } else {
            let owners: FxHashSet<Option<usize>> = consumers.iter().map(|c| owner[c.0]).collect();
            match owners.into_iter().collect::<Vec<_>>().as_slice() {
                [Some(g)] => Some(*g),
                _ => None,
            }
        };

        let joined = match candidate {
            Some(g) if can_fuse(graph, id, &groups[g])? => {
                groups[g].insert(0, id);
                debug!("{}: fused into group of {}", node.name, graph.node(groups[g][1]).name);
                Some(g)
            }
            _ => None,
        };
        let g = joined.unwrap_or_else(|| {
            groups.push(vec![id]);
            trace!("{}: new group", node.name);
            groups.len() - 1
        });
        owner[id.0] = Some(g);
    }

    finalize_groups(graph, groups)
}

fn can_fuse(graph: &Graph, id: NodeId, members: &[NodeId]) -> Result<bool> {
    if members.iter().any(|&m| graph.node(m).pattern == PatternKind::Opaque) {
        return Ok(false);
    }
    let node = graph.node(id);
    let users: Vec<NodeId> = graph
        .node_consumers(id)
        .into_iter()
        .filter(|c| members.contains(c))
        .collect();

    if node.pattern.is_injective_like() {
        for &c in &users {
            if !producer_fits(graph, id, c)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    if node.pattern == PatternKind::Reduce {
        let info = ReduceInfo::of(graph, id)?;
        if !info.without_last_dim() {
            return Ok(false);
        }
        for &c in &users {
            if graph.node(c).is_reduce() || !broadcastable(&info.output_shape, graph.output_shape(c)?) {
                return Ok(false);
            }
        }
        for &m in members {
            if graph.node(m).is_reduce() {
                let other = ReduceInfo::of(graph, m)?;
                if !other.without_last_dim() || other.output_shape != info.output_shape {
                    return Ok(false);
                }
            }
        }
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{infer_shapes, AttrMap, GraphBuilder};
    use crate::ir::{DType, ReduceOp};

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_elementwise_diamond_is_one_group() {
        setup();
        let mut b = GraphBuilder::new("diamond");
        let a = b.create_input(DType::F32, vec![32, 32], "A");
        let x = b.create_input(DType::F32, vec![32, 32], "B");
        let e = b.elementwise_add(&a, &x);
        let f = b.elementwise_add(&e, &a);
        let g = b.elementwise_add(&e, &x);
        b.elementwise_add(&f, &g);
        let graph = b.build().unwrap();
        let groups = op_fusion(&graph).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 4);
    }

    #[test]
    fn test_fan_out_to_different_groups_isolates_producer() {
        setup();
        let mut b = GraphBuilder::new("fan_out");
        let a = b.create_input(DType::F32, vec![8, 8], "A");
        let x = b.create_input(DType::F32, vec![8, 8], "B");
        let w = b.create_input(DType::F32, vec![8, 8], "W");
        let e = b.elementwise_add(&a, &x);
        b.matmul(&e, &w);
        b.relu(&e);
        let graph = b.build().unwrap();
        let groups = op_fusion(&graph).unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn test_last_dim_reduction_does_not_join_consumer() {
        setup();
        let mut b = GraphBuilder::new("last_dim");
        let a = b.create_input(DType::F32, vec![16, 64], "A");
        let r = b.reduce(&a, ReduceOp::Sum, &[1], false);
        b.relu(&r);
        let graph = b.build().unwrap();
        assert_eq!(op_fusion(&graph).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_shape_is_fatal() {
        setup();
        let mut graph = Graph::default();
        graph.add_input("A", DType::F32, vec![4]).unwrap();
        graph.add_op("relu", &["A"], AttrMap::new()).unwrap();
        assert!(op_fusion(&graph).is_err());
        infer_shapes(&mut graph).unwrap();
        assert_eq!(op_fusion(&graph).unwrap().len(), 1);
    }
}
