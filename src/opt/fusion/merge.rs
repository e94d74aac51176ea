use std::fmt;

use log::{debug, info};
use rustc_hash::FxHashSet;

use super::group::{finalize_groups, group_successors, FusionGroup, GroupId};
use super::{producer_fits, ReduceInfo};
use crate::error::Result;
use crate::graph::{Graph, NodeId, PatternKind};
use crate::opt::GraphPass;

/// Coalesces the groups left by [`OpFusionPass`](super::OpFusionPass) until
/// no legal merge remains.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusionMergePass;

impl GraphPass for FusionMergePass {
    fn name(&self) -> &'static str {
        "FusionMergePass"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        let before = graph.fusion_groups.len();
        let groups = fusion_merge(graph, &graph.fusion_groups)?;
        info!("{}: {before} groups -> {}", self.name(), groups.len());
        graph.fusion_groups = groups;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Horizontal,
    Vertical,
    ReduceEpilogue,
    FanOut,
}

impl fmt::Display for MergeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeKind::Horizontal => "horizontal",
            MergeKind::Vertical => "vertical",
            MergeKind::ReduceEpilogue => "reduce epilogue",
            MergeKind::FanOut => "fan-out",
        };
        write!(f, "{s}")
    }
}

/// Merges `groups` to a fixed point. Survivors keep the lowest id involved;
/// ids are re-densified at the end.
pub fn fusion_merge(graph: &Graph, groups: &[FusionGroup]) -> Result<Vec<FusionGroup>> {
    let positions = graph.topological_positions()?;
    let mut members: Vec<Vec<NodeId>> = groups.iter().map(|g| g.nodes.clone()).collect();

    while let Some((kind, mut set)) = find_merge(graph, &members)? {
        set.sort_unstable();
        let survivor = set[0];
        debug!(
            "{kind} merge of {} into {}",
            set[1..]
                .iter()
                .map(|&g| group_label(graph, &members[g]))
                .collect::<Vec<_>>()
                .join(", "),
            group_label(graph, &members[survivor])
        );
        for &g in set[1..].iter().rev() {
            let absorbed = members.remove(g);
            members[survivor].extend(absorbed);
        }
        members[survivor].sort_by_key(|n| positions[n.0]);
    }

    finalize_groups(graph, members)
}

fn group_label(graph: &Graph, members: &[NodeId]) -> String {
    members
        .first()
        .map(|&n| graph.node(n).name.clone())
        .unwrap_or_default()
}

/// First legal merge in ascending group order.
fn find_merge(graph: &Graph, members: &[Vec<NodeId>]) -> Result<Option<(MergeKind, Vec<usize>)>> {
    let succ = group_successors(graph, members);
    let infos: Vec<FusionGroup> = members
        .iter()
        .enumerate()
        .map(|(i, m)| FusionGroup::from_nodes(graph, GroupId(i), m.clone()))
        .collect();

    for g in 0..members.len() {
        let reduce_users: Vec<usize> = succ[g].iter().copied().filter(|&c| infos[c].is_reduce()).collect();
        if let Some((&first, rest)) = reduce_users.split_first() {
            let signature = ReduceSignature::of(graph, &infos[first])?;
            let mut set = vec![first];
            for &c in rest {
                if compatible(&ReduceSignature::of(graph, &infos[c])?, &signature) {
                    set.push(c);
                }
            }
            if set.len() >= 2 && !creates_cycle(&succ, &set) {
                return Ok(Some((MergeKind::Horizontal, set)));
            }
        }

        if let [c] = succ[g].as_slice() {
            let c = *c;
            if infos[g].pattern.is_injective_like()
                && infos[c].pattern != PatternKind::Opaque
                && shapes_agree(graph, &infos[g], &infos[c])?
                && !creates_cycle(&succ, &[g, c])
            {
                return Ok(Some((MergeKind::Vertical, vec![g, c])));
            }
        }

        if infos[g].is_reduce() {
            for &c in &succ[g] {
                if infos[c].pattern <= PatternKind::Broadcast
                    && epilogue_fits(graph, &infos[g], &infos[c])?
                    && !creates_cycle(&succ, &[g, c])
                {
                    return Ok(Some((MergeKind::ReduceEpilogue, vec![g, c])));
                }
            }
        }

        if succ[g].len() >= 2
            && infos[g].pattern.is_injective_like()
            && fan_out_fits(graph, &infos, g, &succ[g])?
        {
            let mut set = vec![g];
            set.extend(succ[g].iter().copied());
            if !creates_cycle(&succ, &set) {
                return Ok(Some((MergeKind::FanOut, set)));
            }
        }
    }
    Ok(None)
}

/// An injective-like `producer` can be absorbed together with all of its
/// consumer groups: none is opaque, every edge passes the shape rule and the
/// reducing consumers are mutually compatible.
fn fan_out_fits(graph: &Graph, infos: &[FusionGroup], producer: usize, consumers: &[usize]) -> Result<bool> {
    let mut signature = None;
    for &c in consumers {
        if infos[c].pattern == PatternKind::Opaque || !shapes_agree(graph, &infos[producer], &infos[c])? {
            return Ok(false);
        }
        if infos[c].is_reduce() {
            let sig = ReduceSignature::of(graph, &infos[c])?;
            match &signature {
                None => signature = Some(sig),
                Some(first) if !compatible(&sig, first) => return Ok(false),
                Some(_) => {}
            }
        }
    }
    Ok(true)
}

/// Whether merging `set` would put a group both before and after it.
fn creates_cycle(succ: &[Vec<usize>], set: &[usize]) -> bool {
    let mut stack: Vec<usize> = set
        .iter()
        .flat_map(|&g| succ[g].iter().copied())
        .filter(|g| !set.contains(g))
        .collect();
    let mut seen = FxHashSet::default();
    while let Some(g) = stack.pop() {
        if !seen.insert(g) {
            continue;
        }
        for &s in &succ[g] {
            if set.contains(&s) {
                return true;
            }
            stack.push(s);
        }
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReduceSignature {
    output_shape: Vec<usize>,
    without_last_dim: bool,
    input_shape: Vec<usize>,
    axes: Vec<usize>,
}

impl ReduceSignature {
    /// Signature of the first reduction in `group`.
    fn of(graph: &Graph, group: &FusionGroup) -> Result<Option<Self>> {
        let Some(&r) = group.nodes.iter().find(|&&n| graph.node(n).is_reduce()) else {
            return Ok(None);
        };
        let info = ReduceInfo::of(graph, r)?;
        Ok(Some(Self {
            without_last_dim: info.without_last_dim(),
            output_shape: info.output_shape,
            input_shape: info.input_shape,
            axes: info.axes,
        }))
    }
}

/// Same output shape and classification; reductions over the last dim must
/// also agree on input shape and axes.
fn compatible(a: &Option<ReduceSignature>, b: &Option<ReduceSignature>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    if a.output_shape != b.output_shape || a.without_last_dim != b.without_last_dim {
        return false;
    }
    a.without_last_dim || (a.input_shape == b.input_shape && a.axes == b.axes)
}

/// Every edge from `producer` into `consumer` passes the node-level shape
/// rule of the initial fusion.
fn shapes_agree(graph: &Graph, producer: &FusionGroup, consumer: &FusionGroup) -> Result<bool> {
    for &n in &producer.nodes {
        for c in graph.node_consumers(n) {
            if consumer.contains(c) && !producer_fits(graph, n, c)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn squeeze(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

/// `consumer` only combines the reduced outputs of `reduce` with graph
/// inputs, at the reduced shape.
fn epilogue_fits(graph: &Graph, reduce: &FusionGroup, consumer: &FusionGroup) -> Result<bool> {
    for t in &consumer.external_inputs {
        let from_reduce = graph.producer(t).is_some_and(|p| reduce.contains(p));
        if !from_reduce && !graph.is_graph_input(t) {
            return Ok(false);
        }
    }
    let mut reduced_shapes = Vec::new();
    for &n in &reduce.nodes {
        if graph.node(n).is_reduce() && graph.node_consumers(n).iter().any(|&c| consumer.contains(c)) {
            reduced_shapes.push(squeeze(graph.output_shape(n)?));
        }
    }
    if reduced_shapes.is_empty() {
        return Ok(false);
    }
    for &o in &consumer.output_nodes {
        let out = squeeze(graph.output_shape(o)?);
        if reduced_shapes.iter().any(|s| *s != out) {
            return Ok(false);
        }
    }
    Ok(true)
}
