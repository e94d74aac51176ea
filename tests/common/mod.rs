//! Common test utilities for the fusion and lowering tests

#![allow(dead_code)]

use opfuse::opt::fusion::FusionGroup;
use opfuse::prelude::*;

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs the initial fusion pass and returns the group count.
pub fn run_fusion(graph: &mut Graph) -> usize {
    OpFusionPass.run(graph).unwrap();
    graph.fusion_groups.len()
}

/// Runs the merge pass and returns the group count.
pub fn run_merge(graph: &mut Graph) -> usize {
    FusionMergePass.run(graph).unwrap();
    graph.fusion_groups.len()
}

/// Lowers every group and checks each yields a single function.
pub fn lower_all(graph: &Graph, target: Target) -> Vec<LoweredFunc> {
    let names = NameGenerator::new();
    let lowerer = OpLowerer::new(graph, target, &names);
    graph
        .fusion_groups
        .iter()
        .flat_map(|g| {
            let funcs = lowerer.lower(g).unwrap();
            assert_eq!(funcs.len(), 1, "group {}", g.id);
            funcs
        })
        .collect()
}

pub fn member_names(graph: &Graph, group: &FusionGroup) -> Vec<String> {
    group.nodes.iter().map(|&n| graph.node(n).name.clone()).collect()
}
