//! End-to-end driver: inference, fusion, merge and lowering.

use log::info;

use crate::error::Result;
use crate::graph::{Graph, InferShapePass};
use crate::ir::LoweredFunc;
use crate::lowerer::{LoweringConfig, OpLowerer};
use crate::naming::NameGenerator;
use crate::opt::fusion::{FusionMergePass, OpFusionPass};
use crate::opt::{apply_passes, GraphPass};
use crate::target::Target;

/// Runs the full pipeline with the default [`LoweringConfig`].
///
/// Leaves the merged partition in `graph.fusion_groups` and returns one
/// function per group, in group order.
pub fn compile(graph: &mut Graph, target: &Target, names: &NameGenerator) -> Result<Vec<LoweredFunc>> {
    compile_with_config(graph, target, names, LoweringConfig::default())
}

pub fn compile_with_config(
    graph: &mut Graph,
    target: &Target,
    names: &NameGenerator,
    config: LoweringConfig,
) -> Result<Vec<LoweredFunc>> {
    let passes: [&dyn GraphPass; 3] = [&InferShapePass, &OpFusionPass, &FusionMergePass];
    apply_passes(graph, &passes)?;

    let lowerer = OpLowerer::new(graph, target.clone(), names).with_config(config);
    let mut funcs = Vec::with_capacity(graph.fusion_groups.len());
    for group in &graph.fusion_groups {
        funcs.extend(lowerer.lower(group)?);
    }
    info!("compiled {} groups for {target}", funcs.len());
    Ok(funcs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::ir::{DType, ReduceOp};

    #[test]
    fn test_compile_reduce_epilogue() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = GraphBuilder::new("softmax_like");
        let a = b.create_input(DType::F32, vec![8, 64], "A");
        let m = b.reduce(&a, ReduceOp::Max, &[1], false);
        b.exp(&m);
        let mut graph = b.build().unwrap();

        let names = NameGenerator::new();
        let funcs = compile(&mut graph, &Target::nvgpu(), &names).unwrap();
        assert_eq!(graph.fusion_groups.len(), 1);
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].outputs().count(), 1);
    }
}
