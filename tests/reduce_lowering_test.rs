//! Lowering of reductions: variant selection, stage structure and errors.

mod common;

use opfuse::ir::{ForKind, GpuAxis, Stmt, Tensor};
use opfuse::ops::ReduceStages;
use opfuse::prelude::*;
use rustc_hash::FxHashSet;

fn single_reduce(shape: Vec<usize>, dim: &[i64]) -> Graph {
    let mut b = GraphBuilder::new("single_reduce");
    let a = b.create_input(DType::F32, shape, "A");
    b.reduce(&a, ReduceOp::Sum, dim, false);
    b.build().unwrap()
}

/// Loop kinds enclosing the body of schedule block `block`.
fn block_loop_kinds(func: &LoweredFunc, block: &str) -> Vec<ForKind> {
    let mut kinds = Vec::new();
    for s in &func.body {
        s.walk(&mut |st| {
            if let Stmt::ScheduleBlock { name, body } = st {
                if name == block {
                    for inner in body {
                        inner.walk(&mut |l| {
                            if let Stmt::For { kind, .. } = l {
                                kinds.push(*kind);
                            }
                        });
                    }
                }
            }
        });
    }
    kinds
}

#[test]
fn test_large_last_dim_uses_two_step_block_reduce() {
    common::setup();
    let mut graph = single_reduce(vec![16, 4096], &[1]);
    assert_eq!(common::run_fusion(&mut graph), 1);

    let funcs = common::lower_all(&graph, Target::nvgpu());
    let func = &funcs[0];
    let blocks = func.block_names();
    assert_eq!(blocks.len(), 3, "{func}");
    assert!(blocks[0].contains("reduce_tmp_out"));
    assert!(blocks[1].contains("tmp_out"));
    assert_eq!(blocks[2], "var_0");
    assert!(func.has_sync());
    assert_eq!(func.temp_bytes(MemoryScope::Local), 16 * 1024 * 4);
    assert_eq!(func.temp_bytes(MemoryScope::Shared), 16 * 4);
    assert!(func.loop_kinds().contains(&ForKind::GpuThread(GpuAxis::X)));
}

#[test]
fn test_narrow_column_reduce_uses_block_shuffle() {
    common::setup();
    let mut graph = single_reduce(vec![4096, 4], &[0]);
    assert_eq!(common::run_fusion(&mut graph), 1);

    let funcs = common::lower_all(&graph, Target::nvgpu());
    let func = &funcs[0];
    // The reshape stage is inlined into the shared partials.
    let blocks = func.block_names();
    assert_eq!(blocks.len(), 2, "{func}");
    assert!(blocks[0].contains("internal"));
    assert_eq!(func.temp_buffers.len(), 1);
    assert!(func.temp_buffers[0].name.contains("internal"));
    assert_eq!(func.temp_buffers[0].scope, MemoryScope::Shared);
    assert_eq!(func.temp_buffers[0].shape, vec![1, 256, 4]);
    assert!(func.has_sync());

    let last = block_loop_kinds(func, "var_0");
    assert_eq!(last[0], ForKind::GpuBlock(GpuAxis::X));
    assert_eq!(last[1], ForKind::GpuThread(GpuAxis::X));
}

#[test]
fn test_split_reduce_axes_use_block_reduce() {
    common::setup();
    let mut graph = single_reduce(vec![16, 8, 128], &[0, 2]);
    assert_eq!(common::run_fusion(&mut graph), 1);

    let funcs = common::lower_all(&graph, Target::nvgpu());
    let func = &funcs[0];
    let blocks = func.block_names();
    assert_eq!(blocks.len(), 3, "{func}");
    assert!(blocks[0].contains("reduce_tmp_out"));
    assert!(blocks[1].contains("tmp_out"));
    assert_eq!(func.temp_buffers.len(), 2);
    assert_eq!(func.temp_buffers[0].scope, MemoryScope::Local);
    assert_eq!(func.temp_buffers[0].shape, vec![8, 128]);
    assert_eq!(func.temp_buffers[1].scope, MemoryScope::Shared);
    assert_eq!(func.temp_buffers[1].shape, vec![8]);
    assert!(func.has_sync());
    assert_eq!(
        block_loop_kinds(func, "var_0"),
        vec![ForKind::GpuBlock(GpuAxis::X)]
    );
}

#[test]
fn test_two_step_stage_roles() {
    common::setup();
    let graph = single_reduce(vec![16, 4096], &[1]);
    let names = NameGenerator::new();
    let config = LoweringConfig::builder().inline_intermediates(false).build();
    let groups = opfuse::opt::fusion::op_fusion(&graph).unwrap();
    let funcs = OpLowerer::new(&graph, Target::nvgpu(), &names)
        .with_config(config)
        .lower(&groups[0])
        .unwrap();
    let func = &funcs[0];
    // The reshape stage survives when inlining is off.
    assert_eq!(func.block_names().len(), 4);
    assert_eq!(func.temp_buffers.len(), 3);
    assert_eq!(func.temp_buffers[0].shape, vec![16, 1, 4, 1024]);
}

#[test]
fn test_cpu_reduce_is_simple_and_parallel() {
    common::setup();
    let mut graph = single_reduce(vec![16, 4096], &[1]);
    common::run_fusion(&mut graph);
    let funcs = common::lower_all(&graph, Target::x86());
    let func = &funcs[0];
    assert_eq!(func.block_names(), vec!["var_0".to_string()]);
    assert!(func.temp_buffers.is_empty());
    assert_eq!(func.loop_kinds()[0], ForKind::Parallel);
    assert!(!func.has_sync());
}

#[test]
fn test_stage_classification_by_count() {
    let tensors: Vec<Tensor> = ["a", "b", "c"]
        .iter()
        .map(|n| Tensor::placeholder(*n, vec![4], DType::F32))
        .collect();
    assert!(matches!(
        ReduceStages::from_stage_tensors(true, &tensors).unwrap(),
        ReduceStages::BlockReduce { .. }
    ));
    assert!(matches!(
        ReduceStages::from_stage_tensors(false, &tensors).unwrap(),
        ReduceStages::BlockShuffleReduce { .. }
    ));
    assert!(matches!(
        ReduceStages::from_stage_tensors(false, &tensors[..2]),
        Err(CompileError::UnsupportedStageCount {
            count: 2,
            with_last_dim: false
        })
    ));
}

#[test]
fn test_shape_failure_names_node() {
    common::setup();
    let mut graph = Graph::default();
    graph.add_input("A", DType::F32, vec![4]).unwrap();
    graph
        .add_op("reshape", &["A"], AttrMap::new().with("shape", vec![3_i64]))
        .unwrap();
    let names = NameGenerator::new();
    let err = compile(&mut graph, &Target::x86(), &names).unwrap_err();
    assert!(err.to_string().contains("reshape_0"), "{err}");
}

#[test]
fn test_concurrent_lowering_yields_unique_names() {
    common::setup();
    let mut b = GraphBuilder::new("independent");
    for i in 0..4 {
        let a = b.create_input(DType::F32, vec![16, 4096], &format!("A{i}"));
        b.reduce(&a, ReduceOp::Sum, &[1], false);
    }
    let mut graph = b.build().unwrap();
    assert_eq!(common::run_fusion(&mut graph), 4);
    assert_eq!(common::run_merge(&mut graph), 4);

    let names = NameGenerator::new();
    let lowerer = OpLowerer::new(&graph, Target::nvgpu(), &names);
    let funcs: Vec<LoweredFunc> = std::thread::scope(|s| {
        let handles: Vec<_> = graph
            .fusion_groups
            .iter()
            .map(|g| {
                let lowerer = &lowerer;
                s.spawn(move || lowerer.lower(g).unwrap())
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(funcs.len(), 4);

    let temps: Vec<&str> = funcs
        .iter()
        .flat_map(|f| f.temp_buffers.iter().map(|t| t.name.as_str()))
        .collect();
    let unique: FxHashSet<&str> = temps.iter().copied().collect();
    assert_eq!(temps.len(), 8);
    assert_eq!(unique.len(), temps.len());
}
