//! Lowering of fusion groups into scheduled functions.
//!
//! Each group goes through three phases: every member emits its compute
//! stages, the stages are merged into one body and scheduled, and the body is
//! wrapped into a [`LoweredFunc`] with its arguments and temporary buffers.

mod config;

pub use config::LoweringConfig;

use indexmap::IndexMap;
use log::debug;
use rustc_hash::FxHashSet;

use crate::error::{CompileError, Result, ScheduleError};
use crate::graph::{Graph, NodeId};
use crate::ir::{
    ArgKind, Argument, DeviceApi, IrSchedule, LoweredFunc, ModuleExpr, StageRole, TempBuffer, Tensor,
};
use crate::naming::NameGenerator;
use crate::ops::reduction::{without_last_dim_in_reduce, ReduceAttrs};
use crate::ops::{ComputeContext, ReduceStages, ScheduleContext};
use crate::opt::fusion::FusionGroup;
use crate::target::Target;

/// Progress of one group through the lowerer. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoweringState {
    Unlowered,
    ComputeEmitted,
    Scheduled,
    Finalized,
}

/// Stages emitted for one member node.
#[derive(Debug)]
struct NodeStages {
    node: NodeId,
    reduce: Option<ReduceStages>,
}

struct Session<'g> {
    group: &'g FusionGroup,
    name: String,
    state: LoweringState,
    /// Placeholders first, then every emitted stage in emission order.
    tensors: IndexMap<String, Tensor>,
    stages: Vec<NodeStages>,
}

impl Session<'_> {
    fn advance(&mut self, next: LoweringState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);
        debug!("{}: {:?} -> {next:?}", self.name, self.state);
        self.state = next;
    }
}

/// Lowers fusion groups of one graph for one target.
///
/// The lowerer only reads the graph, so groups may be lowered from several
/// threads sharing one [`NameGenerator`].
pub struct OpLowerer<'a> {
    graph: &'a Graph,
    target: Target,
    config: LoweringConfig,
    names: &'a NameGenerator,
}

impl<'a> OpLowerer<'a> {
    pub fn new(graph: &'a Graph, target: Target, names: &'a NameGenerator) -> Self {
        Self {
            graph,
            target,
            config: LoweringConfig::default(),
            names,
        }
    }

    pub fn with_config(mut self, config: LoweringConfig) -> Self {
        self.config = config;
        self
    }

    /// Lowers `group` into exactly one function.
    pub fn lower(&self, group: &FusionGroup) -> Result<Vec<LoweredFunc>> {
        let mut session = Session {
            group,
            name: group.name(self.graph),
            state: LoweringState::Unlowered,
            tensors: IndexMap::new(),
            stages: Vec::with_capacity(group.nodes.len()),
        };
        self.emit_compute(&mut session)?;
        let sch = self.schedule(&mut session)?;
        let func = self.finalize(&mut session, sch)?;
        Ok(vec![func])
    }

    fn emit_compute(&self, session: &mut Session<'_>) -> Result<()> {
        let graph = self.graph;
        for input in &session.group.external_inputs {
            let tensor = Tensor::placeholder(input.clone(), graph.shape(input)?.to_vec(), graph.dtype(input)?);
            session.tensors.insert(input.clone(), tensor);
        }

        for &id in &session.group.nodes {
            let node = graph.node(id);
            let def = graph.op_def(id)?;
            let inputs = node
                .inputs
                .iter()
                .map(|t| {
                    session
                        .tensors
                        .get(t)
                        .cloned()
                        .ok_or(CompileError::DisconnectedGroup(session.group.id.0))
                })
                .collect::<Result<Vec<Tensor>>>()?;
            let output_name = node.output();
            let output_shape = graph.shape(output_name)?;
            let ctx = ComputeContext {
                node,
                inputs: &inputs,
                output_name,
                output_shape,
                output_dtype: graph.dtype(output_name)?,
                target: &self.target,
                names: self.names,
            };
            let mut output = def.strategy.compute(&ctx).map_err(|source| CompileError::Strategy {
                node: node.name.clone(),
                source,
            })?;

            match output.tensors.last() {
                Some(last) if last.name == output_name => {}
                _ => {
                    return Err(CompileError::Unsupported {
                        stage: "compute",
                        detail: format!("`{}` did not emit its output `{output_name}` last", node.name),
                    })
                }
            }
            if node.is_reduce() && output.reduce.is_none() {
                let with_last_dim = self.reduces_last_dim(id)?;
                output.reduce = Some(ReduceStages::from_stage_tensors(with_last_dim, &output.tensors)?);
            }
            if let Some(stages) = &output.reduce {
                debug!("{}: {stages}", node.name);
            }
            if session.group.is_output_node(id) {
                if let Some(last) = output.tensors.last_mut() {
                    last.role = StageRole::Output;
                }
            }
            for tensor in output.tensors {
                session.tensors.insert(tensor.name.clone(), tensor);
            }
            session.stages.push(NodeStages {
                node: id,
                reduce: output.reduce,
            });
        }
        session.advance(LoweringState::ComputeEmitted);
        Ok(())
    }

    fn reduces_last_dim(&self, id: NodeId) -> Result<bool> {
        let node = self.graph.node(id);
        let input = node.inputs.first().map(String::as_str).unwrap_or_default();
        let shape = self.graph.shape(input)?;
        let attrs = ReduceAttrs::from_attrs(&node.attrs, shape.len()).map_err(|source| CompileError::Strategy {
            node: node.name.clone(),
            source,
        })?;
        Ok(!without_last_dim_in_reduce(shape, &attrs.axes))
    }

    fn schedule(&self, session: &mut Session<'_>) -> Result<IrSchedule> {
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors(session.tensors.values()));
        sch.merge_exprs();
        for tensor in session.tensors.values() {
            if !tensor.is_placeholder() {
                sch.set_buffer(&tensor.name, tensor.scope);
            }
        }

        if self.config.inline_intermediates {
            for tensor in session.tensors.values() {
                let inlinable = !tensor.is_placeholder()
                    && !tensor.is_reduce()
                    && matches!(tensor.role, StageRole::Intermediate | StageRole::Reshape);
                if inlinable {
                    sch.compute_inline(&tensor.name)?;
                }
            }
        }

        let graph = self.graph;
        for stages in &session.stages {
            let node = graph.node(stages.node);
            let def = graph.op_def(stages.node)?;
            let output_name = node.output();
            let ctx = ScheduleContext {
                node,
                output_name,
                output_shape: graph.shape(output_name)?,
                reduce: stages.reduce.as_ref(),
                target: &self.target,
                config: &self.config,
            };
            def.strategy.schedule(&mut sch, &ctx).map_err(|source| CompileError::Strategy {
                node: node.name.clone(),
                source,
            })?;
        }
        session.advance(LoweringState::Scheduled);
        Ok(sch)
    }

    fn finalize(&self, session: &mut Session<'_>, sch: IrSchedule) -> Result<LoweredFunc> {
        let graph = self.graph;
        let live: FxHashSet<String> = sch.block_names().into_iter().collect();
        let temp_buffers = session
            .tensors
            .values()
            .filter(|t| !t.is_placeholder() && t.role != StageRole::Output && live.contains(&t.name))
            .map(|t| TempBuffer {
                name: t.name.clone(),
                shape: t.shape.clone(),
                dtype: t.dtype,
                scope: sch.buffer_scope(&t.name),
            })
            .collect();

        let mut exprs = sch.into_module().into_exprs();
        if exprs.len() > 1 {
            return Err(ScheduleError::NotMerged(exprs.len()).into());
        }
        let body = exprs.pop().unwrap_or_default();

        let mut args = Vec::new();
        for input in &session.group.external_inputs {
            args.push(Argument {
                name: input.clone(),
                shape: graph.shape(input)?.to_vec(),
                dtype: graph.dtype(input)?,
                kind: ArgKind::Input,
            });
        }
        for &id in &session.group.output_nodes {
            let output = graph.node(id).output();
            args.push(Argument {
                name: output.to_string(),
                shape: graph.shape(output)?.to_vec(),
                dtype: graph.dtype(output)?,
                kind: ArgKind::Output,
            });
        }

        let func = LoweredFunc {
            name: session.name.clone(),
            args,
            temp_buffers,
            body,
            device_api: if self.target.is_gpu() {
                DeviceApi::Gpu
            } else {
                DeviceApi::Host
            },
        };
        session.advance(LoweringState::Finalized);
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::StrategyError;
    use crate::graph::{AttrMap, GraphBuilder, PatternKind};
    use crate::ir::{DType, ForKind, MemoryScope, ReduceOp};
    use crate::ops::{ComputeOutput, OpDef, OpRegistry, OpStrategy};
    use crate::opt::fusion::{finalize_groups, op_fusion};

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_elementwise_group_inlines_intermediates() {
        setup();
        let mut b = GraphBuilder::new("chain");
        let a = b.create_input(DType::F32, vec![4, 16], "A");
        let x = b.create_input(DType::F32, vec![16], "B");
        let c = b.elementwise_add(&a, &x);
        let d = b.exp(&c);
        b.relu(&d);
        let graph = b.build().unwrap();
        let groups = op_fusion(&graph).unwrap();
        assert_eq!(groups.len(), 1);

        let names = NameGenerator::new();
        let funcs = OpLowerer::new(&graph, Target::x86(), &names).lower(&groups[0]).unwrap();
        assert_eq!(funcs.len(), 1);
        let func = &funcs[0];
        assert_eq!(func.name, "fn_elementwise_add_0_exp_1_relu_2");
        assert_eq!(func.block_names(), vec!["var_2".to_string()]);
        assert!(func.temp_buffers.is_empty());
        assert_eq!(func.device_api, DeviceApi::Host);
        let kinds: Vec<ArgKind> = func.args.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ArgKind::Input, ArgKind::Input, ArgKind::Output]);
        assert!(func.loop_kinds().contains(&ForKind::Parallel));
        assert!(func.loop_kinds().contains(&ForKind::Vectorized(8)));
    }

    #[test]
    fn test_without_inlining_intermediates_become_temps() {
        setup();
        let mut b = GraphBuilder::new("no_inline");
        let a = b.create_input(DType::F32, vec![8], "A");
        let c = b.exp(&a);
        b.relu(&c);
        let graph = b.build().unwrap();
        let groups = op_fusion(&graph).unwrap();
        let names = NameGenerator::new();
        let config = LoweringConfig::builder().inline_intermediates(false).build();
        let funcs = OpLowerer::new(&graph, Target::x86(), &names)
            .with_config(config)
            .lower(&groups[0])
            .unwrap();
        assert_eq!(funcs[0].temp_buffers.len(), 1);
        assert_eq!(funcs[0].temp_buffers[0].name, c);
        assert_eq!(funcs[0].temp_buffers[0].scope, MemoryScope::Global);
    }

    struct FailingStrategy;

    impl OpStrategy for FailingStrategy {
        fn compute(&self, _ctx: &ComputeContext<'_>) -> std::result::Result<ComputeOutput, StrategyError> {
            Err(StrategyError::Other("not implemented".to_string()))
        }

        fn schedule(&self, _sch: &mut IrSchedule, _ctx: &ScheduleContext<'_>) -> std::result::Result<(), StrategyError> {
            Ok(())
        }
    }

    /// Emits `count` copies of its input, the last one named as the output.
    struct StagedReduce {
        count: usize,
    }

    impl OpStrategy for StagedReduce {
        fn compute(&self, ctx: &ComputeContext<'_>) -> std::result::Result<ComputeOutput, StrategyError> {
            let x = ctx.input(0)?;
            let mut tensors = Vec::new();
            for i in 0..self.count {
                let name = if i + 1 == self.count {
                    ctx.output_name.to_string()
                } else {
                    ctx.stage_name("stage")
                };
                tensors.push(Tensor::reduce(name, ctx.output_shape.to_vec(), ctx.output_dtype, ReduceOp::Sum, vec![x.shape[1]], |o, r| {
                    x.load(vec![o[0].clone(), r[0].clone()])
                }));
            }
            Ok(ComputeOutput { tensors, reduce: None })
        }

        fn schedule(&self, _sch: &mut IrSchedule, _ctx: &ScheduleContext<'_>) -> std::result::Result<(), StrategyError> {
            Ok(())
        }
    }

    fn custom_graph(op: OpDef) -> Graph {
        let mut registry = OpRegistry::with_builtin_ops();
        let name = op.name.clone();
        registry.register(op);
        let mut b = GraphBuilder::with_registry("custom", Arc::new(registry));
        let a = b.create_input(DType::F32, vec![4, 8], "A");
        b.op(&name, &[&a], AttrMap::new().with("dim", vec![1_i64]));
        b.build().unwrap()
    }

    fn reduce_def(name: &str, strategy: Arc<dyn OpStrategy>) -> OpDef {
        OpDef::builder()
            .name(name)
            .pattern(PatternKind::Reduce)
            .num_inputs(1)
            .infer_shape(|inputs, _| Ok(vec![vec![inputs[0][0]]]))
            .strategy(strategy)
            .build()
    }

    #[test]
    fn test_strategy_failure_names_node() {
        setup();
        let graph = custom_graph(reduce_def("broken", Arc::new(FailingStrategy)));
        let groups = finalize_groups(&graph, vec![vec![NodeId(0)]]).unwrap();
        let names = NameGenerator::new();
        let err = OpLowerer::new(&graph, Target::nvgpu(), &names)
            .lower(&groups[0])
            .unwrap_err();
        match err {
            CompileError::Strategy { node, source } => {
                assert_eq!(node, "broken_0");
                assert!(matches!(source, StrategyError::Other(_)));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_stage_count_classification() {
        setup();
        let graph = custom_graph(reduce_def("two_stage", Arc::new(StagedReduce { count: 2 })));
        let groups = finalize_groups(&graph, vec![vec![NodeId(0)]]).unwrap();
        let names = NameGenerator::new();
        let lowerer = OpLowerer::new(&graph, Target::nvgpu(), &names);
        assert!(lowerer.lower(&groups[0]).is_ok());

        let graph = custom_graph(reduce_def("five_stage", Arc::new(StagedReduce { count: 5 })));
        let groups = finalize_groups(&graph, vec![vec![NodeId(0)]]).unwrap();
        let lowerer = OpLowerer::new(&graph, Target::nvgpu(), &names);
        assert!(matches!(
            lowerer.lower(&groups[0]),
            Err(CompileError::UnsupportedStageCount {
                count: 5,
                with_last_dim: true
            })
        ));
    }

    #[test]
    fn test_reduce_with_keep_dim_on_gpu() {
        setup();
        let mut b = GraphBuilder::new("keep_dim");
        let a = b.create_input(DType::F32, vec![32, 256], "A");
        b.reduce(&a, ReduceOp::Max, &[1], true);
        let graph = b.build().unwrap();
        let groups = op_fusion(&graph).unwrap();
        let names = NameGenerator::new();
        let funcs = OpLowerer::new(&graph, Target::nvgpu(), &names).lower(&groups[0]).unwrap();
        let func = &funcs[0];
        assert_eq!(func.device_api, DeviceApi::Gpu);
        assert_eq!(func.temp_bytes(MemoryScope::Local), 32 * 256 * 4);
        assert!(func.loop_kinds().iter().any(|k| k.is_gpu_bound()));
    }
}
