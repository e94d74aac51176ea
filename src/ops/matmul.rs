use std::sync::Arc;

use super::{ComputeContext, ComputeOutput, OpDef, OpRegistry, OpStrategy, ScheduleContext};
use crate::error::StrategyError;
use crate::graph::{AttrMap, PatternKind};
use crate::ir::{ForKind, GpuAxis, IrSchedule, ReduceOp, Tensor};

fn infer_matmul_shape(inputs: &[Vec<usize>], _attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [a, b] = inputs else {
        return Err(StrategyError::Arity {
            expected: 2,
            actual: inputs.len(),
        });
    };
    match (a.as_slice(), b.as_slice()) {
        ([m, k], [k2, n]) if k == k2 => Ok(vec![vec![*m, *n]]),
        _ => Err(StrategyError::Shape(format!("cannot multiply {a:?} by {b:?}"))),
    }
}

/// Plain `[m, k] x [k, n]` product. Never fused.
pub struct MatmulStrategy;

impl OpStrategy for MatmulStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(2)?;
        let (a, b) = (ctx.input(0)?, ctx.input(1)?);
        let k = *a.shape.last().ok_or_else(|| StrategyError::Shape("rank-0 matmul operand".to_string()))?;
        let out = Tensor::reduce(
            ctx.output_name,
            ctx.output_shape.to_vec(),
            ctx.output_dtype,
            ReduceOp::Sum,
            vec![k],
            |o, r| a.load(vec![o[0].clone(), r[0].clone()]) * b.load(vec![r[0].clone(), o[1].clone()]),
        );
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        let loops = sch.get_loops(ctx.output_name)?;
        let [m, n, ..] = loops.as_slice() else {
            return Ok(());
        };
        if ctx.target.is_gpu() {
            sch.bind(&m.var, ForKind::GpuBlock(GpuAxis::X))?;
            if n.extent <= ctx.target.max_threads_per_block {
                sch.bind(&n.var, ForKind::GpuThread(GpuAxis::X))?;
            } else {
                let (outer, inner) = sch.split(&n.var, ctx.target.max_threads_per_block)?;
                sch.bind(&outer, ForKind::GpuBlock(GpuAxis::Y))?;
                sch.bind(&inner, ForKind::GpuThread(GpuAxis::X))?;
            }
        } else {
            sch.bind(&m.var, ForKind::Parallel)?;
        }
        Ok(())
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(
        OpDef::builder()
            .name("matmul")
            .pattern(PatternKind::Opaque)
            .num_inputs(2)
            .infer_shape(infer_matmul_shape)
            .strategy(Arc::new(MatmulStrategy))
            .build(),
    );
}
