//! Injective re-indexing operators.

use std::sync::Arc;

use super::schedule::schedule_injective;
use super::{ComputeContext, ComputeOutput, OpDef, OpRegistry, OpStrategy, ScheduleContext};
use crate::error::StrategyError;
use crate::graph::{AttrMap, PatternKind};
use crate::ir::expr::{flatten, idx, unflatten};
use crate::ir::{IrSchedule, Tensor};

/// Resolves a reshape target, allowing a single `-1` wildcard.
fn reshape_target(input: &[usize], attrs: &AttrMap) -> Result<Vec<usize>, StrategyError> {
    let shape = attrs.ints("shape")?;
    let numel: usize = input.iter().product();
    let known: usize = shape.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
    let wildcards = shape.iter().filter(|&&d| d == -1).count();
    let invalid = |detail: String| StrategyError::InvalidAttr {
        name: "shape".to_string(),
        detail,
    };
    if wildcards > 1 || shape.iter().any(|&d| d == 0 || d < -1) {
        return Err(invalid(format!("malformed target {shape:?}")));
    }
    let out: Vec<usize> = shape
        .iter()
        .map(|&d| if d == -1 { numel / known.max(1) } else { d as usize })
        .collect();
    if out.iter().product::<usize>() != numel {
        return Err(invalid(format!("{input:?} has {numel} elements, target {shape:?}")));
    }
    Ok(out)
}

fn transpose_perm(rank: usize, attrs: &AttrMap) -> Result<Vec<usize>, StrategyError> {
    let perm: Vec<usize> = match attrs.get("axis") {
        Some(_) => attrs
            .ints("axis")?
            .into_iter()
            .map(|a| if a < 0 { (a + rank as i64) as usize } else { a as usize })
            .collect(),
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    for &p in &perm {
        if p >= rank || std::mem::replace(&mut seen[p], true) {
            return Err(StrategyError::InvalidAttr {
                name: "axis".to_string(),
                detail: format!("{perm:?} is not a permutation of rank {rank}"),
            });
        }
    }
    if perm.len() != rank {
        return Err(StrategyError::InvalidAttr {
            name: "axis".to_string(),
            detail: format!("{perm:?} is not a permutation of rank {rank}"),
        });
    }
    Ok(perm)
}

fn infer_reshape_shape(inputs: &[Vec<usize>], attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [x] = inputs else {
        return Err(StrategyError::Arity {
            expected: 1,
            actual: inputs.len(),
        });
    };
    Ok(vec![reshape_target(x, attrs)?])
}

fn infer_transpose_shape(inputs: &[Vec<usize>], attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [x] = inputs else {
        return Err(StrategyError::Arity {
            expected: 1,
            actual: inputs.len(),
        });
    };
    let perm = transpose_perm(x.len(), attrs)?;
    Ok(vec![perm.iter().map(|&p| x[p]).collect()])
}

pub struct ReshapeStrategy;

impl OpStrategy for ReshapeStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let out_shape = reshape_target(&x.shape, &ctx.node.attrs)?;
        let out = Tensor::compute(ctx.output_name, out_shape.clone(), ctx.output_dtype, |o| {
            let flat = flatten(o, &out_shape);
            x.load(unflatten(flat, &x.shape))
        });
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        schedule_injective(sch, ctx.output_name, ctx.target, ctx.config)?;
        Ok(())
    }
}

pub struct TransposeStrategy;

impl OpStrategy for TransposeStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let perm = transpose_perm(x.shape.len(), &ctx.node.attrs)?;
        let out_shape: Vec<usize> = perm.iter().map(|&p| x.shape[p]).collect();
        let out = Tensor::compute(ctx.output_name, out_shape, ctx.output_dtype, |o| {
            let mut indices = vec![idx(0); perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                indices[p] = o[i].clone();
            }
            x.load(indices)
        });
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        schedule_injective(sch, ctx.output_name, ctx.target, ctx.config)?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(
        OpDef::builder()
            .name("reshape")
            .pattern(PatternKind::Injective)
            .num_inputs(1)
            .infer_shape(infer_reshape_shape)
            .strategy(Arc::new(ReshapeStrategy))
            .build(),
    );
    registry.register(
        OpDef::builder()
            .name("transpose")
            .pattern(PatternKind::Injective)
            .num_inputs(1)
            .infer_shape(infer_transpose_shape)
            .strategy(Arc::new(TransposeStrategy))
            .build(),
    );
}
