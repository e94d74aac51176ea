use std::sync::Arc;

use super::schedule::schedule_injective;
use super::{ComputeContext, ComputeOutput, OpDef, OpRegistry, OpStrategy, ScheduleContext};
use crate::error::StrategyError;
use crate::graph::{AttrMap, PatternKind};
use crate::ir::expr::idx;
use crate::ir::{IrSchedule, Tensor};

fn to_usize(values: &[i64], name: &str) -> Result<Vec<usize>, StrategyError> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| StrategyError::InvalidAttr {
                name: name.to_string(),
                detail: format!("negative value {v}"),
            })
        })
        .collect()
}

/// Output axis each input axis maps to: `broadcast_axes` when given,
/// right-aligned otherwise.
fn broadcast_axes(input: &[usize], attrs: &AttrMap) -> Result<(Vec<usize>, Vec<usize>), StrategyError> {
    let out_shape = to_usize(&attrs.ints("out_shape")?, "out_shape")?;
    let axes = match attrs.get("broadcast_axes") {
        Some(_) => to_usize(&attrs.ints("broadcast_axes")?, "broadcast_axes")?,
        None => {
            if input.len() > out_shape.len() {
                return Err(StrategyError::Shape(format!(
                    "cannot broadcast {input:?} to {out_shape:?}"
                )));
            }
            let offset = out_shape.len() - input.len();
            (0..input.len()).map(|i| i + offset).collect()
        }
    };
    if axes.len() != input.len() {
        return Err(StrategyError::InvalidAttr {
            name: "broadcast_axes".to_string(),
            detail: format!("expected {} axes, got {}", input.len(), axes.len()),
        });
    }
    for (&d, &axis) in input.iter().zip(&axes) {
        let target = out_shape.get(axis).copied().ok_or_else(|| StrategyError::InvalidAttr {
            name: "broadcast_axes".to_string(),
            detail: format!("axis {axis} out of range"),
        })?;
        if d != 1 && d != target {
            return Err(StrategyError::Shape(format!(
                "cannot broadcast {input:?} to {out_shape:?}"
            )));
        }
    }
    Ok((out_shape, axes))
}

fn infer_broadcast_shape(inputs: &[Vec<usize>], attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [x] = inputs else {
        return Err(StrategyError::Arity {
            expected: 1,
            actual: inputs.len(),
        });
    };
    let (out_shape, _) = broadcast_axes(x, attrs)?;
    Ok(vec![out_shape])
}

pub struct BroadcastToStrategy;

impl OpStrategy for BroadcastToStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let (out_shape, axes) = broadcast_axes(&x.shape, &ctx.node.attrs)?;
        let out = Tensor::compute(ctx.output_name, out_shape.clone(), ctx.output_dtype, |o| {
            let indices = x
                .shape
                .iter()
                .zip(&axes)
                .map(|(&d, &axis)| {
                    if d == 1 && out_shape[axis] != 1 {
                        idx(0)
                    } else {
                        o[axis].clone()
                    }
                })
                .collect();
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
            .name("broadcast_to")
            .pattern(PatternKind::Broadcast)
            .num_inputs(1)
            .infer_shape(infer_broadcast_shape)
            .strategy(Arc::new(BroadcastToStrategy))
            .build(),
    );
}
