use std::sync::Arc;

use super::schedule::schedule_injective;
use super::{ComputeContext, ComputeOutput, OpDef, OpRegistry, OpStrategy, ScheduleContext};
use crate::error::StrategyError;
use crate::graph::{AttrMap, PatternKind};
use crate::ir::expr::{exp, idx, max, min, neg, sqrt};
use crate::ir::{Expr, IrSchedule, Literal, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryKind {
    fn apply(&self, a: Expr, b: Expr) -> Expr {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
            BinaryKind::Max => max(a, b),
            BinaryKind::Min => min(a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Relu,
    Exp,
    Sqrt,
    Neg,
    Identity,
}

/// Result shape of broadcasting `a` against `b`, aligned on the right.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Index into a tensor of `shape` broadcast to the output indices `out`.
pub fn broadcast_index(shape: &[usize], out_shape: &[usize], out: &[Expr]) -> Vec<Expr> {
    let offset = out_shape.len() - shape.len();
    shape
        .iter()
        .enumerate()
        .map(|(j, &d)| {
            if d == 1 && out_shape[j + offset] != 1 {
                idx(0)
            } else {
                out[j + offset].clone()
            }
        })
        .collect()
}

fn infer_binary_shape(inputs: &[Vec<usize>], _attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [a, b] = inputs else {
        return Err(StrategyError::Arity {
            expected: 2,
            actual: inputs.len(),
        });
    };
    broadcast_shapes(a, b)
        .map(|s| vec![s])
        .ok_or_else(|| StrategyError::Shape(format!("cannot broadcast {a:?} with {b:?}")))
}

fn infer_unary_shape(inputs: &[Vec<usize>], _attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    match inputs {
        [x] => Ok(vec![x.clone()]),
        _ => Err(StrategyError::Arity {
            expected: 1,
            actual: inputs.len(),
        }),
    }
}

pub struct BinaryStrategy {
    pub kind: BinaryKind,
}

impl OpStrategy for BinaryStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(2)?;
        let (a, b) = (ctx.input(0)?, ctx.input(1)?);
        let out_shape = ctx.output_shape.to_vec();
        let out = Tensor::compute(ctx.output_name, out_shape.clone(), ctx.output_dtype, |o| {
            let lhs = a.load(broadcast_index(&a.shape, &out_shape, o));
            let rhs = b.load(broadcast_index(&b.shape, &out_shape, o));
            self.kind.apply(lhs, rhs)
        });
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        schedule_injective(sch, ctx.output_name, ctx.target, ctx.config)?;
        Ok(())
    }
}

pub struct UnaryStrategy {
    pub kind: UnaryKind,
}

impl OpStrategy for UnaryStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let dtype = ctx.output_dtype;
        let out = Tensor::compute(ctx.output_name, ctx.output_shape.to_vec(), dtype, |o| {
            let v = x.load(o.to_vec());
            match self.kind {
                UnaryKind::Relu => max(v, Expr::Const(Literal::from_f64(0.0, dtype))),
                UnaryKind::Exp => exp(v),
                UnaryKind::Sqrt => sqrt(v),
                UnaryKind::Neg => neg(v),
                UnaryKind::Identity => v,
            }
        });
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        schedule_injective(sch, ctx.output_name, ctx.target, ctx.config)?;
        Ok(())
    }
}

/// `max(min(x, max_val), min_val)`.
pub struct ClipStrategy;

impl OpStrategy for ClipStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let attrs = &ctx.node.attrs;
        let max_val = attrs.float("max_val")?;
        let min_val = attrs.float("min_val")?;
        if min_val > max_val {
            return Err(StrategyError::InvalidAttr {
                name: "min_val".to_string(),
                detail: format!("{min_val} exceeds max_val {max_val}"),
            });
        }
        let dtype = ctx.output_dtype;
        let out = Tensor::compute(ctx.output_name, ctx.output_shape.to_vec(), dtype, |o| {
            let hi = Expr::Const(Literal::from_f64(max_val as f64, dtype));
            let lo = Expr::Const(Literal::from_f64(min_val as f64, dtype));
            max(min(x.load(o.to_vec()), hi), lo)
        });
        Ok(ComputeOutput::single(out))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        schedule_injective(sch, ctx.output_name, ctx.target, ctx.config)?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    for (name, kind) in [
        ("elementwise_add", BinaryKind::Add),
        ("elementwise_sub", BinaryKind::Sub),
        ("elementwise_mul", BinaryKind::Mul),
        ("elementwise_div", BinaryKind::Div),
        ("max", BinaryKind::Max),
        ("min", BinaryKind::Min),
    ] {
        registry.register(
            OpDef::builder()
                .name(name)
                .pattern(PatternKind::ElementWise)
                .num_inputs(2)
                .infer_shape(infer_binary_shape)
                .strategy(Arc::new(BinaryStrategy { kind }))
                .build(),
        );
    }
    for (name, kind) in [
        ("relu", UnaryKind::Relu),
        ("exp", UnaryKind::Exp),
        ("sqrt", UnaryKind::Sqrt),
        ("neg", UnaryKind::Neg),
        ("identity", UnaryKind::Identity),
    ] {
        registry.register(
            OpDef::builder()
                .name(name)
                .pattern(PatternKind::ElementWise)
                .num_inputs(1)
                .infer_shape(infer_unary_shape)
                .strategy(Arc::new(UnaryStrategy { kind }))
                .build(),
        );
    }
    registry.register(
        OpDef::builder()
            .name("clip")
            .pattern(PatternKind::ElementWise)
            .num_inputs(1)
            .infer_shape(infer_unary_shape)
            .strategy(Arc::new(ClipStrategy))
            .build(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[4, 8], &[4, 8], Some(vec![4, 8]))]
    #[case(&[8], &[4, 8], Some(vec![4, 8]))]
    #[case(&[4, 1], &[1, 8], Some(vec![4, 8]))]
    #[case(&[4, 3], &[4, 8], None)]
    fn test_broadcast_shapes(#[case] a: &[usize], #[case] b: &[usize], #[case] expected: Option<Vec<usize>>) {
        assert_eq!(broadcast_shapes(a, b), expected);
    }

    #[test]
    fn test_broadcast_index_pins_unit_dims() {
        use crate::ir::expr::var;
        let out = vec![var("i"), var("j")];
        assert_eq!(broadcast_index(&[4, 1], &[4, 8], &out), vec![var("i"), idx(0)]);
        assert_eq!(broadcast_index(&[8], &[4, 8], &out), vec![var("j")]);
    }

    #[test]
    fn test_infer_binary_shape_error() {
        let err = infer_binary_shape(&[vec![4, 3], vec![4, 8]], &AttrMap::new()).unwrap_err();
        assert!(matches!(err, StrategyError::Shape(_)));
    }
}
