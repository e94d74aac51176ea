//! Operator registry and the per-operator compute/schedule strategies.
//!
//! Every operator is described once by an [`OpDef`]: its fusion pattern,
//! shape and dtype inference, and an [`OpStrategy`] that emits tensor stages
//! and schedules them.

mod broadcast;
mod elementwise;
mod matmul;
pub mod reduction;
pub mod schedule;
mod transform;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use typed_builder::TypedBuilder;

use crate::error::StrategyError;
use crate::graph::{AttrMap, Node, PatternKind};
use crate::ir::{DType, IrSchedule, Tensor};
use crate::lowerer::LoweringConfig;
use crate::naming::NameGenerator;
use crate::target::Target;

pub use broadcast::BroadcastToStrategy;
pub use elementwise::{BinaryStrategy, ClipStrategy, UnaryStrategy};
pub use matmul::MatmulStrategy;
pub use reduction::{ReducePlan, ReduceStages, ReduceStrategy};
pub use transform::{ReshapeStrategy, TransposeStrategy};

pub type InferShapeFn = fn(&[Vec<usize>], &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError>;
pub type InferDtypeFn = fn(&[DType], &AttrMap) -> Result<Vec<DType>, StrategyError>;

/// Inputs available to [`OpStrategy::compute`].
pub struct ComputeContext<'a> {
    pub node: &'a Node,
    /// One tensor per node input, in input order.
    pub inputs: &'a [Tensor],
    pub output_name: &'a str,
    pub output_shape: &'a [usize],
    pub output_dtype: DType,
    pub target: &'a Target,
    pub names: &'a NameGenerator,
}

impl ComputeContext<'_> {
    pub fn input(&self, i: usize) -> Result<&Tensor, StrategyError> {
        self.inputs.get(i).ok_or(StrategyError::Arity {
            expected: i + 1,
            actual: self.inputs.len(),
        })
    }

    pub fn expect_inputs(&self, expected: usize) -> Result<(), StrategyError> {
        if self.inputs.len() != expected {
            return Err(StrategyError::Arity {
                expected,
                actual: self.inputs.len(),
            });
        }
        Ok(())
    }

    /// Fresh name for a staging tensor derived from the node output.
    pub fn stage_name(&self, stage: &str) -> String {
        self.names.fresh(&format!("{}_{stage}", self.output_name))
    }
}

/// Result of [`OpStrategy::compute`]: the stages in emission order, the
/// last one being the node output.
#[derive(Debug, Clone)]
pub struct ComputeOutput {
    pub tensors: Vec<Tensor>,
    pub reduce: Option<ReduceStages>,
}

impl ComputeOutput {
    pub fn single(tensor: Tensor) -> Self {
        Self {
            tensors: vec![tensor],
            reduce: None,
        }
    }
}

/// Inputs available to [`OpStrategy::schedule`].
pub struct ScheduleContext<'a> {
    pub node: &'a Node,
    pub output_name: &'a str,
    pub output_shape: &'a [usize],
    pub reduce: Option<&'a ReduceStages>,
    pub target: &'a Target,
    pub config: &'a LoweringConfig,
}

/// Per-operator lowering behaviour.
pub trait OpStrategy: Send + Sync {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError>;

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError>;
}

fn same_dtype_as_first(inputs: &[DType], _attrs: &AttrMap) -> Result<Vec<DType>, StrategyError> {
    Ok(vec![inputs.first().copied().unwrap_or_default()])
}

#[derive(Clone, TypedBuilder)]
pub struct OpDef {
    #[builder(setter(into))]
    pub name: String,
    pub pattern: PatternKind,
    /// `None` for variadic operators.
    #[builder(default, setter(strip_option))]
    pub num_inputs: Option<usize>,
    pub infer_shape: InferShapeFn,
    #[builder(default = same_dtype_as_first as InferDtypeFn)]
    pub infer_dtype: InferDtypeFn,
    pub strategy: Arc<dyn OpStrategy>,
}

impl fmt::Debug for OpDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDef")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("num_inputs", &self.num_inputs)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: FxHashMap<String, OpDef>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operator.
    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::new();
        elementwise::register(&mut registry);
        broadcast::register(&mut registry);
        transform::register(&mut registry);
        reduction::register(&mut registry);
        matmul::register(&mut registry);
        registry
    }

    /// Adds or replaces an operator.
    pub fn register(&mut self, def: OpDef) {
        self.ops.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&OpDef> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Numpy-style check that `from` can be broadcast to `to`.
pub fn broadcastable(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    from.iter()
        .rev()
        .zip(to.iter().rev())
        .all(|(&f, &t)| f == t || f == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[128], &[128, 128], true)]
    #[case(&[1, 128], &[64, 128], true)]
    #[case(&[64, 1], &[64, 128], true)]
    #[case(&[128, 128], &[128], false)]
    #[case(&[64], &[64, 128], false)]
    fn test_broadcastable(#[case] from: &[usize], #[case] to: &[usize], #[case] expected: bool) {
        assert_eq!(broadcastable(from, to), expected);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = OpRegistry::with_builtin_ops();
        for (op, pattern) in [
            ("elementwise_add", PatternKind::ElementWise),
            ("clip", PatternKind::ElementWise),
            ("broadcast_to", PatternKind::Broadcast),
            ("reshape", PatternKind::Injective),
            ("transpose", PatternKind::Injective),
            ("reduce_sum", PatternKind::Reduce),
            ("reduce_min", PatternKind::Reduce),
            ("matmul", PatternKind::Opaque),
        ] {
            let def = registry.get(op).unwrap_or_else(|| panic!("{op} missing"));
            assert_eq!(def.pattern, pattern, "{op}");
        }
        assert!(!registry.contains("conv2d"));
    }
}
