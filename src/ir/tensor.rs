//! Tensor stage definitions and their loop-nest form.

use std::fmt;

use super::expr::{load, max, min, var, Expr, Literal};
use super::stmt::{for_loop, store, Stmt};
use super::DType;

/// Commutative combiner of a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
}

impl ReduceOp {
    /// Identity element for `dtype`.
    pub fn identity(&self, dtype: DType) -> Expr {
        let value = match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Prod => 1.0,
            ReduceOp::Max => match dtype {
                DType::F32 => f32::MIN as f64,
                DType::F64 => f64::MIN,
                DType::I32 => i32::MIN as f64,
                DType::I64 => i64::MIN as f64,
                DType::Bool => 0.0,
            },
            ReduceOp::Min => match dtype {
                DType::F32 => f32::MAX as f64,
                DType::F64 => f64::MAX,
                DType::I32 => i32::MAX as f64,
                DType::I64 => i64::MAX as f64,
                DType::Bool => 1.0,
            },
        };
        Expr::Const(Literal::from_f64(value, dtype))
    }

    pub fn combine(&self, acc: Expr, value: Expr) -> Expr {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Prod => acc * value,
            ReduceOp::Max => max(acc, value),
            ReduceOp::Min => min(acc, value),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }
}

/// Memory space a buffer lives in after scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryScope {
    #[default]
    Global,
    Shared,
    Local,
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryScope::Global => "global",
            MemoryScope::Shared => "shared",
            MemoryScope::Local => "local",
        })
    }
}

/// Part a tensor plays inside a lowered group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StageRole {
    /// Result of a graph node that leaves the group.
    Output,
    /// Result of a graph node consumed only inside the group.
    #[default]
    Intermediate,
    /// Re-indexed view of a reduction input.
    Reshape,
    /// Per-thread partial reduction.
    Partial,
    /// Result of a cross-thread reduction within a block.
    BlockInternal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    Placeholder,
    Compute {
        body: Expr,
    },
    Reduce {
        reduce_extents: Vec<usize>,
        combiner: ReduceOp,
        body: Expr,
    },
}

/// A named tensor stage. Axis variables are `{name}_i{k}` and reduction
/// variables `{name}_r{k}`, so every loop in a lowered module has a distinct
/// name.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub op: TensorOp,
    pub scope: MemoryScope,
    pub role: StageRole,
}

impl Tensor {
    pub fn placeholder(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            op: TensorOp::Placeholder,
            scope: MemoryScope::Global,
            role: StageRole::Intermediate,
        }
    }

    /// Element-wise definition: `f` receives one index expression per axis.
    pub fn compute(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        f: impl FnOnce(&[Expr]) -> Expr,
    ) -> Self {
        let name = name.into();
        let axes = axis_vars(&name, shape.len());
        let body = f(&axes);
        Self {
            name,
            shape,
            dtype,
            op: TensorOp::Compute { body },
            scope: MemoryScope::Global,
            role: StageRole::Intermediate,
        }
    }

    /// Reduction over `reduce_extents`: `f` receives the output axes and the
    /// reduction variables.
    pub fn reduce(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        combiner: ReduceOp,
        reduce_extents: Vec<usize>,
        f: impl FnOnce(&[Expr], &[Expr]) -> Expr,
    ) -> Self {
        let name = name.into();
        let axes = axis_vars(&name, shape.len());
        let rvars: Vec<Expr> = (0..reduce_extents.len())
            .map(|k| var(format!("{name}_r{k}")))
            .collect();
        let body = f(&axes, &rvars);
        Self {
            name,
            shape,
            dtype,
            op: TensorOp::Reduce {
                reduce_extents,
                combiner,
                body,
            },
            scope: MemoryScope::Global,
            role: StageRole::Intermediate,
        }
    }

    pub fn with_role(mut self, role: StageRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_scope(mut self, scope: MemoryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn load(&self, indices: Vec<Expr>) -> Expr {
        load(self.name.clone(), indices)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.op, TensorOp::Placeholder)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self.op, TensorOp::Reduce { .. })
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Names of the tensors this stage reads.
    pub fn inputs(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let body = match &self.op {
            TensorOp::Placeholder => return names,
            TensorOp::Compute { body } | TensorOp::Reduce { body, .. } => body,
        };
        body.for_each_load(&mut |t, _| {
            if !names.iter().any(|n| n == t) {
                names.push(t.to_string());
            }
        });
        names
    }

    /// Lowers the stage into a serial loop nest wrapped in a schedule block.
    ///
    /// Returns `None` for placeholders.
    pub fn to_stmt(&self) -> Option<Stmt> {
        let axes = axis_vars(&self.name, self.shape.len());
        let inner = match &self.op {
            TensorOp::Placeholder => return None,
            TensorOp::Compute { body } => vec![store(self.name.clone(), axes.clone(), body.clone())],
            TensorOp::Reduce {
                reduce_extents,
                combiner,
                body,
            } => {
                let init = store(self.name.clone(), axes.clone(), combiner.identity(self.dtype));
                let update = store(
                    self.name.clone(),
                    axes.clone(),
                    combiner.combine(load(self.name.clone(), axes.clone()), body.clone()),
                );
                let nest = reduce_extents
                    .iter()
                    .enumerate()
                    .rev()
                    .fold(update, |acc, (k, &extent)| {
                        for_loop(format!("{}_r{k}", self.name), extent, vec![acc])
                    });
                vec![init, nest]
            }
        };
        let body = self
            .shape
            .iter()
            .enumerate()
            .rev()
            .fold(inner, |acc, (k, &extent)| {
                vec![for_loop(format!("{}_i{k}", self.name), extent, acc)]
            });
        Some(Stmt::ScheduleBlock {
            name: self.name.clone(),
            body,
        })
    }
}

fn axis_vars(name: &str, rank: usize) -> Vec<Expr> {
    (0..rank).map(|k| var(format!("{name}_i{k}"))).collect()
}
