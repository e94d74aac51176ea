//! Reductions: axis normalization, the scheduling decision, and the staged
//! compute each schedule family expects.

use std::fmt;
use std::sync::Arc;

use log::debug;

use super::schedule::schedule_reduce;
use super::{ComputeContext, ComputeOutput, OpDef, OpRegistry, OpStrategy, ScheduleContext};
use crate::error::{CompileError, StrategyError};
use crate::graph::{AttrMap, PatternKind};
use crate::ir::expr::{flatten, idx, lt, select, unflatten};
use crate::ir::{Expr, IrSchedule, MemoryScope, ReduceOp, StageRole, Tensor};
use crate::target::Target;

/// Normalized `dim` / `keep_dim` attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceAttrs {
    /// Sorted, deduplicated, non-negative.
    pub axes: Vec<usize>,
    pub keep_dim: bool,
}

impl ReduceAttrs {
    /// Empty `dim` selects every axis.
    pub fn from_attrs(attrs: &AttrMap, rank: usize) -> Result<Self, StrategyError> {
        let dims = attrs.ints_or_empty("dim")?;
        let keep_dim = attrs.bool_or("keep_dim", false)?;
        let mut axes = Vec::with_capacity(dims.len());
        for d in dims {
            let a = if d < 0 { d + rank as i64 } else { d };
            if a < 0 || a as usize >= rank {
                return Err(StrategyError::InvalidAttr {
                    name: "dim".to_string(),
                    detail: format!("axis {d} out of range for rank {rank}"),
                });
            }
            axes.push(a as usize);
        }
        if axes.is_empty() {
            axes = (0..rank).collect();
        }
        axes.sort_unstable();
        axes.dedup();
        Ok(Self { axes, keep_dim })
    }
}

/// True when the reduction leaves a trailing extent greater than one, i.e.
/// neither the last axis nor anything after the last reduced axis but
/// size-one dimensions is reduced.
pub fn without_last_dim_in_reduce(shape: &[usize], axes: &[usize]) -> bool {
    let Some(&last) = axes.last() else {
        return false;
    };
    if last + 1 >= shape.len() {
        return false;
    }
    shape[last + 1..].iter().product::<usize>() > 1
}

pub fn reduce_out_shape(shape: &[usize], axes: &[usize], keep_dim: bool) -> Vec<usize> {
    let out: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dim) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    if out.is_empty() {
        vec![1]
    } else {
        out
    }
}

fn infer_reduce_shape(inputs: &[Vec<usize>], attrs: &AttrMap) -> Result<Vec<Vec<usize>>, StrategyError> {
    let [x] = inputs else {
        return Err(StrategyError::Arity {
            expected: 1,
            actual: inputs.len(),
        });
    };
    let ra = ReduceAttrs::from_attrs(attrs, x.len())?;
    Ok(vec![reduce_out_shape(x, &ra.axes, ra.keep_dim)])
}

/// Index bookkeeping shared by the reduction stages.
///
/// Reduced axes split into the *tail*, the run that together with size-one
/// dimensions ends the shape, and the *head*, every reduced axis before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceLayout {
    pub shape: Vec<usize>,
    pub axes: Vec<usize>,
    pub keep_dim: bool,
}

impl ReduceLayout {
    pub fn new(shape: Vec<usize>, attrs: ReduceAttrs) -> Self {
        Self {
            shape,
            axes: attrs.axes,
            keep_dim: attrs.keep_dim,
        }
    }

    pub fn with_last_dim(&self) -> bool {
        !without_last_dim_in_reduce(&self.shape, &self.axes)
    }

    pub fn out_shape(&self) -> Vec<usize> {
        reduce_out_shape(&self.shape, &self.axes, self.keep_dim)
    }

    pub fn kept(&self) -> Vec<usize> {
        (0..self.shape.len()).filter(|i| !self.axes.contains(i)).collect()
    }

    fn tail_start(&self) -> usize {
        let mut start = self.shape.len();
        while start > 0 && (self.axes.contains(&(start - 1)) || self.shape[start - 1] == 1) {
            start -= 1;
        }
        start
    }

    pub fn tail_axes(&self) -> Vec<usize> {
        let start = self.tail_start();
        self.axes.iter().copied().filter(|&a| a >= start).collect()
    }

    pub fn head_axes(&self) -> Vec<usize> {
        let start = self.tail_start();
        self.axes.iter().copied().filter(|&a| a < start).collect()
    }

    /// Kept axes before and after the last reduced axis.
    pub fn kept_around_last(&self) -> (Vec<usize>, Vec<usize>) {
        let last = self.axes.last().copied().unwrap_or(0);
        self.kept().into_iter().partition(|&p| p < last)
    }

    pub fn dims(&self, positions: &[usize]) -> Vec<usize> {
        positions.iter().map(|&p| self.shape[p]).collect()
    }

    pub fn extent(&self, positions: &[usize]) -> usize {
        positions.iter().map(|&p| self.shape[p]).product()
    }

    /// Product of the dimensions after the last reduced axis.
    pub fn trailing_extent(&self) -> usize {
        let (_, after) = self.kept_around_last();
        self.extent(&after)
    }

    /// Input index built from flat indices over groups of positions.
    pub fn assemble(&self, parts: &[(&[usize], Expr)]) -> Vec<Expr> {
        let mut index = vec![idx(0); self.shape.len()];
        for (positions, flat) in parts {
            for (&p, e) in positions.iter().zip(unflatten(flat.clone(), &self.dims(positions))) {
                index[p] = e;
            }
        }
        index
    }

    /// One index per kept axis, taken from an output index.
    pub fn kept_indices(&self, out: &[Expr]) -> Vec<Expr> {
        self.kept()
            .iter()
            .enumerate()
            .map(|(j, &p)| if self.keep_dim { out[p].clone() } else { out[j].clone() })
            .collect()
    }

    pub fn kept_flat(&self, out: &[Expr]) -> Expr {
        flatten(&self.kept_indices(out), &self.dims(&self.kept()))
    }

    /// Input index for an output index plus one variable per reduced axis.
    pub fn direct_index(&self, out: &[Expr], reduce_vars: &[Expr]) -> Vec<Expr> {
        let mut index = vec![idx(0); self.shape.len()];
        for (p, e) in self.kept().into_iter().zip(self.kept_indices(out)) {
            index[p] = e;
        }
        for (&p, e) in self.axes.iter().zip(reduce_vars) {
            index[p] = e.clone();
        }
        index
    }
}

fn largest_divisor_at_most(n: usize, limit: usize) -> usize {
    (1..=limit.min(n).max(1))
        .rev()
        .find(|k| n % k == 0)
        .unwrap_or(1)
}

/// Schedule family chosen for one reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducePlan {
    Simple,
    /// `k` rows of the reduced extent are reduced in shared memory, then
    /// shuffled into the output.
    BlockShuffle { k: usize },
    BlockInternal,
    Block,
    /// The tail is split into `k` thread slices; the tail is padded with the
    /// identity when `k` does not divide it.
    TwoStep { k: usize },
}

impl ReducePlan {
    pub fn choose(layout: &ReduceLayout, target: &Target) -> Self {
        if !target.is_gpu() {
            return ReducePlan::Simple;
        }
        let max_threads = target.max_threads_per_block;
        if !layout.with_last_dim() {
            let trailing = layout.trailing_extent();
            if trailing < target.warp_size {
                let reduced = layout.extent(&layout.axes);
                let k = largest_divisor_at_most(reduced, max_threads / trailing.max(1));
                if k > 1 {
                    return ReducePlan::BlockShuffle { k };
                }
            }
            return ReducePlan::Simple;
        }
        let tail = layout.extent(&layout.tail_axes());
        if tail <= max_threads {
            if layout.head_axes().is_empty() {
                ReducePlan::BlockInternal
            } else {
                ReducePlan::Block
            }
        } else {
            let k = largest_divisor_at_most(tail, max_threads);
            let k = if k >= target.warp_size { k } else { max_threads };
            ReducePlan::TwoStep { k }
        }
    }
}

/// Stage tensors of a lowered reduction, one variant per schedule family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceStages {
    SimpleReduce {
        out: String,
    },
    BlockShuffleReduce {
        reshape: String,
        internal: String,
        out: String,
    },
    BlockReduceInternal {
        tmp_out: String,
        out: String,
    },
    BlockReduce {
        reduce_tmp_out: String,
        tmp_out: String,
        out: String,
    },
    TwoStepBlockReduce {
        reshape: String,
        reduce_tmp_out: String,
        tmp_out: String,
        out: String,
    },
}

impl ReduceStages {
    /// Classifies stage tensors, in emission order, by their count.
    pub fn from_stage_tensors(with_last_dim: bool, tensors: &[Tensor]) -> Result<Self, CompileError> {
        let names: Vec<String> = tensors.iter().map(|t| t.name.clone()).collect();
        let stages = match (with_last_dim, names.as_slice()) {
            (_, [out]) => ReduceStages::SimpleReduce { out: out.clone() },
            (true, [tmp_out, out]) => ReduceStages::BlockReduceInternal {
                tmp_out: tmp_out.clone(),
                out: out.clone(),
            },
            (true, [reduce_tmp_out, tmp_out, out]) => ReduceStages::BlockReduce {
                reduce_tmp_out: reduce_tmp_out.clone(),
                tmp_out: tmp_out.clone(),
                out: out.clone(),
            },
            (true, [reshape, reduce_tmp_out, tmp_out, out]) => ReduceStages::TwoStepBlockReduce {
                reshape: reshape.clone(),
                reduce_tmp_out: reduce_tmp_out.clone(),
                tmp_out: tmp_out.clone(),
                out: out.clone(),
            },
            (false, [reshape, internal, out]) => ReduceStages::BlockShuffleReduce {
                reshape: reshape.clone(),
                internal: internal.clone(),
                out: out.clone(),
            },
            _ => {
                return Err(CompileError::UnsupportedStageCount {
                    count: tensors.len(),
                    with_last_dim,
                })
            }
        };
        Ok(stages)
    }

    pub fn out(&self) -> &str {
        match self {
            ReduceStages::SimpleReduce { out }
            | ReduceStages::BlockShuffleReduce { out, .. }
            | ReduceStages::BlockReduceInternal { out, .. }
            | ReduceStages::BlockReduce { out, .. }
            | ReduceStages::TwoStepBlockReduce { out, .. } => out,
        }
    }

    /// Stage tensor names in emission order.
    pub fn tensor_names(&self) -> Vec<&str> {
        match self {
            ReduceStages::SimpleReduce { out } => vec![out],
            ReduceStages::BlockShuffleReduce {
                reshape,
                internal,
                out,
            } => vec![reshape, internal, out],
            ReduceStages::BlockReduceInternal { tmp_out, out } => vec![tmp_out, out],
            ReduceStages::BlockReduce {
                reduce_tmp_out,
                tmp_out,
                out,
            } => vec![reduce_tmp_out, tmp_out, out],
            ReduceStages::TwoStepBlockReduce {
                reshape,
                reduce_tmp_out,
                tmp_out,
                out,
            } => vec![reshape, reduce_tmp_out, tmp_out, out],
        }
    }
}

impl fmt::Display for ReduceStages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceStages::SimpleReduce { .. } => "SimpleReduce",
            ReduceStages::BlockShuffleReduce { .. } => "BlockShuffleReduce",
            ReduceStages::BlockReduceInternal { .. } => "BlockReduceInternal",
            ReduceStages::BlockReduce { .. } => "BlockReduce",
            ReduceStages::TwoStepBlockReduce { .. } => "TwoStepBlockReduce",
        };
        write!(f, "{name}({})", self.tensor_names().join(", "))
    }
}

pub struct ReduceStrategy {
    pub op: ReduceOp,
}

impl ReduceStrategy {
    fn emit(&self, ctx: &ComputeContext<'_>, x: &Tensor, layout: &ReduceLayout, plan: ReducePlan) -> ComputeOutput {
        let op = self.op;
        let dtype = ctx.output_dtype;
        let out_shape = ctx.output_shape.to_vec();
        let kept = layout.kept();
        let kept_extent = layout.extent(&kept);

        match plan {
            ReducePlan::Simple => {
                let extents = layout.dims(&layout.axes);
                let out = Tensor::reduce(ctx.output_name, out_shape, dtype, op, extents, |o, r| {
                    x.load(layout.direct_index(o, r))
                });
                ComputeOutput {
                    reduce: Some(ReduceStages::SimpleReduce {
                        out: out.name.clone(),
                    }),
                    tensors: vec![out],
                }
            }
            ReducePlan::BlockShuffle { k } => {
                let (before, after) = layout.kept_around_last();
                let (pre, post) = (layout.extent(&before), layout.extent(&after));
                let rows = layout.extent(&layout.axes) / k;
                let reshape = Tensor::compute(ctx.stage_name("reshape"), vec![pre, rows, k, post], dtype, |ix| {
                    x.load(layout.assemble(&[
                        (before.as_slice(), ix[0].clone()),
                        (layout.axes.as_slice(), ix[1].clone() * idx(k) + ix[2].clone()),
                        (after.as_slice(), ix[3].clone()),
                    ]))
                })
                .with_role(StageRole::Reshape);
                let internal = Tensor::reduce(ctx.stage_name("internal"), vec![pre, k, post], dtype, op, vec![rows], |ix, r| {
                    reshape.load(vec![ix[0].clone(), r[0].clone(), ix[1].clone(), ix[2].clone()])
                })
                .with_role(StageRole::Partial)
                .with_scope(MemoryScope::Shared);
                let out = Tensor::reduce(ctx.output_name, out_shape, dtype, op, vec![k], |o, r| {
                    let kept_ix = layout.kept_indices(o);
                    let (p_ix, w_ix) = kept_ix.split_at(before.len());
                    internal.load(vec![
                        flatten(p_ix, &layout.dims(&before)),
                        r[0].clone(),
                        flatten(w_ix, &layout.dims(&after)),
                    ])
                });
                ComputeOutput {
                    reduce: Some(ReduceStages::BlockShuffleReduce {
                        reshape: reshape.name.clone(),
                        internal: internal.name.clone(),
                        out: out.name.clone(),
                    }),
                    tensors: vec![reshape, internal, out],
                }
            }
            ReducePlan::BlockInternal => {
                let tail = layout.tail_axes();
                let tail_extent = layout.extent(&tail);
                let tmp_out = Tensor::compute(ctx.stage_name("tmp_out"), vec![kept_extent, tail_extent], dtype, |ix| {
                    x.load(layout.assemble(&[(kept.as_slice(), ix[0].clone()), (tail.as_slice(), ix[1].clone())]))
                })
                .with_role(StageRole::Partial)
                .with_scope(MemoryScope::Local);
                let out = Tensor::reduce(ctx.output_name, out_shape, dtype, op, vec![tail_extent], |o, r| {
                    tmp_out.load(vec![layout.kept_flat(o), r[0].clone()])
                });
                ComputeOutput {
                    reduce: Some(ReduceStages::BlockReduceInternal {
                        tmp_out: tmp_out.name.clone(),
                        out: out.name.clone(),
                    }),
                    tensors: vec![tmp_out, out],
                }
            }
            ReducePlan::Block => {
                let (head, tail) = (layout.head_axes(), layout.tail_axes());
                let (head_extent, tail_extent) = (layout.extent(&head), layout.extent(&tail));
                let reduce_tmp_out = Tensor::reduce(
                    ctx.stage_name("reduce_tmp_out"),
                    vec![kept_extent, tail_extent],
                    dtype,
                    op,
                    vec![head_extent],
                    |ix, r| {
                        x.load(layout.assemble(&[
                            (kept.as_slice(), ix[0].clone()),
                            (head.as_slice(), r[0].clone()),
                            (tail.as_slice(), ix[1].clone()),
                        ]))
                    },
                )
                .with_role(StageRole::Partial)
                .with_scope(MemoryScope::Local);
                let tmp_out = Tensor::reduce(ctx.stage_name("tmp_out"), vec![kept_extent], dtype, op, vec![tail_extent], |ix, r| {
                    reduce_tmp_out.load(vec![ix[0].clone(), r[0].clone()])
                })
                .with_role(StageRole::BlockInternal)
                .with_scope(MemoryScope::Shared);
                let out = Tensor::compute(ctx.output_name, out_shape, dtype, |o| {
                    tmp_out.load(vec![layout.kept_flat(o)])
                });
                ComputeOutput {
                    reduce: Some(ReduceStages::BlockReduce {
                        reduce_tmp_out: reduce_tmp_out.name.clone(),
                        tmp_out: tmp_out.name.clone(),
                        out: out.name.clone(),
                    }),
                    tensors: vec![reduce_tmp_out, tmp_out, out],
                }
            }
            ReducePlan::TwoStep { k } => {
                let (head, tail) = (layout.head_axes(), layout.tail_axes());
                let (head_extent, tail_extent) = (layout.extent(&head), layout.extent(&tail));
                let rows = tail_extent.div_ceil(k);
                let padded = tail_extent % k != 0;
                let reshape = Tensor::compute(
                    ctx.stage_name("reshape"),
                    vec![kept_extent, head_extent, rows, k],
                    dtype,
                    |ix| {
                        let t = ix[2].clone() * idx(k) + ix[3].clone();
                        let value = x.load(layout.assemble(&[
                            (kept.as_slice(), ix[0].clone()),
                            (head.as_slice(), ix[1].clone()),
                            (tail.as_slice(), t.clone()),
                        ]));
                        if padded {
                            select(lt(t, idx(tail_extent)), value, op.identity(dtype))
                        } else {
                            value
                        }
                    },
                )
                .with_role(StageRole::Reshape);
                let reduce_tmp_out = Tensor::reduce(
                    ctx.stage_name("reduce_tmp_out"),
                    vec![kept_extent, k],
                    dtype,
                    op,
                    vec![head_extent, rows],
                    |ix, r| reshape.load(vec![ix[0].clone(), r[0].clone(), r[1].clone(), ix[1].clone()]),
                )
                .with_role(StageRole::Partial)
                .with_scope(MemoryScope::Local);
                let tmp_out = Tensor::reduce(ctx.stage_name("tmp_out"), vec![kept_extent], dtype, op, vec![k], |ix, r| {
                    reduce_tmp_out.load(vec![ix[0].clone(), r[0].clone()])
                })
                .with_role(StageRole::BlockInternal)
                .with_scope(MemoryScope::Shared);
                let out = Tensor::compute(ctx.output_name, out_shape, dtype, |o| {
                    tmp_out.load(vec![layout.kept_flat(o)])
                });
                ComputeOutput {
                    reduce: Some(ReduceStages::TwoStepBlockReduce {
                        reshape: reshape.name.clone(),
                        reduce_tmp_out: reduce_tmp_out.name.clone(),
                        tmp_out: tmp_out.name.clone(),
                        out: out.name.clone(),
                    }),
                    tensors: vec![reshape, reduce_tmp_out, tmp_out, out],
                }
            }
        }
    }
}

impl OpStrategy for ReduceStrategy {
    fn compute(&self, ctx: &ComputeContext<'_>) -> Result<ComputeOutput, StrategyError> {
        ctx.expect_inputs(1)?;
        let x = ctx.input(0)?;
        let attrs = ReduceAttrs::from_attrs(&ctx.node.attrs, x.shape.len())?;
        let layout = ReduceLayout::new(x.shape.clone(), attrs);
        if layout.out_shape() != ctx.output_shape {
            return Err(StrategyError::Shape(format!(
                "reduction of {:?} over {:?} does not yield {:?}",
                layout.shape, layout.axes, ctx.output_shape
            )));
        }
        let plan = ReducePlan::choose(&layout, ctx.target);
        debug!(
            "{}: reduce_{} {:?} over {:?} -> {plan:?}",
            ctx.node.name,
            self.op.name(),
            layout.shape,
            layout.axes
        );
        Ok(self.emit(ctx, x, &layout, plan))
    }

    fn schedule(&self, sch: &mut IrSchedule, ctx: &ScheduleContext<'_>) -> Result<(), StrategyError> {
        let stages = match ctx.reduce {
            Some(stages) => stages.clone(),
            None => ReduceStages::SimpleReduce {
                out: ctx.output_name.to_string(),
            },
        };
        schedule_reduce(sch, &stages, ctx.output_shape.len(), ctx.target)?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    for (name, op) in [
        ("reduce_sum", ReduceOp::Sum),
        ("reduce_prod", ReduceOp::Prod),
        ("reduce_max", ReduceOp::Max),
        ("reduce_min", ReduceOp::Min),
    ] {
        registry.register(
            OpDef::builder()
                .name(name)
                .pattern(PatternKind::Reduce)
                .num_inputs(1)
                .infer_shape(infer_reduce_shape)
                .strategy(Arc::new(ReduceStrategy { op }))
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::ir::DType;
    use crate::naming::NameGenerator;
    use rstest::rstest;

    fn layout(shape: &[usize], dim: &[i64]) -> ReduceLayout {
        let attrs = AttrMap::new().with("dim", dim.to_vec());
        ReduceLayout::new(shape.to_vec(), ReduceAttrs::from_attrs(&attrs, shape.len()).unwrap())
    }

    #[rstest]
    #[case(&[128, 128], &[0], true)]
    #[case(&[128, 128], &[1], false)]
    #[case(&[128, 1], &[0], false)]
    #[case(&[16, 8, 32], &[0, 1], true)]
    #[case(&[16, 8, 32], &[0, 2], false)]
    #[case(&[16, 8, 32], &[-1], false)]
    fn test_without_last_dim(#[case] shape: &[usize], #[case] dim: &[i64], #[case] expected: bool) {
        let l = layout(shape, dim);
        assert_eq!(without_last_dim_in_reduce(&l.shape, &l.axes), expected);
    }

    #[rstest]
    #[case(&[128, 128], &[0], false, vec![128])]
    #[case(&[128, 128], &[1], true, vec![128, 1])]
    #[case(&[4, 8], &[0, 1], false, vec![1])]
    #[case(&[4, 8, 2], &[], false, vec![1])]
    fn test_reduce_out_shape(
        #[case] shape: &[usize],
        #[case] dim: &[i64],
        #[case] keep_dim: bool,
        #[case] expected: Vec<usize>,
    ) {
        let attrs = AttrMap::new().with("dim", dim.to_vec()).with("keep_dim", keep_dim);
        assert_eq!(infer_reduce_shape(&[shape.to_vec()], &attrs).unwrap(), vec![expected]);
    }

    #[test]
    fn test_axis_out_of_range() {
        let attrs = AttrMap::new().with("dim", vec![2_i64]);
        assert!(matches!(
            ReduceAttrs::from_attrs(&attrs, 2),
            Err(StrategyError::InvalidAttr { .. })
        ));
    }

    #[rstest]
    #[case(&[128, 128], &[0], ReducePlan::Simple)]
    #[case(&[4096, 4], &[0], ReducePlan::BlockShuffle { k: 256 })]
    #[case(&[128, 128], &[1], ReducePlan::BlockInternal)]
    #[case(&[16, 8, 128], &[0, 2], ReducePlan::Block)]
    #[case(&[16, 4096], &[1], ReducePlan::TwoStep { k: 1024 })]
    #[case(&[16, 1031], &[1], ReducePlan::TwoStep { k: 1024 })]
    fn test_plan_on_gpu(#[case] shape: &[usize], #[case] dim: &[i64], #[case] expected: ReducePlan) {
        assert_eq!(ReducePlan::choose(&layout(shape, dim), &Target::nvgpu()), expected);
    }

    #[test]
    fn test_plan_on_cpu_is_simple() {
        assert_eq!(
            ReducePlan::choose(&layout(&[16, 4096], &[1]), &Target::x86()),
            ReducePlan::Simple
        );
    }

    #[test]
    fn test_layout_head_and_tail() {
        let l = layout(&[16, 8, 128, 1], &[0, 2]);
        assert_eq!(l.tail_axes(), vec![2]);
        assert_eq!(l.head_axes(), vec![0]);
        assert_eq!(l.kept(), vec![1, 3]);
        assert!(l.with_last_dim());
    }

    fn stage(name: &str) -> Tensor {
        Tensor::placeholder(name, vec![1], DType::F32)
    }

    #[test]
    fn test_from_stage_tensors() {
        let two = [stage("a"), stage("b")];
        assert!(matches!(
            ReduceStages::from_stage_tensors(true, &two).unwrap(),
            ReduceStages::BlockReduceInternal { .. }
        ));
        let three = [stage("a"), stage("b"), stage("c")];
        assert!(matches!(
            ReduceStages::from_stage_tensors(false, &three).unwrap(),
            ReduceStages::BlockShuffleReduce { .. }
        ));
        let four = [stage("a"), stage("b"), stage("c"), stage("d")];
        let stages = ReduceStages::from_stage_tensors(true, &four).unwrap();
        assert_eq!(stages.tensor_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(stages.out(), "d");
        assert!(matches!(
            ReduceStages::from_stage_tensors(false, &four),
            Err(CompileError::UnsupportedStageCount {
                count: 4,
                with_last_dim: false
            })
        ));
        assert!(ReduceStages::from_stage_tensors(true, &[]).is_err());
    }

    #[test]
    fn test_two_step_compute_emits_four_stages() {
        let graph = Graph::default();
        let node = crate::graph::Node {
            id: crate::graph::NodeId(0),
            name: "reduce_sum_0".to_string(),
            op: "reduce_sum".to_string(),
            attrs: AttrMap::new().with("dim", vec![1_i64]),
            pattern: PatternKind::Reduce,
            inputs: vec!["A".to_string()],
            outputs: vec!["B".to_string()],
        };
        let names = NameGenerator::new();
        let target = Target::nvgpu();
        let inputs = [Tensor::placeholder("A", vec![16, 4096], DType::F32)];
        let ctx = ComputeContext {
            node: &node,
            inputs: &inputs,
            output_name: "B",
            output_shape: &[16],
            output_dtype: DType::F32,
            target: &target,
            names: &names,
        };
        let def = graph.registry().get("reduce_sum").unwrap();
        let out = def.strategy.compute(&ctx).unwrap();
        let roles: Vec<StageRole> = out.tensors.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                StageRole::Reshape,
                StageRole::Partial,
                StageRole::BlockInternal,
                StageRole::Intermediate
            ]
        );
        assert!(matches!(out.reduce, Some(ReduceStages::TwoStepBlockReduce { .. })));
        assert_eq!(out.tensors[0].shape, vec![16, 1, 4, 1024]);
        assert_eq!(out.tensors.last().unwrap().name, "B");
    }
}
