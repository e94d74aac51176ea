//! Schedule families shared by the built-in strategies.

use log::trace;

use super::reduction::ReduceStages;
use crate::error::ScheduleError;
use crate::ir::{ForKind, GpuAxis, IrSchedule, LoopInfo, MemoryScope};
use crate::lowerer::LoweringConfig;
use crate::target::Target;

const BLOCK_X: ForKind = ForKind::GpuBlock(GpuAxis::X);
const THREAD_X: ForKind = ForKind::GpuThread(GpuAxis::X);

fn vars(loops: &[LoopInfo]) -> Vec<String> {
    loops.iter().map(|l| l.var.clone()).collect()
}

/// Fuses `loops` and spreads the result over blocks of at most
/// `max_threads_per_block` threads.
fn bind_flat(sch: &mut IrSchedule, loops: &[LoopInfo], target: &Target) -> Result<(), ScheduleError> {
    if loops.is_empty() {
        return Ok(());
    }
    let extent: usize = loops.iter().map(|l| l.extent).product();
    let fused = sch.fuse(&vars(loops))?;
    let threads = target.max_threads_per_block;
    if extent > threads {
        let (outer, inner) = sch.split(&fused, threads)?;
        sch.bind(&outer, BLOCK_X)?;
        sch.bind(&inner, THREAD_X)?;
    } else {
        sch.bind(&fused, THREAD_X)?;
    }
    Ok(())
}

/// Fuses the leading `count` loops of `block` into one loop bound to blocks.
fn bind_rows(sch: &mut IrSchedule, block: &str, count: usize) -> Result<Vec<LoopInfo>, ScheduleError> {
    let loops = sch.get_loops(block)?;
    let count = count.min(loops.len());
    if count > 0 {
        let fused = sch.fuse(&vars(&loops[..count]))?;
        sch.bind(&fused, BLOCK_X)?;
    }
    Ok(loops[count..].to_vec())
}

/// Element-wise, broadcast and injective stages. Does nothing when `block`
/// has been inlined.
pub fn schedule_injective(
    sch: &mut IrSchedule,
    block: &str,
    target: &Target,
    config: &LoweringConfig,
) -> Result<(), ScheduleError> {
    if !sch.has_block(block) {
        return Ok(());
    }
    let loops = sch.get_loops(block)?;
    if target.is_gpu() {
        return bind_flat(sch, &loops, target);
    }

    let Some(inner) = loops.last() else {
        return Ok(());
    };
    let width = config.vector_width;
    if config.enable_vectorize && width > 1 && inner.extent % width == 0 {
        let lane = if inner.extent > width {
            sch.split(&inner.var, width)?.1
        } else {
            inner.var.clone()
        };
        sch.bind(&lane, ForKind::Vectorized(width))?;
    }
    if let Some(outer) = sch.get_loops(block)?.first() {
        if outer.kind == ForKind::Serial {
            sch.bind(&outer.var, ForKind::Parallel)?;
        }
    }
    trace!("scheduled injective block {block} for {target}");
    Ok(())
}

/// Reduction schedules, one per [`ReduceStages`] variant. `out_rank` is the
/// rank of the node output.
pub fn schedule_reduce(
    sch: &mut IrSchedule,
    stages: &ReduceStages,
    out_rank: usize,
    target: &Target,
) -> Result<(), ScheduleError> {
    match stages {
        ReduceStages::SimpleReduce { out } => {
            if !sch.has_block(out) {
                return Ok(());
            }
            let loops = sch.get_loops(out)?;
            let spatial = &loops[..out_rank.min(loops.len())];
            if target.is_gpu() {
                bind_flat(sch, spatial, target)?;
            } else if let Some(first) = spatial.first() {
                sch.bind(&first.var, ForKind::Parallel)?;
            }
        }
        ReduceStages::BlockShuffleReduce { internal, out, .. } => {
            let mut trailing = 1;
            if sch.has_block(internal) {
                // [pre, k, trailing, rows]
                let loops = sch.get_loops(internal)?;
                if let [pre, k, w, ..] = loops.as_slice() {
                    trailing = w.extent;
                    sch.bind(&pre.var, BLOCK_X)?;
                    let lanes = sch.fuse(&[k.var.clone(), w.var.clone()])?;
                    sch.bind(&lanes, THREAD_X)?;
                }
                sch.set_buffer(internal, MemoryScope::Shared);
                sch.sync_after(internal)?;
            }
            if sch.has_block(out) {
                let loops = sch.get_loops(out)?;
                let spatial = &loops[..out_rank.min(loops.len())];
                if !spatial.is_empty() {
                    let fused = sch.fuse(&vars(spatial))?;
                    let (outer, inner) = sch.split(&fused, trailing)?;
                    sch.bind(&outer, BLOCK_X)?;
                    sch.bind(&inner, THREAD_X)?;
                }
            }
        }
        ReduceStages::BlockReduceInternal { tmp_out, out } => {
            if sch.has_block(tmp_out) {
                if let [lane, ..] = bind_rows(sch, tmp_out, 1)?.as_slice() {
                    sch.bind(&lane.var, THREAD_X)?;
                }
                sch.set_buffer(tmp_out, MemoryScope::Local);
                sch.sync_after(tmp_out)?;
            }
            if sch.has_block(out) {
                if let [lane, ..] = bind_rows(sch, out, out_rank)?.as_slice() {
                    sch.bind(&lane.var, THREAD_X)?;
                }
            }
        }
        ReduceStages::BlockReduce {
            reduce_tmp_out,
            tmp_out,
            out,
        }
        | ReduceStages::TwoStepBlockReduce {
            reduce_tmp_out,
            tmp_out,
            out,
            ..
        } => {
            if sch.has_block(reduce_tmp_out) {
                if let [lane, ..] = bind_rows(sch, reduce_tmp_out, 1)?.as_slice() {
                    sch.bind(&lane.var, THREAD_X)?;
                }
                sch.set_buffer(reduce_tmp_out, MemoryScope::Local);
            }
            if sch.has_block(tmp_out) {
                if let [lane, ..] = bind_rows(sch, tmp_out, 1)?.as_slice() {
                    sch.bind(&lane.var, THREAD_X)?;
                }
                sch.set_buffer(tmp_out, MemoryScope::Shared);
                sch.sync_after(tmp_out)?;
            }
            if sch.has_block(out) {
                bind_rows(sch, out, out_rank)?;
            }
        }
    }
    trace!("scheduled {stages} for {target}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::{exp, idx};
    use crate::ir::{DType, ModuleExpr, ReduceOp, Stmt, Tensor};

    fn elementwise(shape: Vec<usize>) -> IrSchedule {
        let a = Tensor::placeholder("A", shape.clone(), DType::F32);
        let b = Tensor::compute("B", shape, DType::F32, |ix| exp(a.load(ix.to_vec())));
        IrSchedule::new(ModuleExpr::from_tensors([&b]))
    }

    #[test]
    fn test_injective_cpu_vectorizes_and_parallelizes() {
        let mut sch = elementwise(vec![4, 32]);
        schedule_injective(&mut sch, "B", &Target::x86(), &LoweringConfig::default()).unwrap();
        let kinds: Vec<ForKind> = sch.get_loops("B").unwrap().iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![ForKind::Parallel, ForKind::Serial, ForKind::Vectorized(8)]
        );
    }

    #[test]
    fn test_injective_cpu_skips_ragged_vectorization() {
        let mut sch = elementwise(vec![4, 10]);
        schedule_injective(&mut sch, "B", &Target::x86(), &LoweringConfig::default()).unwrap();
        let kinds: Vec<ForKind> = sch.get_loops("B").unwrap().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![ForKind::Parallel, ForKind::Serial]);
    }

    #[test]
    fn test_injective_gpu_binds_blocks_and_threads() {
        let mut sch = elementwise(vec![64, 64]);
        schedule_injective(&mut sch, "B", &Target::nvgpu(), &LoweringConfig::default()).unwrap();
        let loops = sch.get_loops("B").unwrap();
        assert_eq!(loops.len(), 2);
        assert_eq!(loops[0].kind, BLOCK_X);
        assert_eq!(loops[0].extent, 4);
        assert_eq!(loops[1].kind, THREAD_X);
        assert_eq!(loops[1].extent, 1024);
    }

    #[test]
    fn test_injective_missing_block_is_noop() {
        let mut sch = elementwise(vec![4]);
        assert!(schedule_injective(&mut sch, "gone", &Target::nvgpu(), &LoweringConfig::default()).is_ok());
    }

    #[test]
    fn test_simple_reduce_cpu_parallel_outer() {
        let a = Tensor::placeholder("A", vec![16, 64], DType::F32);
        let r = Tensor::reduce("R", vec![16], DType::F32, ReduceOp::Sum, vec![64], |ix, rv| {
            a.load(vec![ix[0].clone(), rv[0].clone()])
        });
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors([&r]));
        let stages = ReduceStages::SimpleReduce { out: "R".to_string() };
        schedule_reduce(&mut sch, &stages, 1, &Target::x86()).unwrap();
        let loops = sch.get_loops("R").unwrap();
        assert_eq!(loops[0].kind, ForKind::Parallel);
        assert_eq!(loops[1].kind, ForKind::Serial);
    }

    #[test]
    fn test_block_shuffle_shares_partials_then_syncs() {
        let a = Tensor::placeholder("A", vec![64, 4], DType::F32);
        let internal = Tensor::reduce("I", vec![1, 16, 4], DType::F32, ReduceOp::Sum, vec![4], |ix, r| {
            a.load(vec![r[0].clone() * idx(16) + ix[1].clone(), ix[2].clone()])
        });
        let out = Tensor::reduce("O", vec![4], DType::F32, ReduceOp::Sum, vec![16], |ix, r| {
            internal.load(vec![idx(0), r[0].clone(), ix[0].clone()])
        });
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors([&internal, &out]));
        sch.merge_exprs();
        let stages = ReduceStages::BlockShuffleReduce {
            reshape: "R".to_string(),
            internal: "I".to_string(),
            out: "O".to_string(),
        };
        schedule_reduce(&mut sch, &stages, 1, &Target::nvgpu()).unwrap();

        assert_eq!(sch.buffer_scope("I"), MemoryScope::Shared);
        assert_eq!(sch.buffer_scope("O"), MemoryScope::Global);
        let partial: Vec<ForKind> = sch.get_loops("I").unwrap().iter().map(|l| l.kind).collect();
        assert_eq!(partial, vec![BLOCK_X, THREAD_X, ForKind::Serial]);
        let last: Vec<ForKind> = sch.get_loops("O").unwrap().iter().map(|l| l.kind).collect();
        assert_eq!(last, vec![BLOCK_X, THREAD_X, ForKind::Serial]);

        // The barrier stays attached to the shared partials.
        let mut module = sch.into_module();
        module.split_blocks();
        let pieces = module.into_exprs();
        assert_eq!(pieces.len(), 2);
        assert!(matches!(
            pieces[0].as_slice(),
            [Stmt::ScheduleBlock { .. }, Stmt::SyncThreads]
        ));
    }

    #[test]
    fn test_block_reduce_scopes() {
        let a = Tensor::placeholder("A", vec![16, 8, 128], DType::F32);
        let partial = Tensor::reduce("P", vec![8, 128], DType::F32, ReduceOp::Sum, vec![16], |ix, r| {
            a.load(vec![r[0].clone(), ix[0].clone(), ix[1].clone()])
        });
        let tmp = Tensor::reduce("T", vec![8], DType::F32, ReduceOp::Sum, vec![128], |ix, r| {
            partial.load(vec![ix[0].clone(), r[0].clone()])
        });
        let out = Tensor::compute("O", vec![8], DType::F32, |ix| tmp.load(ix.to_vec()));
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors([&partial, &tmp, &out]));
        sch.merge_exprs();
        let stages = ReduceStages::BlockReduce {
            reduce_tmp_out: "P".to_string(),
            tmp_out: "T".to_string(),
            out: "O".to_string(),
        };
        schedule_reduce(&mut sch, &stages, 1, &Target::nvgpu()).unwrap();

        assert_eq!(sch.buffer_scope("P"), MemoryScope::Local);
        assert_eq!(sch.buffer_scope("T"), MemoryScope::Shared);
        assert_eq!(sch.get_loops("P").unwrap()[0].kind, BLOCK_X);
        assert_eq!(sch.get_loops("P").unwrap()[1].kind, THREAD_X);
        assert_eq!(sch.get_loops("O").unwrap()[0].kind, BLOCK_X);
        assert!(matches!(sch.module().exprs()[0][2], Stmt::SyncThreads));
    }
}
