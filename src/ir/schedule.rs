//! Loop-level schedule primitives over a [`ModuleExpr`].

use indexmap::IndexMap;
use log::trace;
use rustc_hash::FxHashMap;

use super::expr::{idx, lt, var, Expr};
use super::module_expr::ModuleExpr;
use super::stmt::{ForKind, Stmt};
use super::tensor::MemoryScope;
use crate::error::ScheduleError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    pub var: String,
    pub extent: usize,
    pub kind: ForKind,
}

pub struct IrSchedule {
    module: ModuleExpr,
    scopes: IndexMap<String, MemoryScope>,
}

impl IrSchedule {
    pub fn new(module: ModuleExpr) -> Self {
        Self {
            module,
            scopes: IndexMap::new(),
        }
    }

    pub fn module(&self) -> &ModuleExpr {
        &self.module
    }

    pub fn into_module(self) -> ModuleExpr {
        self.module
    }

    pub fn merge_exprs(&mut self) {
        self.module.merge();
    }

    pub fn block_names(&self) -> Vec<String> {
        self.module
            .exprs()
            .iter()
            .flatten()
            .flat_map(|s| s.block_names())
            .collect()
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.get_block(name).is_ok()
    }

    pub fn get_block(&self, name: &str) -> Result<&Stmt, ScheduleError> {
        self.module
            .exprs()
            .iter()
            .flatten()
            .find(|s| matches!(s, Stmt::ScheduleBlock { name: n, .. } if n == name))
            .ok_or_else(|| ScheduleError::BlockNotFound(name.to_string()))
    }

    /// Loops enclosing the innermost statement of `block`, outermost first.
    ///
    /// For a reduction block the spatial loops come first, followed by the
    /// reduction loops.
    pub fn get_loops(&self, block: &str) -> Result<Vec<LoopInfo>, ScheduleError> {
        let Stmt::ScheduleBlock { body, .. } = self.get_block(block)? else {
            return Err(ScheduleError::BlockNotFound(block.to_string()));
        };
        let mut loops = Vec::new();
        collect_loops(body, &mut loops);
        Ok(loops)
    }

    fn loop_mut(&mut self, var: &str) -> Result<&mut Stmt, ScheduleError> {
        self.module
            .exprs_mut()
            .iter_mut()
            .flatten()
            .find_map(|s| s.find_loop_mut(var))
            .ok_or_else(|| ScheduleError::LoopNotFound(var.to_string()))
    }

    /// Splits `loop_var` into an outer and an inner loop of extent `factor`.
    ///
    /// A bounds guard is inserted when the extent is not a multiple of the
    /// factor. Returns the names of the new outer and inner loops.
    pub fn split(&mut self, loop_var: &str, factor: usize) -> Result<(String, String), ScheduleError> {
        if factor == 0 {
            return Err(ScheduleError::InvalidFactor(factor));
        }
        let stmt = self.loop_mut(loop_var)?;
        let Stmt::For { extent, body, .. } = stmt else {
            return Err(ScheduleError::LoopNotFound(loop_var.to_string()));
        };
        let n = *extent;
        let factor = factor.min(n.max(1));
        let outer = format!("{loop_var}_o");
        let inner = format!("{loop_var}_i");
        let replacement = (var(&outer) * idx(factor) + var(&inner)).simplify();

        let mut map = FxHashMap::default();
        map.insert(loop_var.to_string(), replacement.clone());
        let mut new_body = std::mem::take(body);
        for s in new_body.iter_mut() {
            s.map_exprs(&|e: &Expr| e.substitute(&map).simplify());
        }
        if n % factor != 0 {
            new_body = vec![Stmt::IfThen {
                cond: lt(replacement, idx(n)),
                body: new_body,
            }];
        }
        *stmt = Stmt::For {
            var: outer.clone(),
            extent: n.div_ceil(factor),
            kind: ForKind::Serial,
            body: vec![Stmt::For {
                var: inner.clone(),
                extent: factor,
                kind: ForKind::Serial,
                body: new_body,
            }],
        };
        trace!("split {loop_var} by {factor} -> ({outer}, {inner})");
        Ok((outer, inner))
    }

    /// Fuses perfectly nested loops, outermost first, into one loop.
    pub fn fuse(&mut self, loop_vars: &[String]) -> Result<String, ScheduleError> {
        let Some(first) = loop_vars.first() else {
            return Err(ScheduleError::NotPerfectlyNested(Vec::new()));
        };
        if loop_vars.len() == 1 {
            return Ok(first.clone());
        }
        let stmt = self.loop_mut(first)?;

        let mut extents = Vec::with_capacity(loop_vars.len());
        let mut cursor: &Stmt = stmt;
        for (i, name) in loop_vars.iter().enumerate() {
            match cursor {
                Stmt::For { var, extent, body, .. } if var == name => {
                    extents.push(*extent);
                    if i + 1 < loop_vars.len() {
                        match body.as_slice() {
                            [only] => cursor = only,
                            _ => return Err(ScheduleError::NotPerfectlyNested(loop_vars.to_vec())),
                        }
                    }
                }
                _ => return Err(ScheduleError::NotPerfectlyNested(loop_vars.to_vec())),
            }
        }

        let mut innermost = std::mem::replace(stmt, Stmt::SyncThreads);
        for _ in 1..loop_vars.len() {
            innermost = match innermost {
                Stmt::For { mut body, .. } => body.remove(0),
                other => other,
            };
        }
        let Stmt::For { body: mut inner_body, .. } = innermost else {
            return Err(ScheduleError::NotPerfectlyNested(loop_vars.to_vec()));
        };

        let fused = format!("{first}_f");
        let total: usize = extents.iter().product();
        let mut map = FxHashMap::default();
        let mut stride = total;
        for (j, (name, &extent)) in loop_vars.iter().zip(&extents).enumerate() {
            stride /= extent.max(1);
            let q = if stride == 1 {
                var(&fused)
            } else {
                var(&fused) / idx(stride)
            };
            let e = if j == 0 { q } else { q % idx(extent) };
            map.insert(name.clone(), e.simplify());
        }
        for s in inner_body.iter_mut() {
            s.map_exprs(&|e: &Expr| e.substitute(&map).simplify());
        }
        *stmt = Stmt::For {
            var: fused.clone(),
            extent: total,
            kind: ForKind::Serial,
            body: inner_body,
        };
        trace!("fuse {loop_vars:?} -> {fused} ({total})");
        Ok(fused)
    }

    pub fn bind(&mut self, loop_var: &str, new_kind: ForKind) -> Result<(), ScheduleError> {
        let Stmt::For { kind, .. } = self.loop_mut(loop_var)? else {
            return Err(ScheduleError::LoopNotFound(loop_var.to_string()));
        };
        *kind = new_kind;
        Ok(())
    }

    /// Substitutes the definition of an element-wise block into every reader
    /// and removes the block.
    pub fn compute_inline(&mut self, block: &str) -> Result<(), ScheduleError> {
        let (vars, value) = {
            let Stmt::ScheduleBlock { body, .. } = self.get_block(block)? else {
                return Err(ScheduleError::BlockNotFound(block.to_string()));
            };
            inlinable_definition(block, body)?
        };

        for expr in self.module.exprs_mut().iter_mut() {
            expr.retain(|s| !matches!(s, Stmt::ScheduleBlock { name, .. } if name == block));
        }
        let replace = |indices: &[Expr]| {
            let map: FxHashMap<String, Expr> =
                vars.iter().cloned().zip(indices.iter().cloned()).collect();
            value.substitute(&map).simplify()
        };
        for s in self.module.exprs_mut().iter_mut().flatten() {
            s.map_exprs(&|e: &Expr| e.replace_loads(block, &replace));
        }
        self.module.exprs_mut().retain(|e| !e.is_empty());
        self.scopes.shift_remove(block);
        trace!("compute_inline {block}");
        Ok(())
    }

    pub fn set_buffer(&mut self, tensor: &str, scope: MemoryScope) {
        self.scopes.insert(tensor.to_string(), scope);
    }

    /// Scope recorded for `tensor`, global when none was set.
    pub fn buffer_scope(&self, tensor: &str) -> MemoryScope {
        self.scopes.get(tensor).copied().unwrap_or_default()
    }

    /// Inserts a block-wide barrier right after `block`.
    pub fn sync_after(&mut self, block: &str) -> Result<(), ScheduleError> {
        for expr in self.module.exprs_mut().iter_mut() {
            if let Some(pos) = expr
                .iter()
                .position(|s| matches!(s, Stmt::ScheduleBlock { name, .. } if name == block))
            {
                expr.insert(pos + 1, Stmt::SyncThreads);
                return Ok(());
            }
        }
        Err(ScheduleError::BlockNotFound(block.to_string()))
    }
}

fn collect_loops(body: &[Stmt], out: &mut Vec<LoopInfo>) {
    match body.last() {
        Some(Stmt::For {
            var,
            extent,
            kind,
            body,
        }) => {
            out.push(LoopInfo {
                var: var.clone(),
                extent: *extent,
                kind: *kind,
            });
            collect_loops(body, out);
        }
        Some(Stmt::IfThen { body, .. }) if body.len() == 1 => collect_loops(body, out),
        _ => {}
    }
}

/// Loop variables and stored value of an untransformed element-wise block.
fn inlinable_definition(block: &str, body: &[Stmt]) -> Result<(Vec<String>, Expr), ScheduleError> {
    let reject = |why: &str| ScheduleError::NotInlinable(block.to_string(), why.to_string());
    let mut vars = Vec::new();
    let mut cursor = body;
    loop {
        match cursor {
            [Stmt::For { var, body, .. }] => {
                vars.push(var.clone());
                cursor = body;
            }
            [Stmt::Store {
                tensor,
                indices,
                value,
            }] => {
                if tensor != block {
                    return Err(reject("stores to another tensor"));
                }
                let plain = indices.len() == vars.len()
                    && indices.iter().zip(&vars).all(|(i, v)| i.as_var() == Some(v.as_str()));
                if !plain {
                    return Err(reject("loop nest has been transformed"));
                }
                let mut self_read = false;
                value.for_each_load(&mut |t, _| self_read |= t == block);
                if self_read {
                    return Err(reject("reads its own output"));
                }
                return Ok((vars, value.clone()));
            }
            _ => return Err(reject("not a single element-wise store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::exp;
    use crate::ir::tensor::{ReduceOp, Tensor};
    use crate::ir::DType;

    fn two_stage() -> IrSchedule {
        let a = Tensor::placeholder("A", vec![4, 10], DType::F32);
        let b = Tensor::compute("B", vec![4, 10], DType::F32, |ix| exp(a.load(ix.to_vec())));
        let c = Tensor::compute("C", vec![4, 10], DType::F32, |ix| b.load(ix.to_vec()) + a.load(ix.to_vec()));
        IrSchedule::new(ModuleExpr::from_tensors([&a, &b, &c]))
    }

    #[test]
    fn test_merge_exprs() {
        let mut sch = two_stage();
        assert_eq!(sch.module().len(), 2);
        sch.merge_exprs();
        assert_eq!(sch.module().len(), 1);
        assert_eq!(sch.block_names(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_compute_inline_removes_block() {
        let mut sch = two_stage();
        sch.merge_exprs();
        sch.compute_inline("B").unwrap();
        assert_eq!(sch.block_names(), vec!["C".to_string()]);
        let c = sch.get_block("C").unwrap();
        assert!(!c.reads("B"));
        assert!(c.reads("A"));
    }

    #[test]
    fn test_compute_inline_rejects_reduction() {
        let a = Tensor::placeholder("A", vec![4, 10], DType::F32);
        let r = Tensor::reduce("R", vec![4], DType::F32, ReduceOp::Sum, vec![10], |ix, rv| {
            a.load(vec![ix[0].clone(), rv[0].clone()])
        });
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors([&r]));
        assert!(matches!(
            sch.compute_inline("R"),
            Err(ScheduleError::NotInlinable(..))
        ));
    }

    #[test]
    fn test_split_with_guard() {
        let mut sch = two_stage();
        let (outer, inner) = sch.split("C_i1", 4).unwrap();
        let loops = sch.get_loops("C").unwrap();
        let names: Vec<_> = loops.iter().map(|l| l.var.as_str()).collect();
        assert_eq!(names, vec!["C_i0", outer.as_str(), inner.as_str()]);
        assert_eq!(loops[1].extent, 3);
        assert_eq!(loops[2].extent, 4);
        let Some(Stmt::For { body, .. }) = sch.get_block("C").unwrap().find_loop(&inner) else {
            panic!("inner loop missing");
        };
        assert!(matches!(body.as_slice(), [Stmt::IfThen { .. }]));
    }

    #[test]
    fn test_fuse_then_bind() {
        let mut sch = two_stage();
        let fused = sch
            .fuse(&["C_i0".to_string(), "C_i1".to_string()])
            .unwrap();
        let loops = sch.get_loops("C").unwrap();
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].extent, 40);
        sch.bind(&fused, ForKind::Parallel).unwrap();
        assert_eq!(sch.get_loops("C").unwrap()[0].kind, ForKind::Parallel);
    }

    #[test]
    fn test_fuse_rejects_imperfect_nest() {
        let a = Tensor::placeholder("A", vec![4, 10], DType::F32);
        let r = Tensor::reduce("R", vec![4], DType::F32, ReduceOp::Sum, vec![10], |ix, rv| {
            a.load(vec![ix[0].clone(), rv[0].clone()])
        });
        let mut sch = IrSchedule::new(ModuleExpr::from_tensors([&r]));
        assert!(sch.fuse(&["R_i0".to_string(), "R_r0".to_string()]).is_err());
    }

    #[test]
    fn test_missing_loop_and_block() {
        let mut sch = two_stage();
        assert_eq!(
            sch.bind("nope", ForKind::Parallel),
            Err(ScheduleError::LoopNotFound("nope".to_string()))
        );
        assert!(sch.get_loops("nope").is_err());
        assert!(sch.split("C_i0", 0).is_err());
    }

    #[test]
    fn test_sync_after() {
        let mut sch = two_stage();
        sch.merge_exprs();
        sch.sync_after("B").unwrap();
        assert!(matches!(sch.module().exprs()[0][1], Stmt::SyncThreads));
    }
}
