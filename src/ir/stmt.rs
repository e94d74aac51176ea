//! Loop-level statements.

use super::expr::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuAxis {
    X,
    Y,
    Z,
}

impl GpuAxis {
    pub fn suffix(&self) -> &'static str {
        match self {
            GpuAxis::X => "x",
            GpuAxis::Y => "y",
            GpuAxis::Z => "z",
        }
    }
}

/// Execution attribute of a loop.
///
/// A reduction loop bound to `GpuThread` denotes a cross-thread reduction
/// within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForKind {
    #[default]
    Serial,
    Parallel,
    Vectorized(usize),
    Unrolled,
    GpuBlock(GpuAxis),
    GpuThread(GpuAxis),
}

impl ForKind {
    pub fn is_gpu_bound(&self) -> bool {
        matches!(self, ForKind::GpuBlock(_) | ForKind::GpuThread(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    For {
        var: String,
        extent: usize,
        kind: ForKind,
        body: Vec<Stmt>,
    },
    Store {
        tensor: String,
        indices: Vec<Expr>,
        value: Expr,
    },
    IfThen {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// Computation of one tensor stage.
    ScheduleBlock {
        name: String,
        body: Vec<Stmt>,
    },
    SyncThreads,
}

pub fn for_loop(var: impl Into<String>, extent: usize, body: Vec<Stmt>) -> Stmt {
    Stmt::For {
        var: var.into(),
        extent,
        kind: ForKind::Serial,
        body,
    }
}

pub fn store(tensor: impl Into<String>, indices: Vec<Expr>, value: Expr) -> Stmt {
    Stmt::Store {
        tensor: tensor.into(),
        indices,
        value,
    }
}

impl Stmt {
    /// Applies `f` to every expression reachable from this statement.
    pub fn map_exprs(&mut self, f: &dyn Fn(&Expr) -> Expr) {
        match self {
            Stmt::For { body, .. } | Stmt::ScheduleBlock { body, .. } => {
                body.iter_mut().for_each(|s| s.map_exprs(f));
            }
            Stmt::Store { indices, value, .. } => {
                for i in indices.iter_mut() {
                    *i = f(i);
                }
                *value = f(value);
            }
            Stmt::IfThen { cond, body } => {
                *cond = f(cond);
                body.iter_mut().for_each(|s| s.map_exprs(f));
            }
            Stmt::SyncThreads => {}
        }
    }

    /// Finds the loop named `var` anywhere below this statement.
    pub fn find_loop_mut(&mut self, var: &str) -> Option<&mut Stmt> {
        if let Stmt::For { var: v, .. } = self {
            if v == var {
                return Some(self);
            }
        }
        match self {
            Stmt::For { body, .. } | Stmt::ScheduleBlock { body, .. } | Stmt::IfThen { body, .. } => {
                body.iter_mut().find_map(|s| s.find_loop_mut(var))
            }
            _ => None,
        }
    }

    pub fn find_loop(&self, var: &str) -> Option<&Stmt> {
        match self {
            Stmt::For { var: v, .. } if v == var => Some(self),
            Stmt::For { body, .. } | Stmt::ScheduleBlock { body, .. } | Stmt::IfThen { body, .. } => {
                body.iter().find_map(|s| s.find_loop(var))
            }
            _ => None,
        }
    }

    /// Calls `visit` on every statement, parents before children.
    pub fn walk(&self, visit: &mut dyn FnMut(&Stmt)) {
        visit(self);
        if let Stmt::For { body, .. } | Stmt::ScheduleBlock { body, .. } | Stmt::IfThen { body, .. } =
            self
        {
            for s in body {
                s.walk(visit);
            }
        }
    }

    /// Names of all schedule blocks below and including this statement.
    pub fn block_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(&mut |s| {
            if let Stmt::ScheduleBlock { name, .. } = s {
                names.push(name.clone());
            }
        });
        names
    }

    /// True when any expression below reads `tensor`.
    pub fn reads(&self, tensor: &str) -> bool {
        let mut found = false;
        self.walk(&mut |s| {
            let mut check = |e: &Expr| {
                e.for_each_load(&mut |t, _| found |= t == tensor);
            };
            match s {
                Stmt::Store { indices, value, .. } => {
                    indices.iter().for_each(&mut check);
                    check(value);
                }
                Stmt::IfThen { cond, .. } => check(cond),
                _ => {}
            }
        });
        found
    }
}
