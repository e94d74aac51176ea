//! Text rendering of expressions, statements and lowered functions.

use std::fmt::{self, Display, Write};

use super::expr::{Expr, Literal, UnaryOp};
use super::lowered_func::{ArgKind, DeviceApi, LoweredFunc};
use super::stmt::{ForKind, Stmt};

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::F32(v) => write!(f, "{v:?}f"),
            Literal::F64(v) => write!(f, "{v:?}"),
            Literal::I32(v) => write!(f, "{v}"),
            Literal::I64(v) => write!(f, "{v}ll"),
            Literal::Bool(v) => write!(f, "{v}"),
        }
    }
}

fn write_indices(f: &mut fmt::Formatter<'_>, indices: &[Expr]) -> fmt::Result {
    for (i, e) in indices.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(l) => write!(f, "{l}"),
            Expr::Var(v) => f.write_str(v),
            Expr::Load { tensor, indices } => {
                write!(f, "{tensor}[")?;
                write_indices(f, indices)?;
                f.write_str("]")
            }
            Expr::Binary(op, a, b) if op.is_call() => write!(f, "{}({a}, {b})", op.symbol()),
            Expr::Binary(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
            Expr::Unary(UnaryOp::Neg, a) => write!(f, "(-{a})"),
            Expr::Unary(UnaryOp::Exp, a) => write!(f, "exp({a})"),
            Expr::Unary(UnaryOp::Sqrt, a) => write!(f, "sqrt({a})"),
            Expr::Cast(dtype, a) => write!(f, "({}){a}", dtype.c_name()),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => write!(f, "select({cond}, {then}, {otherwise})"),
        }
    }
}

fn kind_prefix(kind: &ForKind) -> String {
    match kind {
        ForKind::Serial => String::new(),
        ForKind::Parallel => "parallel ".to_string(),
        ForKind::Vectorized(w) => format!("vectorize[{w}] "),
        ForKind::Unrolled => "unroll ".to_string(),
        ForKind::GpuBlock(axis) => format!("thread_bind[blockIdx.{}] ", axis.suffix()),
        ForKind::GpuThread(axis) => format!("thread_bind[threadIdx.{}] ", axis.suffix()),
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match stmt {
        Stmt::For {
            var,
            extent,
            kind,
            body,
        } => {
            writeln!(out, "{pad}{}for ({var}, 0, {extent}) {{", kind_prefix(kind))?;
            for s in body {
                write_stmt(out, s, indent + 1)?;
            }
            writeln!(out, "{pad}}}")
        }
        Stmt::Store {
            tensor,
            indices,
            value,
        } => {
            let idx: Vec<String> = indices.iter().map(|e| e.to_string()).collect();
            writeln!(out, "{pad}{tensor}[{}] = {value}", idx.join(", "))
        }
        Stmt::IfThen { cond, body } => {
            writeln!(out, "{pad}if ({cond}) {{")?;
            for s in body {
                write_stmt(out, s, indent + 1)?;
            }
            writeln!(out, "{pad}}}")
        }
        Stmt::ScheduleBlock { name, body } => {
            writeln!(out, "{pad}ScheduleBlock({name}) {{")?;
            for s in body {
                write_stmt(out, s, indent + 1)?;
            }
            writeln!(out, "{pad}}}")
        }
        Stmt::SyncThreads => writeln!(out, "{pad}__syncthreads()"),
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_stmt(&mut out, self, 0)?;
        f.write_str(&out)
    }
}

impl Display for LoweredFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = match self.device_api {
            DeviceApi::Host => "host",
            DeviceApi::Gpu => "gpu",
        };
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                let marker = match a.kind {
                    ArgKind::Input => "",
                    ArgKind::Output => "_",
                };
                format!("{marker}{}", a.name)
            })
            .collect();
        writeln!(f, "function {} ({}) [{device}]", self.name, args.join(", "))?;
        writeln!(f, "{{")?;
        let mut out = String::new();
        for buf in &self.temp_buffers {
            writeln!(out, "  alloc {} {}{:?} {}", buf.scope, buf.dtype, buf.shape, buf.name)?;
        }
        for s in &self.body {
            write_stmt(&mut out, s, 1)?;
        }
        f.write_str(&out)?;
        writeln!(f, "}}")
    }
}
