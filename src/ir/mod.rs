//! Loop-level intermediate representation produced by the lowering engine.
//!
//! - [`Tensor`]: a named stage defined by an element-wise or reduction body
//! - [`Stmt`]/[`Expr`]: the loop nests the stages lower to
//! - [`IrSchedule`]: loop transformations applied by operator schedules
//! - [`LoweredFunc`]: the finished body of one fusion group

mod dtype;
pub mod expr;
mod lowered_func;
mod module_expr;
mod printer;
pub mod schedule;
pub mod stmt;
pub mod tensor;

pub use dtype::DType;
pub use expr::{BinaryOp, Expr, Literal, UnaryOp};
pub use lowered_func::{ArgKind, Argument, DeviceApi, LoweredFunc, TempBuffer};
pub use module_expr::ModuleExpr;
pub use schedule::{IrSchedule, LoopInfo};
pub use stmt::{ForKind, GpuAxis, Stmt};
pub use tensor::{MemoryScope, ReduceOp, StageRole, Tensor, TensorOp};
