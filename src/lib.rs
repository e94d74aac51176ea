//! opfuse: operator fusion and reduction-aware lowering
//!
//! opfuse is the middle-end of a tensor compiler. It partitions an operator
//! graph into fusion groups and lowers every group into one scheduled
//! function for a CPU or GPU target.
//!
//! # Architecture
//!
//! - **graph**: operator graph, pattern kinds, shape inference, DOT output
//! - **ops**: operator registry and per-operator compute/schedule strategies
//! - **opt**: graph passes, including `OpFusionPass` and `FusionMergePass`
//! - **ir**: tensor stages, loop statements, schedule primitives
//! - **lowerer**: `OpLowerer`, turning a fusion group into a `LoweredFunc`
//! - **pipeline**: the end-to-end driver

// ============================================================================
// Core Modules
// ============================================================================

pub mod error;
pub mod graph;
pub mod ir;
pub mod lowerer;
pub mod naming;
pub mod ops;
pub mod opt;
pub mod pipeline;
pub mod target;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{CompileError, Result, ScheduleError, StrategyError};
pub use graph::{Graph, GraphBuilder, NodeId, PatternKind};
pub use ir::{DType, LoweredFunc};
pub use lowerer::{LoweringConfig, OpLowerer};
pub use naming::NameGenerator;
pub use pipeline::compile;
pub use target::{Arch, Target};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    // Graph construction
    pub use crate::graph::{AttrMap, Graph, GraphBuilder, NodeId, PatternKind};
    pub use crate::ir::{DType, ReduceOp};

    // Passes
    pub use crate::opt::fusion::{FusionGroup, FusionMergePass, OpFusionPass};
    pub use crate::opt::GraphPass;

    // Lowering
    pub use crate::ir::{LoweredFunc, MemoryScope};
    pub use crate::lowerer::{LoweringConfig, OpLowerer};
    pub use crate::naming::NameGenerator;
    pub use crate::pipeline::compile;
    pub use crate::target::Target;

    pub use crate::error::{CompileError, Result};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_covers_pipeline() {
        let mut b = GraphBuilder::new("prelude");
        let a = b.create_input(DType::F32, vec![16], "A");
        let c = b.relu(&a);
        b.mark_output(&c);
        let mut graph = b.build().unwrap();
        let names = NameGenerator::new();
        let funcs = compile(&mut graph, &Target::x86(), &names).unwrap();
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].name, "fn_relu_0");
    }
}
