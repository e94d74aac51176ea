//! Graph-level passes.

pub mod fusion;

use log::info;

use crate::error::Result;
use crate::graph::Graph;

/// A pass that rewrites graph side tables in place.
pub trait GraphPass {
    fn name(&self) -> &'static str;

    fn run(&self, graph: &mut Graph) -> Result<()>;
}

/// Runs `passes` in order, stopping at the first failure.
pub fn apply_passes(graph: &mut Graph, passes: &[&dyn GraphPass]) -> Result<()> {
    for pass in passes {
        info!("running {}", pass.name());
        pass.run(graph)?;
    }
    Ok(())
}
