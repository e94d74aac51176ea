//! Fusion grouping: [`OpFusionPass`] builds the initial partition and
//! [`FusionMergePass`] coalesces it further.

mod group;
mod merge;
mod op_fusion;

pub use group::{finalize_groups, verify_groups, FusionGroup, GroupId};
pub use merge::{fusion_merge, FusionMergePass};
pub use op_fusion::{op_fusion, OpFusionPass};

use crate::error::{CompileError, Result};
use crate::graph::{Graph, NodeId, PatternKind};
use crate::ops::broadcastable;
use crate::ops::reduction::{without_last_dim_in_reduce, ReduceAttrs};

/// Input shape and normalized axes of a reduction node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReduceInfo {
    pub input_shape: Vec<usize>,
    pub axes: Vec<usize>,
    pub output_shape: Vec<usize>,
}

impl ReduceInfo {
    pub fn of(graph: &Graph, id: NodeId) -> Result<Self> {
        let node = graph.node(id);
        let input = node
            .inputs
            .first()
            .ok_or_else(|| CompileError::InvalidGraph(format!("reduction `{}` has no input", node.name)))?;
        let input_shape = graph.shape(input)?.to_vec();
        let attrs = ReduceAttrs::from_attrs(&node.attrs, input_shape.len()).map_err(|source| {
            CompileError::Strategy {
                node: node.name.clone(),
                source,
            }
        })?;
        Ok(Self {
            input_shape,
            axes: attrs.axes,
            output_shape: graph.output_shape(id)?.to_vec(),
        })
    }

    pub fn without_last_dim(&self) -> bool {
        without_last_dim_in_reduce(&self.input_shape, &self.axes)
    }
}

/// Whether the output of `producer` can be computed inside the loop nest of
/// `consumer`.
pub(crate) fn producer_fits(graph: &Graph, producer: NodeId, consumer: NodeId) -> Result<bool> {
    let shape = graph.output_shape(producer)?;
    let node = graph.node(consumer);
    let fits = match node.pattern {
        PatternKind::Reduce => match node.inputs.first() {
            Some(input) => graph.shape(input)? == shape,
            None => false,
        },
        PatternKind::Injective => {
            shape.iter().product::<usize>() == graph.output_shape(consumer)?.iter().product::<usize>()
        }
        _ => broadcastable(shape, graph.output_shape(consumer)?),
    };
    Ok(fits)
}
