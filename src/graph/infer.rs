//! Shape and dtype inference.

use log::{info, trace};

use super::Graph;
use crate::error::{CompileError, Result};
use crate::opt::GraphPass;

/// Fills `shape_dict` and `dtype_dict` for every node output, in
/// topological order. Graph inputs must already be recorded.
pub fn infer_shapes(graph: &mut Graph) -> Result<()> {
    for id in graph.topological_order()? {
        let node = graph.node(id);
        let def = graph.op_def(id)?;
        let mut shapes = Vec::with_capacity(node.inputs.len());
        let mut dtypes = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            shapes.push(graph.shape(input)?.to_vec());
            dtypes.push(graph.dtype(input)?);
        }
        let strategy_error = |source| CompileError::Strategy {
            node: node.name.clone(),
            source,
        };
        let out_shapes = (def.infer_shape)(&shapes, &node.attrs).map_err(strategy_error)?;
        let out_dtypes = (def.infer_dtype)(&dtypes, &node.attrs).map_err(strategy_error)?;
        if out_shapes.len() != node.outputs.len() || out_dtypes.len() != node.outputs.len() {
            return Err(CompileError::InvalidGraph(format!(
                "`{}` declares {} outputs, inference produced {}",
                node.name,
                node.outputs.len(),
                out_shapes.len()
            )));
        }
        let outputs = node.outputs.clone();
        trace!("{}: {:?} -> {:?}", node.name, shapes, out_shapes);
        for ((name, shape), dtype) in outputs.into_iter().zip(out_shapes).zip(out_dtypes) {
            graph.shape_dict.insert(name.clone(), shape);
            graph.dtype_dict.insert(name, dtype);
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InferShapePass;

impl GraphPass for InferShapePass {
    fn name(&self) -> &'static str {
        "InferShape"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        infer_shapes(graph)?;
        info!("{}: {} tensors", self.name(), graph.shape_dict.len());
        Ok(())
    }
}
