//! Graph construction utilities

use std::sync::Arc;

use super::{infer_shapes, AttrMap, Graph};
use crate::error::{CompileError, Result};
use crate::ir::{DType, ReduceOp};
use crate::ops::OpRegistry;

/// Incremental graph construction.
///
/// Operator methods return the name of the produced tensor. The first
/// failure is kept and reported by [`GraphBuilder::build`], which also runs
/// shape inference.
///
/// # Example
/// ```
/// use opfuse::graph::GraphBuilder;
/// use opfuse::ir::{DType, ReduceOp};
///
/// let mut b = GraphBuilder::new("example");
/// let a = b.create_input(DType::F32, vec![32, 32], "A");
/// let c = b.reduce(&a, ReduceOp::Sum, &[0], false);
/// b.relu(&c);
/// let graph = b.build().unwrap();
/// assert_eq!(graph.node_count(), 2);
/// ```
pub struct GraphBuilder {
    name: String,
    graph: Graph,
    error: Option<CompileError>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, Arc::new(OpRegistry::with_builtin_ops()))
    }

    pub fn with_registry(name: impl Into<String>, registry: Arc<OpRegistry>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(registry),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record(&mut self, result: Result<String>) -> String {
        match result {
            Ok(name) => name,
            Err(e) => {
                let name = format!("<error {}>", self.graph.node_count());
                self.error.get_or_insert(e);
                name
            }
        }
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    pub fn create_input(&mut self, dtype: DType, shape: Vec<usize>, name: &str) -> String {
        let result = self.graph.add_input(name, dtype, shape);
        self.record(result)
    }

    // ========================================================================
    // Generic operators
    // ========================================================================

    /// Appends any registered operator.
    pub fn op(&mut self, op: &str, inputs: &[&str], attrs: AttrMap) -> String {
        let result = self.graph.add_op(op, inputs, attrs);
        self.record(result)
    }

    pub fn mark_output(&mut self, tensor: &str) {
        if let Err(e) = self.graph.mark_output(tensor) {
            self.error.get_or_insert(e);
        }
    }

    // ========================================================================
    // Element-wise
    // ========================================================================

    pub fn elementwise_add(&mut self, a: &str, b: &str) -> String {
        self.op("elementwise_add", &[a, b], AttrMap::new())
    }

    pub fn elementwise_sub(&mut self, a: &str, b: &str) -> String {
        self.op("elementwise_sub", &[a, b], AttrMap::new())
    }

    pub fn elementwise_mul(&mut self, a: &str, b: &str) -> String {
        self.op("elementwise_mul", &[a, b], AttrMap::new())
    }

    pub fn elementwise_div(&mut self, a: &str, b: &str) -> String {
        self.op("elementwise_div", &[a, b], AttrMap::new())
    }

    pub fn relu(&mut self, x: &str) -> String {
        self.op("relu", &[x], AttrMap::new())
    }

    pub fn exp(&mut self, x: &str) -> String {
        self.op("exp", &[x], AttrMap::new())
    }

    pub fn clip(&mut self, x: &str, max_val: f32, min_val: f32) -> String {
        let attrs = AttrMap::new().with("max_val", max_val).with("min_val", min_val);
        self.op("clip", &[x], attrs)
    }

    // ========================================================================
    // Shape manipulation
    // ========================================================================

    pub fn broadcast_to(&mut self, x: &str, out_shape: &[i64]) -> String {
        self.op("broadcast_to", &[x], AttrMap::new().with("out_shape", out_shape.to_vec()))
    }

    pub fn reshape(&mut self, x: &str, shape: &[i64]) -> String {
        self.op("reshape", &[x], AttrMap::new().with("shape", shape.to_vec()))
    }

    pub fn transpose(&mut self, x: &str, axis: &[i64]) -> String {
        self.op("transpose", &[x], AttrMap::new().with("axis", axis.to_vec()))
    }

    // ========================================================================
    // Reductions and opaque operators
    // ========================================================================

    /// Reduces `x` over `dim`; an empty `dim` reduces every axis.
    pub fn reduce(&mut self, x: &str, kind: ReduceOp, dim: &[i64], keep_dim: bool) -> String {
        let attrs = AttrMap::new().with("dim", dim.to_vec()).with("keep_dim", keep_dim);
        self.op(&format!("reduce_{}", kind.name()), &[x], attrs)
    }

    pub fn matmul(&mut self, a: &str, b: &str) -> String {
        self.op("matmul", &[a, b], AttrMap::new())
    }

    /// Finishes the graph and infers every shape and dtype.
    pub fn build(self) -> Result<Graph> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut graph = self.graph;
        infer_shapes(&mut graph)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let mut b = GraphBuilder::new("test");
        let a = b.create_input(DType::F32, vec![4, 8], "A");
        let t = b.transpose(&a, &[1, 0]);
        let r = b.reshape(&t, &[-1]);
        let c = b.clip(&r, 6.0, 0.0);
        b.mark_output(&c);
        let graph = b.build().unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.shape(&t).unwrap(), &[8, 4]);
        assert_eq!(graph.shape(&c).unwrap(), &[32]);
        assert_eq!(graph.outputs(), &[c]);
    }

    #[test]
    fn test_first_error_is_reported() {
        let mut b = GraphBuilder::new("broken");
        let a = b.create_input(DType::F32, vec![4], "A");
        b.op("conv2d", &[&a], AttrMap::new());
        b.relu(&a);
        assert!(matches!(b.build(), Err(CompileError::UnknownOperator(op)) if op == "conv2d"));
    }

    #[test]
    fn test_shape_error_surfaces_at_build() {
        let mut b = GraphBuilder::new("bad_shapes");
        let a = b.create_input(DType::F32, vec![4, 3], "A");
        let x = b.create_input(DType::F32, vec![4, 8], "B");
        b.elementwise_add(&a, &x);
        assert!(matches!(b.build(), Err(CompileError::Strategy { .. })));
    }
}
