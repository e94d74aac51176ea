//! Operator graph: nodes, the tensors connecting them, and the per-tensor
//! shape and dtype tables the passes fill in.

mod attr;
pub mod builder;
mod infer;
mod pattern;
mod traversal;
pub mod visualization;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{CompileError, Result};
use crate::ir::DType;
use crate::ops::{OpDef, OpRegistry};
use crate::opt::fusion::FusionGroup;

pub use attr::{AttrMap, AttrValue};
pub use builder::GraphBuilder;
pub use infer::{infer_shapes, InferShapePass};
pub use pattern::PatternKind;

/// Index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    pub attrs: AttrMap,
    pub pattern: PatternKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl Node {
    pub fn is_reduce(&self) -> bool {
        self.pattern == PatternKind::Reduce
    }

    /// First output tensor.
    pub fn output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or_default()
    }
}

/// A tensor flowing from its producer to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub tensor: String,
    pub producer: NodeId,
    pub consumer: NodeId,
}

pub struct Graph {
    registry: Arc<OpRegistry>,
    nodes: Vec<Node>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    producers: FxHashMap<String, NodeId>,
    consumers: FxHashMap<String, Vec<NodeId>>,
    next_tensor: usize,
    pub shape_dict: FxHashMap<String, Vec<usize>>,
    pub dtype_dict: FxHashMap<String, DType>,
    pub fusion_groups: Vec<FusionGroup>,
}

impl Graph {
    pub fn new(registry: Arc<OpRegistry>) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            producers: FxHashMap::default(),
            consumers: FxHashMap::default(),
            next_tensor: 0,
            shape_dict: FxHashMap::default(),
            dtype_dict: FxHashMap::default(),
            fusion_groups: Vec::new(),
        }
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    /// Declares a graph input with a known shape and dtype.
    pub fn add_input(&mut self, name: &str, dtype: DType, shape: Vec<usize>) -> Result<String> {
        if self.tensor_exists(name) {
            return Err(CompileError::InvalidGraph(format!("tensor `{name}` declared twice")));
        }
        self.inputs.push(name.to_string());
        self.shape_dict.insert(name.to_string(), shape);
        self.dtype_dict.insert(name.to_string(), dtype);
        Ok(name.to_string())
    }

    /// Appends an operator with a generated output name and returns it.
    pub fn add_op(&mut self, op: &str, inputs: &[&str], attrs: AttrMap) -> Result<String> {
        let output = self.fresh_tensor_name();
        self.add_op_named(op, inputs, attrs, &output)
    }

    /// Appends an operator whose single output is named `output`.
    ///
    /// Inputs may refer to tensors produced by nodes added later; they are
    /// resolved when the graph is traversed.
    pub fn add_op_named(
        &mut self,
        op: &str,
        inputs: &[&str],
        attrs: AttrMap,
        output: &str,
    ) -> Result<String> {
        let def = self
            .registry
            .get(op)
            .ok_or_else(|| CompileError::UnknownOperator(op.to_string()))?;
        if let Some(expected) = def.num_inputs {
            if expected != inputs.len() {
                return Err(CompileError::InvalidGraph(format!(
                    "`{op}` takes {expected} inputs, got {}",
                    inputs.len()
                )));
            }
        }
        if self.tensor_exists(output) {
            return Err(CompileError::InvalidGraph(format!("tensor `{output}` declared twice")));
        }
        let pattern = def.pattern;
        let id = NodeId(self.nodes.len());
        let node = Node {
            id,
            name: format!("{op}_{}", id.0),
            op: op.to_string(),
            attrs,
            pattern,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![output.to_string()],
        };
        for input in &node.inputs {
            let users = self.consumers.entry(input.clone()).or_default();
            if !users.contains(&id) {
                users.push(id);
            }
        }
        self.producers.insert(output.to_string(), id);
        self.nodes.push(node);
        Ok(output.to_string())
    }

    pub fn mark_output(&mut self, tensor: &str) -> Result<()> {
        if !self.tensor_exists(tensor) {
            return Err(CompileError::UnknownTensor(tensor.to_string()));
        }
        if !self.outputs.iter().any(|t| t == tensor) {
            self.outputs.push(tensor.to_string());
        }
        Ok(())
    }

    fn tensor_exists(&self, name: &str) -> bool {
        self.producers.contains_key(name) || self.inputs.iter().any(|t| t == name)
    }

    fn fresh_tensor_name(&mut self) -> String {
        loop {
            let name = format!("var_{}", self.next_tensor);
            self.next_tensor += 1;
            if !self.tensor_exists(&name) {
                return name;
            }
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_graph_input(&self, tensor: &str) -> bool {
        self.inputs.iter().any(|t| t == tensor)
    }

    pub fn is_graph_output(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|t| t == tensor)
    }

    pub fn producer(&self, tensor: &str) -> Option<NodeId> {
        self.producers.get(tensor).copied()
    }

    pub fn consumers(&self, tensor: &str) -> &[NodeId] {
        self.consumers.get(tensor).map(Vec::as_slice).unwrap_or_default()
    }

    /// Distinct nodes reading any output of `id`, in id order.
    pub fn node_consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut users: Vec<NodeId> = self
            .node(id)
            .outputs
            .iter()
            .flat_map(|t| self.consumers(t).iter().copied())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Distinct nodes producing an input of `id`, in id order.
    pub fn node_producers(&self, id: NodeId) -> Vec<NodeId> {
        let mut producers: Vec<NodeId> = self
            .node(id)
            .inputs
            .iter()
            .filter_map(|t| self.producer(t))
            .collect();
        producers.sort();
        producers.dedup();
        producers
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for node in &self.nodes {
            for input in &node.inputs {
                if let Some(producer) = self.producer(input) {
                    edges.push(Edge {
                        tensor: input.clone(),
                        producer,
                        consumer: node.id,
                    });
                }
            }
        }
        edges
    }

    pub fn shape(&self, tensor: &str) -> Result<&[usize]> {
        self.shape_dict
            .get(tensor)
            .map(Vec::as_slice)
            .ok_or_else(|| CompileError::MissingShape(tensor.to_string()))
    }

    pub fn dtype(&self, tensor: &str) -> Result<DType> {
        self.dtype_dict
            .get(tensor)
            .copied()
            .ok_or_else(|| CompileError::MissingDtype(tensor.to_string()))
    }

    /// Shape of the first output of `id`.
    pub fn output_shape(&self, id: NodeId) -> Result<&[usize]> {
        self.shape(self.node(id).output())
    }

    pub fn op_def(&self, id: NodeId) -> Result<&OpDef> {
        let op = &self.node(id).op;
        self.registry
            .get(op)
            .ok_or_else(|| CompileError::UnknownOperator(op.clone()))
    }

    /// Fails unless every tensor read or written by a node has both a
    /// shape and a dtype.
    pub fn check_tensor_info(&self) -> Result<()> {
        for node in &self.nodes {
            for t in node.inputs.iter().chain(&node.outputs) {
                self.shape(t)?;
                self.dtype(t)?;
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(Arc::new(OpRegistry::with_builtin_ops()))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "inputs: {}", self.inputs.join(", "))?;
        for node in &self.nodes {
            let shape = self
                .shape_dict
                .get(node.output())
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "?".to_string());
            write!(
                f,
                "  {} = {}({})",
                node.outputs.join(", "),
                node.op,
                node.inputs.join(", ")
            )?;
            if !node.attrs.is_empty() {
                let attrs: Vec<String> = node.attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, " {{{}}}", attrs.join(", "))?;
            }
            writeln!(f, " : {shape}  [{}]", node.pattern)?;
        }
        writeln!(f, "outputs: {}", self.outputs.join(", "))
    }
}
