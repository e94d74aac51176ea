use super::stmt::{ForKind, Stmt};
use super::tensor::MemoryScope;
use super::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceApi {
    Host,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: ArgKind,
}

/// Buffer allocated inside the function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempBuffer {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub scope: MemoryScope,
}

impl TempBuffer {
    pub fn size_in_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_in_bytes()
    }
}

/// Lowered body of one fusion group.
///
/// Arguments are ordered inputs first, then outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunc {
    pub name: String,
    pub args: Vec<Argument>,
    pub temp_buffers: Vec<TempBuffer>,
    pub body: Vec<Stmt>,
    pub device_api: DeviceApi,
}

impl LoweredFunc {
    pub fn inputs(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| a.kind == ArgKind::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| a.kind == ArgKind::Output)
    }

    /// Schedule blocks in body order.
    pub fn block_names(&self) -> Vec<String> {
        self.body.iter().flat_map(|s| s.block_names()).collect()
    }

    pub fn find_loop(&self, var: &str) -> Option<&Stmt> {
        self.body.iter().find_map(|s| s.find_loop(var))
    }

    /// Execution attributes of every loop in the body, in pre-order.
    pub fn loop_kinds(&self) -> Vec<ForKind> {
        let mut kinds = Vec::new();
        for s in &self.body {
            s.walk(&mut |st| {
                if let Stmt::For { kind, .. } = st {
                    kinds.push(*kind);
                }
            });
        }
        kinds
    }

    pub fn has_sync(&self) -> bool {
        let mut found = false;
        for s in &self.body {
            s.walk(&mut |st| found |= matches!(st, Stmt::SyncThreads));
        }
        found
    }

    pub fn temp_bytes(&self, scope: MemoryScope) -> usize {
        self.temp_buffers
            .iter()
            .filter(|b| b.scope == scope)
            .map(TempBuffer::size_in_bytes)
            .sum()
    }
}
