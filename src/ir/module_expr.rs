use super::stmt::Stmt;
use super::tensor::Tensor;

/// Ordered list of independent statement lists, one per tensor stage until
/// [`ModuleExpr::merge`] folds them into a single body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleExpr {
    exprs: Vec<Vec<Stmt>>,
}

impl ModuleExpr {
    pub fn new(exprs: Vec<Vec<Stmt>>) -> Self {
        Self { exprs }
    }

    /// One expression per non-placeholder tensor, in the given order.
    pub fn from_tensors<'a>(tensors: impl IntoIterator<Item = &'a Tensor>) -> Self {
        let exprs = tensors
            .into_iter()
            .filter_map(|t| t.to_stmt())
            .map(|s| vec![s])
            .collect();
        Self { exprs }
    }

    pub fn exprs(&self) -> &[Vec<Stmt>] {
        &self.exprs
    }

    pub(crate) fn exprs_mut(&mut self) -> &mut Vec<Vec<Stmt>> {
        &mut self.exprs
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Concatenates all expressions into one, preserving order.
    pub fn merge(&mut self) {
        if self.exprs.len() <= 1 {
            return;
        }
        let merged: Vec<Stmt> = self.exprs.drain(..).flatten().collect();
        self.exprs.push(merged);
    }

    /// Splits every expression back into one expression per schedule block.
    /// Statements between blocks, such as barriers, stay with the preceding
    /// block.
    pub fn split_blocks(&mut self) {
        let mut out: Vec<Vec<Stmt>> = Vec::new();
        for stmt in self.exprs.drain(..).flatten() {
            let starts_block = matches!(stmt, Stmt::ScheduleBlock { .. });
            if starts_block || out.is_empty() {
                out.push(vec![stmt]);
            } else if let Some(last) = out.last_mut() {
                last.push(stmt);
            }
        }
        self.exprs = out;
    }

    pub fn into_exprs(self) -> Vec<Vec<Stmt>> {
        self.exprs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::exp;
    use crate::ir::DType;

    #[test]
    fn test_merge_then_split() {
        let a = Tensor::placeholder("A", vec![8], DType::F32);
        let b = Tensor::compute("B", vec![8], DType::F32, |ix| exp(a.load(ix.to_vec())));
        let c = Tensor::compute("C", vec![8], DType::F32, |ix| b.load(ix.to_vec()));
        let mut module = ModuleExpr::from_tensors([&a, &b, &c]);
        assert_eq!(module.len(), 2);
        module.merge();
        assert_eq!(module.len(), 1);
        module.exprs_mut()[0].insert(1, Stmt::SyncThreads);
        module.split_blocks();
        assert_eq!(module.len(), 2);
        assert_eq!(module.exprs()[0].len(), 2);
        assert!(matches!(module.exprs()[0][1], Stmt::SyncThreads));
    }
}
