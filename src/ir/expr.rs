//! Scalar and index expressions.

use rustc_hash::FxHashMap;

use super::DType;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

impl Literal {
    pub fn dtype(&self) -> DType {
        match self {
            Literal::F32(_) => DType::F32,
            Literal::F64(_) => DType::F64,
            Literal::I32(_) => DType::I32,
            Literal::I64(_) => DType::I64,
            Literal::Bool(_) => DType::Bool,
        }
    }

    /// Converts an `f64` into a literal of the given dtype.
    pub fn from_f64(value: f64, dtype: DType) -> Self {
        match dtype {
            DType::F32 => Literal::F32(value as f32),
            DType::F64 => Literal::F64(value),
            DType::I32 => Literal::I32(value as i32),
            DType::I64 => Literal::I64(value as i64),
            DType::Bool => Literal::Bool(value != 0.0),
        }
    }

    fn as_index(&self) -> Option<i64> {
        match *self {
            Literal::I32(v) => Some(v as i64),
            Literal::I64(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Max,
    Min,
    Lt,
    And,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Lt => "<",
            BinaryOp::And => "&&",
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, BinaryOp::Max | BinaryOp::Min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Sqrt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Literal),
    /// Loop variable or scalar argument.
    Var(String),
    Load {
        tensor: String,
        indices: Vec<Expr>,
    },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Cast(DType, Box<Expr>),
    Select {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

// Convenience free functions for expression construction

macro_rules! impl_binary_helper {
    ($fn_name:ident, $variant:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $fn_name(a: Expr, b: Expr) -> Expr {
            Expr::Binary(BinaryOp::$variant, Box::new(a), Box::new(b))
        }
    };
}

macro_rules! impl_unary_helper {
    ($fn_name:ident, $variant:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $fn_name(a: Expr) -> Expr {
            Expr::Unary(UnaryOp::$variant, Box::new(a))
        }
    };
}

impl_binary_helper!(max, Max, "max(a, b)");
impl_binary_helper!(min, Min, "min(a, b)");
impl_binary_helper!(lt, Lt, "a < b");
impl_binary_helper!(and, And, "a && b");

impl_unary_helper!(neg, Neg, "-a");
impl_unary_helper!(exp, Exp, "exp(a)");
impl_unary_helper!(sqrt, Sqrt, "sqrt(a)");

pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

/// Index constant.
pub fn idx(value: usize) -> Expr {
    Expr::Const(Literal::I32(value as i32))
}

pub fn load(tensor: impl Into<String>, indices: Vec<Expr>) -> Expr {
    Expr::Load {
        tensor: tensor.into(),
        indices,
    }
}

pub fn cast(a: Expr, dtype: DType) -> Expr {
    Expr::Cast(dtype, Box::new(a))
}

pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Select {
        cond: Box::new(cond),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    }
}

macro_rules! impl_std_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::Binary(BinaryOp::$variant, Box::new(self), Box::new(rhs))
            }
        }
    };
}

impl_std_op!(Add, add, Add);
impl_std_op!(Sub, sub, Sub);
impl_std_op!(Mul, mul, Mul);
impl_std_op!(Div, div, Div);
impl_std_op!(Rem, rem, Rem);

/// Splits a flat row-major index into one index per dimension.
pub fn unflatten(flat: Expr, dims: &[usize]) -> Vec<Expr> {
    let mut out = Vec::with_capacity(dims.len());
    let mut stride: usize = dims.iter().product();
    for (i, &d) in dims.iter().enumerate() {
        stride /= d.max(1);
        let q = if stride == 1 {
            flat.clone()
        } else {
            flat.clone() / idx(stride)
        };
        out.push(if i == 0 { q } else { q % idx(d) });
    }
    out.into_iter().map(|e| e.simplify()).collect()
}

/// Row-major flattening of `indices` over `dims`.
pub fn flatten(indices: &[Expr], dims: &[usize]) -> Expr {
    let mut acc = idx(0);
    for (index, &d) in indices.iter().zip(dims) {
        acc = acc * idx(d) + index.clone();
    }
    acc.simplify()
}

impl Expr {
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Replaces every variable found in `map`.
    pub fn substitute(&self, map: &FxHashMap<String, Expr>) -> Expr {
        match self {
            Expr::Var(v) => map.get(v).cloned().unwrap_or_else(|| self.clone()),
            Expr::Const(_) => self.clone(),
            _ => self.map_children(|e| e.substitute(map)),
        }
    }

    /// Replaces loads from `tensor` with `f(indices)`.
    pub fn replace_loads(&self, tensor: &str, f: &dyn Fn(&[Expr]) -> Expr) -> Expr {
        match self {
            Expr::Load {
                tensor: name,
                indices,
            } => {
                let indices: Vec<Expr> = indices.iter().map(|i| i.replace_loads(tensor, f)).collect();
                if name == tensor {
                    f(&indices)
                } else {
                    load(name.clone(), indices)
                }
            }
            Expr::Var(_) | Expr::Const(_) => self.clone(),
            _ => self.map_children(|e| e.replace_loads(tensor, f)),
        }
    }

    fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Const(_) | Expr::Var(_) => self.clone(),
            Expr::Load { tensor, indices } => load(tensor.clone(), indices.iter().map(f).collect()),
            Expr::Binary(op, a, b) => Expr::Binary(*op, Box::new(f(a)), Box::new(f(b))),
            Expr::Unary(op, a) => Expr::Unary(*op, Box::new(f(a))),
            Expr::Cast(dtype, a) => Expr::Cast(*dtype, Box::new(f(a))),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => select(f(cond), f(then), f(otherwise)),
        }
    }

    /// Calls `visit` on every tensor load, outermost first.
    pub fn for_each_load(&self, visit: &mut dyn FnMut(&str, &[Expr])) {
        match self {
            Expr::Load { tensor, indices } => {
                visit(tensor, indices);
                for i in indices {
                    i.for_each_load(visit);
                }
            }
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Binary(_, a, b) => {
                a.for_each_load(visit);
                b.for_each_load(visit);
            }
            Expr::Unary(_, a) | Expr::Cast(_, a) => a.for_each_load(visit),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.for_each_load(visit);
                then.for_each_load(visit);
                otherwise.for_each_load(visit);
            }
        }
    }

    /// Folds integer index arithmetic with constant operands.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Binary(op, a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                let ca = const_index(&a);
                let cb = const_index(&b);
                if let (Some(x), Some(y)) = (ca, cb) {
                    let folded = match op {
                        BinaryOp::Add => Some(x + y),
                        BinaryOp::Sub => Some(x - y),
                        BinaryOp::Mul => Some(x * y),
                        BinaryOp::Div if y != 0 => Some(x / y),
                        BinaryOp::Rem if y != 0 => Some(x % y),
                        BinaryOp::Max => Some(x.max(y)),
                        BinaryOp::Min => Some(x.min(y)),
                        _ => None,
                    };
                    if let Some(v) = folded {
                        return Expr::Const(Literal::I32(v as i32));
                    }
                }
                match (op, ca, cb) {
                    (BinaryOp::Add, Some(0), _) => b,
                    (BinaryOp::Add | BinaryOp::Sub, _, Some(0)) => a,
                    (BinaryOp::Mul, Some(0), _) | (BinaryOp::Mul, _, Some(0)) => idx(0),
                    (BinaryOp::Mul, Some(1), _) => b,
                    (BinaryOp::Mul | BinaryOp::Div, _, Some(1)) => a,
                    (BinaryOp::Rem, _, Some(1)) => idx(0),
                    _ => Expr::Binary(*op, Box::new(a), Box::new(b)),
                }
            }
            Expr::Const(_) | Expr::Var(_) => self.clone(),
            _ => self.map_children(|e| e.simplify()),
        }
    }
}

fn const_index(e: &Expr) -> Option<i64> {
    match e {
        Expr::Const(l) => l.as_index(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simplify_folds_identities() {
        let e = var("i") * idx(1) + idx(0);
        assert_eq!(e.simplify(), var("i"));
        assert_eq!((idx(6) / idx(2)).simplify(), idx(3));
        assert_eq!((var("i") % idx(1)).simplify(), idx(0));
    }

    #[test]
    fn test_unflatten_and_flatten() {
        let parts = unflatten(var("f"), &[4, 8]);
        assert_eq!(parts, vec![var("f") / idx(8), var("f") % idx(8)]);
        let flat = flatten(&[var("a"), var("b")], &[4, 8]);
        assert_eq!(flat, var("a") * idx(8) + var("b"));
    }

    #[test]
    fn test_substitute_and_replace_loads() {
        let mut map = FxHashMap::default();
        map.insert("i".to_string(), var("j") + idx(1));
        let e = load("A", vec![var("i")]).substitute(&map);
        assert_eq!(e, load("A", vec![var("j") + idx(1)]));

        let inlined = (load("T", vec![var("k")]) + load("B", vec![var("k")]))
            .replace_loads("T", &|ix: &[Expr]| exp(load("A", ix.to_vec())));
        assert_eq!(
            inlined,
            exp(load("A", vec![var("k")])) + load("B", vec![var("k")])
        );
    }
}
