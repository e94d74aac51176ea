use std::collections::BTreeMap;
use std::fmt;

use crate::error::StrategyError;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Ints(v) => write!(f, "{v:?}"),
            AttrValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

/// Node attributes, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap(BTreeMap<String, AttrValue>);

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, StrategyError> {
        match self.get(name) {
            None => Ok(default),
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(other) => Err(invalid(name, other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f32, StrategyError> {
        match self.get(name) {
            None => Err(StrategyError::MissingAttr(name.to_string())),
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f32),
            Some(other) => Err(invalid(name, other)),
        }
    }

    pub fn ints(&self, name: &str) -> Result<Vec<i64>, StrategyError> {
        match self.get(name) {
            None => Err(StrategyError::MissingAttr(name.to_string())),
            Some(AttrValue::Ints(v)) => Ok(v.clone()),
            Some(AttrValue::Int(v)) => Ok(vec![*v]),
            Some(other) => Err(invalid(name, other)),
        }
    }

    pub fn ints_or_empty(&self, name: &str) -> Result<Vec<i64>, StrategyError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(_) => self.ints(name),
        }
    }
}

fn invalid(name: &str, value: &AttrValue) -> StrategyError {
    StrategyError::InvalidAttr {
        name: name.to_string(),
        detail: format!("unexpected value {value}"),
    }
}
