use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::handle::{CallableRef, HandleRef};

/// Dense multi-dimensional numeric array, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ProtocolError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ProtocolError::Shape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element at a full multi-index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0usize;
        for (i, (&ix, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            if ix >= dim {
                return None;
            }
            let stride: usize = self.shape[i + 1..].iter().product();
            flat += ix * stride;
        }
        self.data.get(flat).copied()
    }
}

/// A value as it crosses the process boundary.
///
/// Leaves are either fully serializable scalars/arrays, a [`HandleRef`] naming a
/// supervisor-side object, or a [`CallableRef`] naming a user function. Lists,
/// tuples and dicts are rewritten leaf by leaf; dict keys are always plain strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(NdArray),
    List(Vec<WireValue>),
    Tuple(Vec<WireValue>),
    Dict(BTreeMap<String, WireValue>),
    Handle(HandleRef),
    Callable(CallableRef),
}

impl WireValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireValue::Null => "null",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::Float(_) => "float",
            WireValue::Str(_) => "str",
            WireValue::Bytes(_) => "bytes",
            WireValue::Array(_) => "ndarray",
            WireValue::List(_) => "list",
            WireValue::Tuple(_) => "tuple",
            WireValue::Dict(_) => "dict",
            WireValue::Handle(_) => "handle",
            WireValue::Callable(_) => "callable",
        }
    }

    /// True when no leaf is a handle or a callable reference.
    pub fn is_plain(&self) -> bool {
        match self {
            WireValue::Handle(_) | WireValue::Callable(_) => false,
            WireValue::List(items) | WireValue::Tuple(items) => items.iter().all(Self::is_plain),
            WireValue::Dict(map) => map.values().all(Self::is_plain),
            _ => true,
        }
    }

    /// Every handle leaf, depth first.
    pub fn handles(&self) -> Vec<HandleRef> {
        let mut out = Vec::new();
        self.collect_handles(&mut out);
        out
    }

    fn collect_handles(&self, out: &mut Vec<HandleRef>) {
        match self {
            WireValue::Handle(h) => out.push(*h),
            WireValue::List(items) | WireValue::Tuple(items) => {
                items.iter().for_each(|v| v.collect_handles(out))
            }
            WireValue::Dict(map) => map.values().for_each(|v| v.collect_handles(out)),
            _ => {}
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Float(f) => Some(*f),
            WireValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for WireValue {
    fn from(v: bool) -> Self {
        WireValue::Bool(v)
    }
}

impl From<i64> for WireValue {
    fn from(v: i64) -> Self {
        WireValue::Int(v)
    }
}

impl From<f64> for WireValue {
    fn from(v: f64) -> Self {
        WireValue::Float(v)
    }
}

impl From<&str> for WireValue {
    fn from(v: &str) -> Self {
        WireValue::Str(v.to_string())
    }
}

impl From<String> for WireValue {
    fn from(v: String) -> Self {
        WireValue::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleId;

    #[test]
    fn ndarray_checks_shape() {
        assert!(NdArray::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(NdArray::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn ndarray_indexes_row_major() {
        let a = NdArray::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(a.get(&[1, 0]), Some(3.0));
        assert_eq!(a.get(&[0, 2]), Some(2.0));
        assert_eq!(a.get(&[2, 0]), None);
        assert_eq!(a.get(&[0]), None);
    }

    #[test]
    fn plain_values_have_no_handles() {
        let mut dict = BTreeMap::new();
        dict.insert("x".to_string(), WireValue::List(vec![1i64.into(), 2.5.into()]));
        let v = WireValue::Dict(dict);
        assert!(v.is_plain());
        assert!(v.handles().is_empty());
    }

    #[test]
    fn nested_handles_are_found() {
        let h = HandleRef::new(HandleId(42));
        let v = WireValue::Tuple(vec![
            WireValue::Null,
            WireValue::List(vec![WireValue::Handle(h)]),
        ]);
        assert!(!v.is_plain());
        assert_eq!(v.handles(), vec![h]);
    }

    #[test]
    fn wire_format_is_tagged() {
        let s = serde_json::to_string(&WireValue::Int(3)).unwrap();
        assert_eq!(s, r#"{"t":"int","v":3}"#);
        let null: WireValue = serde_json::from_str(r#"{"t":"null"}"#).unwrap();
        assert_eq!(null, WireValue::Null);
    }
}
