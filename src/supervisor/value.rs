use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use panel_protocol::{NdArray, WireValue};

use super::object::ObjectRef;

pub type Kwargs = BTreeMap<String, Value>;

/// A value on the UI side of the boundary.
///
/// Every variant except [`Value::Object`] is "fully picklable": it crosses to a
/// worker by copy. Objects cross as handles.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(NdArray),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "ndarray",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Object(_) => "object",
        }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Python-like truthiness, used for flags set from user code.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::List(l) | Value::Tuple(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Copy of a value without objects, for persistence. `None` when an
    /// object is found anywhere inside.
    pub fn to_plain(&self) -> Option<WireValue> {
        Some(match self {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::Array(a) => WireValue::Array(a.clone()),
            Value::List(items) => WireValue::List(items.iter().map(Value::to_plain).collect::<Option<_>>()?),
            Value::Tuple(items) => WireValue::Tuple(items.iter().map(Value::to_plain).collect::<Option<_>>()?),
            Value::Dict(map) => WireValue::Dict(
                map.iter()
                    .map(|(k, v)| v.to_plain().map(|v| (k.clone(), v)))
                    .collect::<Option<_>>()?,
            ),
            Value::Object(_) => return None,
        })
    }

    /// Inverse of [`to_plain`](Self::to_plain). Handle and callable leaves have
    /// no meaning outside a live worker and come back as null.
    pub fn from_plain(value: WireValue) -> Self {
        match value {
            WireValue::Null | WireValue::Handle(_) | WireValue::Callable(_) => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::Array(a) => Value::Array(a),
            WireValue::List(items) => Value::List(items.into_iter().map(Value::from_plain).collect()),
            WireValue::Tuple(items) => Value::Tuple(items.into_iter().map(Value::from_plain).collect()),
            WireValue::Dict(map) => Value::Dict(map.into_iter().map(|(k, v)| (k, Value::from_plain(v))).collect()),
        }
    }

    /// Widget attributes come from the app document as JSON-shaped values.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Dict(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }

    /// Text shown by value widgets.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Str(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(a) => write!(f, "ndarray{:?}", a.shape),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Tuple(items) => {
                let mut t = f.debug_tuple("");
                for item in items {
                    t.field(item);
                }
                t.finish()
            }
            Value::Dict(map) => f.debug_map().entries(map).finish(),
            // an object may be mid-call, so never insist on borrowing it
            Value::Object(o) => match o.try_borrow() {
                Ok(obj) => f.write_str(&obj.repr()),
                Err(_) => f.write_str("<object>"),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_attrs_become_values() {
        let v = Value::from_json(&json!({"min": 0, "max": 2.5, "tags": ["a"]}));
        let Value::Dict(map) = v else { panic!("expected dict") };
        assert_eq!(map["min"], Value::Int(0));
        assert_eq!(map["max"], Value::Float(2.5));
        assert_eq!(map["tags"], Value::List(vec![Value::str("a")]));
    }

    #[test]
    fn plain_copy_round_trips() {
        let v = Value::List(vec![Value::Int(1), Value::Tuple(vec![Value::str("x"), Value::Null])]);
        let plain = v.to_plain().unwrap();
        assert_eq!(Value::from_plain(plain), v);
    }

    #[test]
    fn int_and_float_compare_numerically() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::str("2"));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.truthy());
        assert!(Value::Int(3).truthy());
        assert!(!Value::str("").truthy());
    }
}
