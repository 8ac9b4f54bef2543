use bytes::Bytes;
use std::collections::BTreeMap;

/// A dynamically typed bencode value.
///
/// KRPC argument dictionaries are heterogeneous on the wire, so decoded
/// messages pass through this tagged variant before the typed accessors
/// pull out individual fields. Dictionary keys are raw byte strings kept
/// in a `BTreeMap` so re-encoding preserves the canonical key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer (`i...e`).
    Int(i64),
    /// A byte string, not necessarily UTF-8 (`<len>:<bytes>`).
    Bytes(Bytes),
    /// An ordered list (`l...e`).
    List(Vec<Value>),
    /// A dictionary with byte string keys (`d...e`).
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Builds a byte string value from a UTF-8 string.
    pub fn str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Builds a byte string value from a byte slice.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as `&str` when it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when the value is not a dictionary or the
    /// key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
