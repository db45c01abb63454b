// Dynamic values carried in positional parameters, property bags, RPC
// arguments, and synchronization snapshots.
//
// `Value` is deliberately small: the scalar kinds the synchronization engine
// compares with tolerance (floats, 2/3-vectors, quaternions), the discrete
// kinds compared exactly, and three containers. `Table` is a positional
// (u8-keyed) map used for nested structures such as instantiation events and
// sync batches; `Map` is a string-keyed property bag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ActorId, ViewId};

/// Positional fields of an operation, response, or event.
pub type Params = BTreeMap<u8, Value>;

/// String-keyed property bag (room or actor properties).
pub type Properties = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    /// Rotation as `[x, y, z, w]`.
    Quaternion([f32; 4]),
    Array(Vec<Value>),
    Map(Properties),
    Table(Params),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer narrowed to `i32`; `None` if absent or out of range.
    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|i| i32::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Properties> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Params> {
        match self {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_actor(&self) -> Option<ActorId> {
        self.as_i32().map(ActorId)
    }

    pub fn as_view(&self) -> Option<ViewId> {
        self.as_i32().map(ViewId)
    }

    /// Short kind name, used in log lines and dispatch diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Vector2(_) => "vector2",
            Value::Vector3(_) => "vector3",
            Value::Quaternion(_) => "quaternion",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Table(_) => "table",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f64::from(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<ActorId> for Value {
    fn from(id: ActorId) -> Self {
        Value::Int(i64::from(id.0))
    }
}

impl From<ViewId> for Value {
    fn from(id: ViewId) -> Self {
        Value::Int(i64::from(id.0))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Typed accessors over a positional parameter map. Every accessor returns
/// `None` both for a missing key and for a value of the wrong kind, so
/// decoders can treat "absent" and "malformed" uniformly.
pub trait ParamsExt {
    fn value(&self, key: u8) -> Option<&Value>;

    fn int(&self, key: u8) -> Option<i64> {
        self.value(key).and_then(Value::as_i64)
    }

    fn int32(&self, key: u8) -> Option<i32> {
        self.value(key).and_then(Value::as_i32)
    }

    fn boolean(&self, key: u8) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    fn string(&self, key: u8) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    fn array(&self, key: u8) -> Option<&[Value]> {
        self.value(key).and_then(Value::as_array)
    }

    fn map(&self, key: u8) -> Option<&Properties> {
        self.value(key).and_then(Value::as_map)
    }

    fn table(&self, key: u8) -> Option<&Params> {
        self.value(key).and_then(Value::as_table)
    }

    fn actor(&self, key: u8) -> Option<ActorId> {
        self.value(key).and_then(Value::as_actor)
    }
}

impl ParamsExt for Params {
    fn value(&self, key: u8) -> Option<&Value> {
        self.get(&key)
    }
}
