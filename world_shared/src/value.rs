//! Tagged values for call arguments and entity attributes.
//!
//! Call arguments travel as `Vec<Value>`. They are validated once, where they
//! cross the serialization boundary, and type-checked by the receiving
//! behavior through [`ArgsExt`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{WorldError, WorldResult};
use crate::id::EntityId;

/// Attribute tree root: a map of named values.
pub type Attrs = BTreeMap<String, Value>;

/// A primitive, list or map value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_entity_id(&self) -> Option<EntityId> {
        self.as_str().and_then(|s| s.parse().ok())
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Rejects values that cannot survive serialization (non-finite floats).
    pub fn validate(&self) -> WorldResult<()> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(WorldError::InvalidArgument(format!(
                "non-finite float {f}"
            ))),
            Value::List(items) => items.iter().try_for_each(Value::validate),
            Value::Map(map) => map.values().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }
}

/// Validates every argument of a call.
pub fn validate_args(args: &[Value]) -> WorldResult<()> {
    args.iter().try_for_each(Value::validate)
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

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
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

impl From<EntityId> for Value {
    fn from(v: EntityId) -> Self {
        Value::Str(v.to_hex())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// Typed positional access to call arguments.
pub trait ArgsExt {
    fn value(&self, idx: usize) -> WorldResult<&Value>;
    fn int(&self, idx: usize) -> WorldResult<i64>;
    fn float(&self, idx: usize) -> WorldResult<f64>;
    fn boolean(&self, idx: usize) -> WorldResult<bool>;
    fn str(&self, idx: usize) -> WorldResult<&str>;
    fn entity(&self, idx: usize) -> WorldResult<EntityId>;
}

fn mismatch(idx: usize, want: &str, got: &Value) -> WorldError {
    WorldError::InvalidArgument(format!("arg {idx}: expected {want}, got {}", got.kind()))
}

impl ArgsExt for [Value] {
    fn value(&self, idx: usize) -> WorldResult<&Value> {
        self.get(idx)
            .ok_or_else(|| WorldError::InvalidArgument(format!("missing arg {idx}")))
    }

    fn int(&self, idx: usize) -> WorldResult<i64> {
        let v = self.value(idx)?;
        v.as_int().ok_or_else(|| mismatch(idx, "int", v))
    }

    fn float(&self, idx: usize) -> WorldResult<f64> {
        let v = self.value(idx)?;
        v.as_float().ok_or_else(|| mismatch(idx, "float", v))
    }

    fn boolean(&self, idx: usize) -> WorldResult<bool> {
        let v = self.value(idx)?;
        v.as_bool().ok_or_else(|| mismatch(idx, "bool", v))
    }

    fn str(&self, idx: usize) -> WorldResult<&str> {
        let v = self.value(idx)?;
        v.as_str().ok_or_else(|| mismatch(idx, "str", v))
    }

    fn entity(&self, idx: usize) -> WorldResult<EntityId> {
        let v = self.value(idx)?;
        v.as_entity_id().ok_or_else(|| mismatch(idx, "entity id", v))
    }
}
