//! Value representation
//!
//! [`Value`] is what lives on the interpreter stack and in static fields; strings
//! are handles into the collected heap. [`HostValue`] is the owned, copy-only
//! form exchanged with the embedding host: nothing the host holds ever points
//! into the heap.

use super::gc::GcRef;
use std::fmt;

/// A VM value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    I32(i32),
    /// 64-bit float
    F64(f64),
    /// Heap string
    Str(GcRef),
}

impl Value {
    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::I32(_) => ValueKind::Int,
            Value::F64(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::String,
        }
    }

    /// Heap reference held by this value, if any
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        match self {
            Value::Str(r) => Some(*r),
            _ => None,
        }
    }
}

/// Kind of a value, used for static field typing and mismatch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Null
    Null,
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Float
    Float,
    /// String
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
        };
        f.write_str(name)
    }
}

/// A value owned by the host
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i32),
    /// Float
    Float(f64),
    /// String (copied out of the heap)
    Str(String),
}

impl HostValue {
    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            HostValue::Null => ValueKind::Null,
            HostValue::Bool(_) => ValueKind::Bool,
            HostValue::Int(_) => ValueKind::Int,
            HostValue::Float(_) => ValueKind::Float,
            HostValue::Str(_) => ValueKind::String,
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i32> {
        match self {
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload (integers widen)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(v) => Some(*v),
            HostValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is null
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => f.write_str("null"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Int(i) => write!(f, "{i}"),
            HostValue::Float(x) => write!(f, "{x}"),
            HostValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}
