use std::fmt;

use crate::types::PropId;

/// Homogeneous array property payload.
#[derive(Clone, Debug, PartialEq)]
pub enum PropArray {
    /// Array of booleans.
    Bool(Vec<bool>),
    /// Array of 64-bit signed integers.
    Int(Vec<i64>),
    /// Array of 64-bit floating point numbers.
    Float(Vec<f64>),
    /// Array of strings.
    Str(Vec<String>),
}

impl PropArray {
    /// Number of elements in the array.
    pub fn len(&self) -> usize {
        match self {
            PropArray::Bool(v) => v.len(),
            PropArray::Int(v) => v.len(),
            PropArray::Float(v) => v.len(),
            PropArray::Str(v) => v.len(),
        }
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Property value with owned data.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValueOwned {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Homogeneous array.
    Array(PropArray),
}

impl fmt::Display for PropValueOwned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValueOwned::Bool(v) => write!(f, "{v}"),
            PropValueOwned::Int(v) => write!(f, "{v}"),
            PropValueOwned::Float(v) => write!(f, "{v}"),
            PropValueOwned::Str(v) => write!(f, "{v}"),
            PropValueOwned::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            PropValueOwned::Array(v) => write!(f, "array(len={})", v.len()),
        }
    }
}

impl From<i64> for PropValueOwned {
    fn from(value: i64) -> Self {
        PropValueOwned::Int(value)
    }
}

impl From<bool> for PropValueOwned {
    fn from(value: bool) -> Self {
        PropValueOwned::Bool(value)
    }
}

impl From<f64> for PropValueOwned {
    fn from(value: f64) -> Self {
        PropValueOwned::Float(value)
    }
}

impl From<&str> for PropValueOwned {
    fn from(value: &str) -> Self {
        PropValueOwned::Str(value.to_owned())
    }
}

impl From<String> for PropValueOwned {
    fn from(value: String) -> Self {
        PropValueOwned::Str(value)
    }
}

/// A decoded property: key id plus typed value.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    /// The property key identifier.
    pub key: PropId,
    /// The property value.
    pub value: PropValueOwned,
}

impl Property {
    /// Creates a new property.
    pub fn new(key: PropId, value: impl Into<PropValueOwned>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}
