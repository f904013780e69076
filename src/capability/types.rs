//! Value and signature types for engine entry points.
//!
//! The engine ABI deals in integer handles, scalars, C strings and byte
//! buffers. These types describe entry point signatures and carry arguments
//! across the call boundary without interpreting their meaning.

use std::fmt;

/// Engine-assigned session identifier.
pub type SessionId = i64;

/// Opaque integer handle to an engine-managed resource.
pub type Handle = i32;

/// Sentinel stored in a proxy once its handle has been released.
pub const RELEASED_HANDLE: Handle = -1;

/// Value kinds supported for entry point parameters and return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// No value (status-only calls still return an integer code)
    Unit,
    /// Integer scalar; covers handles, codes and session ids
    Int,
    /// Floating point scalar
    Float,
    /// Null-terminated C string
    Str,
    /// Byte buffer passed as a pointer (length goes as a separate Int)
    Bytes,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::Unit => write!(f, "unit"),
            EngineType::Int => write!(f, "int"),
            EngineType::Float => write!(f, "float"),
            EngineType::Str => write!(f, "str"),
            EngineType::Bytes => write!(f, "bytes"),
        }
    }
}

/// A value passed to or returned from an engine entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    /// No value
    Unit,
    /// Integer scalar
    Int(i64),
    /// Floating point scalar
    Float(f64),
    /// Owned string
    Str(String),
    /// Owned buffer
    Bytes(Vec<u8>),
}

impl EngineValue {
    /// Get the type of this value.
    pub fn engine_type(&self) -> EngineType {
        match self {
            EngineValue::Unit => EngineType::Unit,
            EngineValue::Int(_) => EngineType::Int,
            EngineValue::Float(_) => EngineType::Float,
            EngineValue::Str(_) => EngineType::Str,
            EngineValue::Bytes(_) => EngineType::Bytes,
        }
    }

    /// Integer view of this value, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EngineValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float view of this value, if it is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            EngineValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of this value, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EngineValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Consume into an owned string, if this is one.
    pub fn into_string(self) -> Option<String> {
        match self {
            EngineValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for EngineValue {
    fn from(v: i64) -> Self {
        EngineValue::Int(v)
    }
}

impl From<i32> for EngineValue {
    fn from(v: i32) -> Self {
        EngineValue::Int(v as i64)
    }
}

impl From<f64> for EngineValue {
    fn from(v: f64) -> Self {
        EngineValue::Float(v)
    }
}

impl From<&str> for EngineValue {
    fn from(v: &str) -> Self {
        EngineValue::Str(v.to_string())
    }
}

impl From<&[u8]> for EngineValue {
    fn from(v: &[u8]) -> Self {
        EngineValue::Bytes(v.to_vec())
    }
}

/// Signature of an engine entry point.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Entry point symbol name
    pub name: String,
    /// Parameter types
    pub params: Vec<EngineType>,
    /// Return type
    pub ret: EngineType,
}

impl Signature {
    /// Create a new signature.
    pub fn new(name: impl Into<String>, params: Vec<EngineType>, ret: EngineType) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
        }
    }

    /// Build a signature whose parameter types are taken from concrete
    /// argument values. This is how the typed call helpers describe calls
    /// without a separate signature table.
    pub fn for_args(name: impl Into<String>, args: &[EngineValue], ret: EngineType) -> Self {
        Self {
            name: name.into(),
            params: args.iter().map(|a| a.engine_type()).collect(),
            ret,
        }
    }

    /// Validate an argument list against this signature.
    pub fn matches(&self, args: &[EngineValue]) -> bool {
        args.len() == self.params.len()
            && args
                .iter()
                .zip(self.params.iter())
                .all(|(a, t)| a.engine_type() == *t)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.ret, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")
    }
}
