//! Values carried by handles
//!
//! The kind of a handle is decided once, when the handle is built, and is
//! then matched on instead of probed dynamically.

use crate::engine::NativeRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of an error value raised by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Thrown while running a script
    Execution,
    /// Raised while compiling a script
    Compiler,
    /// Raised by the engine itself
    Internal,
}

/// Category of an object value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Plain object
    Object,
    /// Array
    Array,
    /// Callable object
    Function,
    /// Regular expression
    RegExp,
    /// Boxed boolean
    BooleanObject,
    /// Boxed number
    NumberObject,
    /// Boxed string
    StringObject,
}

/// Value a handle refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HandleValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean primitive
    Boolean(bool),
    /// 32-bit integer
    Integer(i32),
    /// Double-precision number
    Number(f64),
    /// String primitive
    String(String),
    /// Date, as milliseconds since the Unix epoch
    Date(f64),
    /// Error raised by the engine
    Error {
        /// Where the error came from
        kind: ErrorKind,
        /// Error text
        message: String,
    },
    /// Any object
    Object(ObjectKind),
}

impl HandleValue {
    /// Build an execution error value
    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::Error {
            kind: ErrorKind::Execution,
            message: message.into(),
        }
    }

    /// Short type name, as used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Error { .. } => "error",
            Self::Object(ObjectKind::Array) => "array",
            Self::Object(ObjectKind::Function) => "function",
            Self::Object(ObjectKind::RegExp) => "regexp",
            Self::Object(_) => "object",
        }
    }

    /// True for object values, including boxed primitives
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// True for `undefined` and `null`
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// True for error values
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Numeric value of integer, number and date values
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(f64::from(*v)),
            Self::Number(v) | Self::Date(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Date(ms) => write!(f, "[date {ms}]"),
            Self::Error { kind, message } => write!(f, "{kind:?}Error: {message}"),
            Self::Object(kind) => write!(f, "[object {kind:?}]"),
        }
    }
}

impl From<bool> for HandleValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for HandleValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for HandleValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for HandleValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for HandleValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// What a handle is requested for
#[derive(Debug, Clone, PartialEq)]
pub enum HandleSource {
    /// An object the engine already owns
    Native(NativeRef),
    /// A value the engine must materialize first
    Value(HandleValue),
}

impl From<NativeRef> for HandleSource {
    fn from(native: NativeRef) -> Self {
        Self::Native(native)
    }
}

impl From<HandleValue> for HandleSource {
    fn from(value: HandleValue) -> Self {
        Self::Value(value)
    }
}

macro_rules! source_from_primitive {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HandleSource {
                fn from(value: $ty) -> Self {
                    Self::Value(HandleValue::from(value))
                }
            }
        )*
    };
}

source_from_primitive!(bool, i32, f64, &str, String);
