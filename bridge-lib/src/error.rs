use std::{fmt, result};

use thiserror::Error;

use crate::handle::HandleRef;
use crate::types::CallMode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The operation ran to completion and reported failure as data.
    #[error("{0}")]
    Logic(#[from] LogicError),

    /// Native code panicked; the state of any resource it touched is suspect.
    #[error("boundary trap in `{operation}`: {message}")]
    BoundaryTrap { operation: String, message: String },

    #[error("handle lifecycle error: {0}")]
    HandleLifecycle(#[from] HandleLifecycleError),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation `{operation}` cannot be called in {mode} mode")]
    ModeMismatch { operation: String, mode: CallMode },

    #[error("token {0} is already in flight")]
    TokenInUse(u64),

    #[error("stream `{0}` is already open")]
    StreamAlreadyOpen(String),

    #[error("bridge is not running")]
    NotRunning,

    /// A string, buffer or sequence longer than a frame length can express.
    #[error("length {0} does not fit a frame")]
    FrameTooLarge(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn config<T: fmt::Display>(inner: T) -> Self {
        Self::Config(inner.to_string())
    }
    pub fn runtime<T: fmt::Display>(inner: T) -> Self {
        Self::Runtime(inner.to_string())
    }
    pub fn logic<T: fmt::Display>(inner: T) -> Self {
        Self::Logic(LogicError::new(inner))
    }
    pub(crate) fn trap(operation: &str, message: String) -> Self {
        Self::BoundaryTrap {
            operation: operation.to_owned(),
            message,
        }
    }

    /// Decode and lifecycle errors are programmer errors and must never be
    /// retried automatically.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::HandleLifecycle(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Logic(LogicError::new(format!("{:#}", err)))
    }
}

/// A failure reported by a native operation as ordinary data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LogicError {
    pub message: String,
}

impl LogicError {
    pub fn new<T: fmt::Display>(message: T) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: String, found: &'static str },

    #[error("struct `{name}` declares {expected} fields but the wire array has {found}")]
    Arity {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("ordinal {ordinal} is out of range for enum `{name}` with {variants} variants")]
    Ordinal {
        name: &'static str,
        ordinal: u32,
        variants: u32,
    },

    #[error("integer {value} does not fit in {target}")]
    IntRange { value: i128, target: &'static str },

    #[error("handle {handle} does not refer to a `{expected}`")]
    HandleType {
        handle: HandleRef,
        expected: &'static str,
    },

    #[error("`{operation}` is missing argument {index}")]
    MissingArgument { operation: String, index: usize },

    #[error("`{operation}` takes {expected} arguments but was given {found}")]
    TooManyArguments {
        operation: String,
        expected: usize,
        found: usize,
    },

    #[error("frame truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown wire tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid utf-8 string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("frame nesting exceeds {0} levels")]
    TooDeep(usize),
}

impl DecodeError {
    pub(crate) fn mismatch<T: fmt::Display>(expected: T, found: &'static str) -> Self {
        Self::Mismatch {
            expected: expected.to_string(),
            found,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleLifecycleError {
    #[error("handle {0} was already freed")]
    Stale(HandleRef),
    #[error("handle {0} was never issued")]
    Unknown(HandleRef),
}
