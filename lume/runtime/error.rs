use std::{error::Error, fmt};

use crate::gc::{AllocError, GcColor, ObjectKind};

use super::{coroutine::ThreadStatus, value::ValueKind};

pub type LuaResult<T> = Result<T, LuaError>;

/// Errors raised by the runtime core
#[derive(Clone, Debug, PartialEq)]
pub enum LuaError {
    /// The memory hook refused an allocation, even after an emergency collection
    OutOfMemory,
    /// A coroutine exceeded its value stack or call frame limit
    StackOverflow,
    /// A coroutine overflowed again while handling a stack overflow
    ErrorHandlerOverflow,
    /// Too many nested native calls
    NativeCallOverflow,
    InvalidConversion(ConversionError),
    /// Attempt to use nil or NaN as a table key
    InvalidKey(InvalidKeyKind),
    /// A black object refers to a white one at the end of marking
    CollectorInvariantViolation {
        kind: ObjectKind,
        color: GcColor,
        child_kind: ObjectKind,
        child_color: GcColor,
    },
    /// A live object refers to a freed slot
    DanglingReference { kind: ObjectKind },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidKeyKind {
    Nil,
    NaN,
}

/// Failed conversion of a value to a Rust number
#[derive(Clone, Debug, PartialEq)]
pub enum ConversionError {
    NotANumber { from: ValueKind },
    NotAnInteger(f64),
    OutOfRange { value: f64, target: &'static str },
}

impl LuaError {
    /// The coroutine status this error leaves behind
    pub fn status(&self) -> ThreadStatus {
        match self {
            LuaError::OutOfMemory => ThreadStatus::ErrMem,
            LuaError::ErrorHandlerOverflow => ThreadStatus::ErrErr,
            _ => ThreadStatus::ErrRun,
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::OutOfMemory => f.write_str("not enough memory"),
            LuaError::StackOverflow => f.write_str("stack overflow"),
            LuaError::ErrorHandlerOverflow => f.write_str("error in error handling"),
            LuaError::NativeCallOverflow => f.write_str("C stack overflow"),
            LuaError::InvalidConversion(error) => write!(f, "{error}"),
            LuaError::InvalidKey(InvalidKeyKind::Nil) => f.write_str("table index is nil"),
            LuaError::InvalidKey(InvalidKeyKind::NaN) => f.write_str("table index is NaN"),
            LuaError::CollectorInvariantViolation { kind, color, child_kind, child_color } => {
                write!(
                    f,
                    "collector invariant violated: {} ({:?}) refers to {} ({:?})",
                    kind.name(),
                    color,
                    child_kind.name(),
                    child_color
                )
            }
            LuaError::DanglingReference { kind } => {
                write!(f, "{} refers to a collected object", kind.name())
            }
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::NotANumber { from } => write!(f, "number expected, got {from}"),
            ConversionError::NotAnInteger(value) => {
                write!(f, "number {value} has no integer representation")
            }
            ConversionError::OutOfRange { value, target } => {
                write!(f, "number {value} is out of range for {target}")
            }
        }
    }
}

impl Error for LuaError {}

impl Error for ConversionError {}

impl From<AllocError> for LuaError {
    fn from(_: AllocError) -> Self {
        LuaError::OutOfMemory
    }
}

impl From<ConversionError> for LuaError {
    fn from(error: ConversionError) -> Self {
        LuaError::InvalidConversion(error)
    }
}
