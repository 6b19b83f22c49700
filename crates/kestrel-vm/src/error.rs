//! VM errors and thrown values

use std::fmt;

use kestrel_ir::SourcePosition;
use thiserror::Error;

use crate::value::Value;

/// A thrown value in flight, with the position of its throw site
#[derive(Debug, Clone)]
pub struct PendingException {
    /// The thrown value
    pub value: Value,
    /// Position of the `throw` statement or throwing call
    pub position: SourcePosition,
}

impl PendingException {
    /// Create a pending exception
    pub fn new(value: Value, position: SourcePosition) -> Self {
        Self { value, position }
    }
}

impl fmt::Display for PendingException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.value, self.position)
    }
}

/// VM errors
#[derive(Debug, Error)]
pub enum VmError {
    /// A JavaScript exception propagating out of a function
    #[error("Uncaught {0}")]
    Exception(Box<PendingException>),

    /// A value thrown by native code; the calling instruction supplies the position
    #[error("Uncaught {0}")]
    Thrown(Value),

    /// Callee is not a function
    #[error("TypeError: {0} is not a function")]
    NotCallable(String),

    /// Call depth limit reached
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    /// Malformed bytecode or frame state
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Create an exception error
    pub fn exception(value: Value, position: SourcePosition) -> Self {
        Self::Exception(Box::new(PendingException::new(value, position)))
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Turn a throw reaching a call site into a catchable exception.
    ///
    /// Values thrown by native code take `position`; exceptions raised by
    /// compiled code keep their own. Other errors are not catchable and
    /// come back unchanged.
    pub fn into_pending(self, position: SourcePosition) -> Result<PendingException, VmError> {
        match self {
            Self::Exception(pending) => Ok(*pending),
            Self::Thrown(value) => Ok(PendingException::new(value, position)),
            Self::NotCallable(what) => Ok(PendingException::new(
                Value::error("TypeError", &format!("{what} is not a function")),
                position,
            )),
            other => Err(other),
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
