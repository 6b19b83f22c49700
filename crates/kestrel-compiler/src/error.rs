//! Compilation errors

use kestrel_ir::SourcePosition;
use thiserror::Error;

/// Front-end errors
#[derive(Debug, Error)]
pub enum CompileError {
    /// Diagnostics reported by oxc, joined
    #[error("Parse error: {0}")]
    Parse(String),

    /// Early error found while lowering, such as a bad `continue` target
    #[error("SyntaxError: {message} ({position})")]
    Syntax {
        /// Error message
        message: String,
        /// Where the offending statement starts
        position: SourcePosition,
    },

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Source does not contain the expected function form
    #[error("Expected {0}")]
    Expected(&'static str),

    /// Too many frame slots
    #[error("Too many frame slots (max 65535)")]
    TooManySlots,

    /// Invalid assignment target
    #[error("Invalid assignment target")]
    InvalidAssignmentTarget,
}

impl CompileError {
    /// Create a syntax error
    pub fn syntax(message: impl Into<String>, position: SourcePosition) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
        }
    }

    /// Create an unsupported error
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported(feature.into())
    }
}

/// Result type for compilation
pub type CompileResult<T> = Result<T, CompileError>;
