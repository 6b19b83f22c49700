//! Error types for kestrel-engine

use kestrel_compiler::CompileError;
use kestrel_jit::BailoutError;
use kestrel_vm::{BytecodeError, VmError};
use thiserror::Error;

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Front-end error
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Baseline code generation error
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    /// Snapshot could not be turned into a baseline frame
    #[error("Deoptimization defect: {0}")]
    Bailout(#[from] BailoutError),

    /// Runtime error, including uncaught exceptions
    #[error(transparent)]
    Vm(#[from] VmError),

    /// No function with that name was defined
    #[error("ReferenceError: {0} is not defined")]
    UnknownFunction(String),

    /// Object literal form the harness cannot build
    #[error("Unsupported object expression `{0}`")]
    UnsupportedObject(String),
}

/// Result type using EngineError
pub type EngineResult<T> = Result<T, EngineError>;
