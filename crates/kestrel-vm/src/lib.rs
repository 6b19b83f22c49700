//! # Kestrel VM
//!
//! The baseline (unoptimized) tier: runtime values, slot bytecode, the
//! bytecode generator and the interpreter.
//!
//! Optimized code falls back to this tier when a speculation fails. The
//! interpreter's frame is just the slot vector plus the handler and
//! completion stacks, so an optimized frame snapshot converts directly into
//! a [`ResumeState`].

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bytecode;
pub mod callable;
pub mod codegen;
pub mod error;
pub mod interpreter;
pub mod ops;
pub mod value;

pub use bytecode::{BytecodeFunction, HandlerEntry, Instruction, LabelEntry};
pub use callable::{CallContext, Callable, NativeFunction};
pub use codegen::{BytecodeError, BytecodeGenerator};
pub use error::{PendingException, VmError, VmResult};
pub use interpreter::{Completion, HandlerFrame, Interpreter, ResumeState};
pub use value::{ErrorObject, Value};
