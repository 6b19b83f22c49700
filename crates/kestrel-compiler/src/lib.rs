//! # Kestrel Compiler
//!
//! Front end for the Kestrel JIT. Parses JavaScript with oxc and produces the
//! normalized structured-control representation consumed by both tiers.
//!
//! ## Pipeline
//!
//! 1. Parse source with oxc (V8 intrinsics enabled)
//! 2. Resolve bindings to frame slots and labels to label ids
//! 3. Flatten expressions into three-address operations
//! 4. Number protected regions and bailout sites

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod compiler;
pub mod error;
pub mod scope;

pub use compiler::Compiler;
pub use error::{CompileError, CompileResult};
