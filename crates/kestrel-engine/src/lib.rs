//! # Kestrel Engine
//!
//! Ties the pipeline together: sources are compiled once for the baseline
//! tier and once for the optimized tier, calls enter optimized code, and
//! bailouts resume the same activation in the interpreter.
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::from_env());
//! let f = engine.compile_function("(function f(a) { try { throw a; } catch (e) { return e + 1; } })")?;
//! let two = f.call(&[Value::number(1.0)], CallContext::root())?;
//! ```
//!
//! [`FunctionTester`] wraps an engine for tests written against expected
//! results and throw positions.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod function;
pub mod stats;
pub mod tester;

pub use config::{EngineConfig, Tier};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use function::{BailoutAction, CompiledFunction};
pub use stats::EngineStats;
pub use tester::{FunctionTester, Message};

pub use kestrel_vm::{CallContext, Callable, NativeFunction, Value};
