//! Function test harness
//!
//! [`FunctionTester`] compiles one function expression and checks calls
//! against expected results. The `check_*` methods panic with a
//! description of the mismatch, so they read like assertions in tests:
//!
//! ```ignore
//! let t = FunctionTester::new("(function(a, b) { if (a) throw b; return b; })")?;
//! t.check_call(t.val(23.0), &[t.false_value(), t.val(23.0)]);
//! t.check_throws(&[t.true_value(), t.new_object("new Error")?]);
//! ```

use std::rc::Rc;

use kestrel_ir::SourcePosition;
use kestrel_vm::{CallContext, Callable, PendingException, Value, VmError, VmResult};

use crate::config::{EngineConfig, Tier};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::function::CompiledFunction;

const ERROR_CONSTRUCTORS: &[&str] = &[
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
];

/// Where an uncaught exception was thrown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// 1-based line of the throw site
    pub line_number: u32,
    /// Byte offset of the throw site
    pub start_position: u32,
}

impl From<SourcePosition> for Message {
    fn from(position: SourcePosition) -> Self {
        Self {
            line_number: position.line,
            start_position: position.offset,
        }
    }
}

/// Compiles one function and checks its calls
pub struct FunctionTester {
    source: String,
    helpers: Vec<String>,
    engine: Engine,
    function: Rc<CompiledFunction>,
}

impl FunctionTester {
    /// Compile `source` with the default configuration
    pub fn new(source: &str) -> EngineResult<Self> {
        Self::with_config(source, EngineConfig::default())
    }

    /// Compile `source` with `config`
    pub fn with_config(source: &str, config: EngineConfig) -> EngineResult<Self> {
        let engine = Engine::new(config);
        let function = engine.compile_function(source)?;
        Ok(Self {
            source: source.to_string(),
            helpers: Vec::new(),
            engine,
            function,
        })
    }

    /// Recompile the function and helpers for `tier`
    pub fn with_tier(self, tier: Tier) -> EngineResult<Self> {
        let config = self.engine.config().with_tier(tier);
        let mut tester = Self::with_config(&self.source, config)?;
        for helper in &self.helpers {
            tester.compile_run(helper)?;
        }
        Ok(tester)
    }

    /// The function under test
    pub fn function(&self) -> &Rc<CompiledFunction> {
        &self.function
    }

    /// The engine owning the function
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Call the function
    pub fn call(&self, args: &[Value]) -> VmResult<Value> {
        self.function.call(args, CallContext::root())
    }

    /// Call and require a return equal to `expected`.
    ///
    /// # Panics
    ///
    /// If the call throws or returns a different value.
    pub fn check_call(&self, expected: Value, args: &[Value]) -> Value {
        match self.call(args) {
            Ok(value) => {
                assert!(
                    same_value(&value, &expected),
                    "expected {expected:?}, got {value:?} from {}",
                    self.source
                );
                value
            }
            Err(err) => panic!("expected {expected:?}, got {err} from {}", self.source),
        }
    }

    /// Call and require an uncaught exception.
    ///
    /// # Panics
    ///
    /// If the call returns or fails with something other than a thrown value.
    pub fn check_throws(&self, args: &[Value]) -> PendingException {
        match self.call(args) {
            Err(VmError::Exception(exception)) => *exception,
            Ok(value) => panic!("expected a throw, got {value:?} from {}", self.source),
            Err(err) => panic!("expected a throw, got {err} from {}", self.source),
        }
    }

    /// Call, require an uncaught exception and report where it was thrown
    pub fn check_throws_return_message(&self, args: &[Value]) -> Message {
        Message::from(self.check_throws(args).position)
    }

    /// Run the function and a baseline-only copy and require identical
    /// results, including throw positions.
    ///
    /// # Panics
    ///
    /// If the two runs differ or the reference cannot be built.
    pub fn check_matches_reference(&self, args: &[Value]) -> VmResult<Value> {
        let reference = self.clone_for_reference();
        let expected = reference.call(args);
        let actual = self.call(args);
        assert_eq!(
            describe(&actual),
            describe(&expected),
            "optimized run diverged from baseline for {}",
            self.source
        );
        actual
    }

    fn clone_for_reference(&self) -> FunctionTester {
        let config = self.engine.config().with_tier(Tier::Baseline);
        let mut reference = match Self::with_config(&self.source, config) {
            Ok(reference) => reference,
            Err(err) => panic!("cannot build reference for {}: {err}", self.source),
        };
        for helper in &self.helpers {
            if let Err(err) = reference.compile_run(helper) {
                panic!("cannot rebuild helper for reference: {err}");
            }
        }
        reference
    }

    /// Define function declarations for later [`FunctionTester::new_function`]
    pub fn compile_run(&mut self, source: &str) -> EngineResult<()> {
        self.engine.compile_run(source)?;
        self.helpers.push(source.to_string());
        Ok(())
    }

    /// A helper defined by [`FunctionTester::compile_run`]
    pub fn new_function(&self, name: &str) -> EngineResult<Value> {
        self.engine.function(name)
    }

    /// Build an object from a `new Ctor` or `new Ctor('message')` expression
    pub fn new_object(&self, expression: &str) -> EngineResult<Value> {
        let unsupported = || EngineError::UnsupportedObject(expression.to_string());
        let rest = expression.trim().strip_prefix("new ").ok_or_else(unsupported)?.trim();
        let (name, message) = match rest.split_once('(') {
            Some((name, args)) => {
                let args = args.strip_suffix(')').ok_or_else(unsupported)?.trim();
                (name.trim(), string_literal(args).ok_or_else(unsupported)?)
            }
            None => (rest, ""),
        };
        if !ERROR_CONSTRUCTORS.contains(&name) {
            return Err(unsupported());
        }
        Ok(Value::error(name, message))
    }

    /// Convert a Rust value
    pub fn val(&self, value: impl Into<Value>) -> Value {
        value.into()
    }

    /// `true`
    pub fn true_value(&self) -> Value {
        Value::Boolean(true)
    }

    /// `false`
    pub fn false_value(&self) -> Value {
        Value::Boolean(false)
    }

    /// `undefined`
    pub fn undefined(&self) -> Value {
        Value::Undefined
    }
}

/// Contents of a quoted literal; an empty argument list is the empty string
fn string_literal(text: &str) -> Option<&str> {
    if text.is_empty() {
        return Some("");
    }
    ['\'', '"']
        .into_iter()
        .find_map(|quote| text.strip_prefix(quote)?.strip_suffix(quote))
}

/// Identity for objects, SameValueZero for primitives
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => a.strict_equals(b),
    }
}

fn describe(result: &VmResult<Value>) -> String {
    match result {
        Ok(value) => format!("return {value:?}"),
        Err(VmError::Exception(exception)) => {
            format!("throw {:?} at {}", exception.value, exception.position)
        }
        Err(err) => format!("error {err}"),
    }
}
