//! Function values

use std::fmt;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Maximum nesting of calls before `StackOverflow`
pub const MAX_CALL_DEPTH: usize = 512;

/// Per-call information threaded through nested invocations
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    depth: usize,
}

impl CallContext {
    /// Context for a call made from the host
    pub fn root() -> Self {
        Self::default()
    }

    /// Current nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Context for a nested call
    pub fn enter(self) -> VmResult<Self> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow);
        }
        Ok(Self {
            depth: self.depth + 1,
        })
    }
}

/// Anything compiled code can call
pub trait Callable {
    /// Function name used in diagnostics
    fn name(&self) -> &str;

    /// Invoke with positional arguments
    fn call(&self, args: &[Value], cx: CallContext) -> VmResult<Value>;
}

impl fmt::Debug for dyn Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.name())
    }
}

/// Native function signature; `Err` carries a thrown value
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, Value>;

/// A function implemented in Rust
pub struct NativeFunction {
    name: String,
    func: Box<NativeFn>,
}

impl NativeFunction {
    /// Create a native function
    pub fn new(name: impl Into<String>, func: impl Fn(&[Value]) -> Result<Value, Value> + 'static) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// Wrap into a function value
    pub fn into_value(self) -> Value {
        Value::Function(Rc::new(self))
    }
}

impl Callable for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &[Value], _cx: CallContext) -> VmResult<Value> {
        (self.func)(args).map_err(VmError::Thrown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_throw_has_no_position() {
        let f = NativeFunction::new("thrower", |_| Err(Value::string("T-")));
        let err = f.call(&[], CallContext::root()).unwrap_err();
        assert!(matches!(err, VmError::Thrown(Value::String(ref s)) if &**s == "T-"));
    }

    #[test]
    fn test_call_depth_limit() {
        let mut cx = CallContext::root();
        for _ in 0..MAX_CALL_DEPTH {
            cx = cx.enter().unwrap();
        }
        assert!(matches!(cx.enter(), Err(VmError::StackOverflow)));
    }
}
