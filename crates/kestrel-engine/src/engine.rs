//! The engine: compiles sources for both tiers and keeps named helpers.

use std::rc::Rc;

use kestrel_compiler::Compiler;
use kestrel_ir::StructuredFunction;
use kestrel_jit::JitCompiler;
use kestrel_vm::{BytecodeGenerator, CallContext, Callable, NativeFunction, Value};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::function::CompiledFunction;
use crate::stats::{EngineStats, StatsHandle};

/// Compiles and runs functions
#[derive(Debug, Default)]
pub struct Engine {
    config: EngineConfig,
    stats: StatsHandle,
    functions: FxHashMap<String, Value>,
}

impl Engine {
    /// Create an engine
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stats: StatsHandle::default(),
            functions: FxHashMap::default(),
        }
    }

    /// Engine configured from the process environment
    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    /// Settings in effect
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Counters accumulated by this engine's functions
    pub fn stats(&self) -> EngineStats {
        self.stats.get()
    }

    /// Zero the counters
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Compile a single function expression
    pub fn compile_function(&self, source: &str) -> EngineResult<Rc<CompiledFunction>> {
        let structured = Compiler::new(source).compile_function()?;
        self.compile_structured(&structured)
    }

    /// Compile an already lowered function for both tiers
    pub fn compile_structured(&self, function: &StructuredFunction) -> EngineResult<Rc<CompiledFunction>> {
        let bytecode = BytecodeGenerator::compile(function)?;
        let optimized = if self.config.jit {
            match JitCompiler::new(self.config.jit_options()).compile(function) {
                Ok(optimized) => Some(optimized),
                Err(err) => {
                    warn!(
                        function = function.display_name(),
                        %err,
                        "optimized compilation failed, falling back to baseline tier"
                    );
                    self.stats.jit_fallback();
                    None
                }
            }
        } else {
            None
        };
        debug!(
            function = function.display_name(),
            instructions = bytecode.instructions.len(),
            optimized = optimized.is_some(),
            "compiled function"
        );
        Ok(Rc::new(CompiledFunction::new(
            bytecode,
            optimized,
            self.config.deopt_threshold,
            self.stats.clone(),
        )))
    }

    /// Compile function declarations and define each under its name.
    ///
    /// Returns the names defined, in source order.
    pub fn compile_run(&mut self, source: &str) -> EngineResult<Vec<String>> {
        let declarations = Compiler::new(source).compile_declarations()?;
        let mut names = Vec::with_capacity(declarations.len());
        for declaration in &declarations {
            let function = self.compile_structured(declaration)?;
            let name = declaration.display_name().to_string();
            self.functions
                .insert(name.clone(), Value::Function(function as Rc<dyn Callable>));
            names.push(name);
        }
        Ok(names)
    }

    /// Define a native helper under its own name
    pub fn define_native(&mut self, function: NativeFunction) {
        let name = function.name().to_string();
        self.functions.insert(name, function.into_value());
    }

    /// Look up a defined function
    pub fn function(&self, name: &str) -> EngineResult<Value> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFunction(name.to_string()))
    }

    /// Compile `source` and call it once with `args`
    pub fn eval(&self, source: &str, args: &[Value]) -> EngineResult<Value> {
        let function = self.compile_function(source)?;
        Ok(function.call(args, CallContext::root())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_run_defines_helpers() {
        let mut engine = Engine::default();
        let names = engine
            .compile_run("function returner() { return 'R-'; } function thrower() { throw 'T-'; }")
            .unwrap();
        assert_eq!(names, ["returner", "thrower"]);

        let Value::Function(returner) = engine.function("returner").unwrap() else {
            panic!("expected function");
        };
        let r = returner.call(&[], CallContext::root()).unwrap();
        assert_eq!(r.as_str(), Some("R-"));
    }

    #[test]
    fn test_unknown_function() {
        let engine = Engine::default();
        let err = engine.function("missing").unwrap_err();
        assert!(matches!(err, EngineError::UnknownFunction(ref name) if name == "missing"));
    }

    #[test]
    fn test_eval_propagates_uncaught_exception() {
        let engine = Engine::default();
        let err = engine.eval("(function() { throw 'x'; })", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Vm(kestrel_vm::VmError::Exception(_))));
    }

    #[test]
    fn test_native_helper() {
        let mut engine = Engine::default();
        engine.define_native(NativeFunction::new("twice", |args| {
            Ok(Value::number(args.first().map_or(0.0, Value::to_number) * 2.0))
        }));
        let twice = engine.function("twice").unwrap();
        let r = engine
            .eval("(function(f) { return f(4) + 1; })", &[twice])
            .unwrap();
        assert_eq!(r.as_number(), Some(9.0));
    }
}
