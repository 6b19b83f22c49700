//! Tiered function values
//!
//! A [`CompiledFunction`] owns the baseline bytecode and, while it stays
//! optimized, the synthesized graph. Each call enters the optimized graph
//! first; a bailout hands the frame to the baseline interpreter for the rest
//! of that activation only.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kestrel_jit::{BailoutCoordinator, BailoutKind, Executor, FrameSnapshot, OptimizedFunction, Outcome};
use kestrel_vm::{BytecodeFunction, CallContext, Callable, Interpreter, Value, VmError, VmResult};
use tracing::{debug, error, trace};

use crate::stats::StatsHandle;

/// What the function does after recording a bailout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutAction {
    /// Keep the optimized code
    Continue,
    /// Drop the optimized code; later calls run baseline
    Deoptimize,
}

/// A function compiled for both tiers
pub struct CompiledFunction {
    name: String,
    bytecode: BytecodeFunction,
    optimized: RefCell<Option<Rc<OptimizedFunction>>>,
    bailouts: Cell<u32>,
    deopt_threshold: u32,
    stats: StatsHandle,
}

impl CompiledFunction {
    pub(crate) fn new(
        bytecode: BytecodeFunction,
        optimized: Option<OptimizedFunction>,
        deopt_threshold: u32,
        stats: StatsHandle,
    ) -> Self {
        Self {
            name: bytecode.name.clone(),
            bytecode,
            optimized: RefCell::new(optimized.map(Rc::new)),
            bailouts: Cell::new(0),
            deopt_threshold: deopt_threshold.max(1),
            stats,
        }
    }

    /// Baseline bytecode
    pub fn bytecode(&self) -> &BytecodeFunction {
        &self.bytecode
    }

    /// Optimized code, if the function has not been deoptimized
    pub fn optimized(&self) -> Option<Rc<OptimizedFunction>> {
        self.optimized.borrow().clone()
    }

    /// Whether calls still enter optimized code
    pub fn is_optimized(&self) -> bool {
        self.optimized.borrow().is_some()
    }

    /// Bailouts taken so far
    pub fn bailout_count(&self) -> u32 {
        self.bailouts.get()
    }

    /// Count a bailout and drop optimized code once the threshold is reached
    pub fn record_bailout(&self) -> BailoutAction {
        let count = self.bailouts.get().saturating_add(1);
        self.bailouts.set(count);
        if count < self.deopt_threshold {
            return BailoutAction::Continue;
        }
        if self.optimized.borrow_mut().take().is_some() {
            self.stats.deoptimization();
            debug!(function = %self.name, bailouts = count, "dropping optimized code");
        }
        BailoutAction::Deoptimize
    }

    fn bail_out(
        &self,
        optimized: &OptimizedFunction,
        snapshot: FrameSnapshot,
        cx: CallContext,
    ) -> VmResult<Value> {
        let kind = snapshot.kind();
        let site = snapshot.site;
        let state = BailoutCoordinator::new(&optimized.regions, &self.bytecode)
            .reconstruct(snapshot)
            .map_err(|err| {
                error!(function = %self.name, %err, "cannot rebuild baseline frame");
                VmError::internal(err.to_string())
            })?;

        self.stats.bailout(kind);
        let action = self.record_bailout();
        trace!(
            function = %self.name,
            %site,
            lazy = kind == BailoutKind::Lazy,
            pc = state.pc,
            ?action,
            "resuming in baseline tier"
        );
        Interpreter::resume(&self.bytecode, state)?.run(cx)
    }
}

impl Callable for CompiledFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &[Value], cx: CallContext) -> VmResult<Value> {
        let Some(optimized) = self.optimized() else {
            self.stats.baseline_entry();
            return Interpreter::call(&self.bytecode, args, cx);
        };

        self.stats.optimized_entry();
        match Executor::call(&optimized, args, cx)? {
            Outcome::Return(value) => Ok(value),
            Outcome::Throw(exception) => Err(VmError::Exception(Box::new(exception))),
            Outcome::Bailout(snapshot) => self.bail_out(&optimized, *snapshot, cx),
        }
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("optimized", &self.is_optimized())
            .field("bailouts", &self.bailouts.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, EngineConfig};

    #[test]
    fn test_threshold_drops_optimized_code() {
        let engine = Engine::new(EngineConfig::new().with_deopt_threshold(2));
        let f = engine
            .compile_function("(function f(a) { %DeoptimizeFunction(f); return a; })")
            .unwrap();
        assert!(f.is_optimized());

        let one = Value::number(1.0);
        assert_eq!(f.call(&[one.clone()], CallContext::root()).unwrap().as_number(), Some(1.0));
        assert!(f.is_optimized());
        assert_eq!(f.call(&[one.clone()], CallContext::root()).unwrap().as_number(), Some(1.0));
        assert!(!f.is_optimized());
        assert_eq!(f.call(&[one], CallContext::root()).unwrap().as_number(), Some(1.0));

        let stats = engine.stats();
        assert_eq!(stats.optimized_entries, 2);
        assert_eq!(stats.baseline_entries, 1);
        assert_eq!(stats.lazy_bailouts, 2);
        assert_eq!(stats.deoptimizations, 1);
    }

    #[test]
    fn test_record_bailout_reports_action() {
        let engine = Engine::new(EngineConfig::new().with_deopt_threshold(2));
        let f = engine.compile_function("(function(a) { return a; })").unwrap();
        assert_eq!(f.record_bailout(), BailoutAction::Continue);
        assert_eq!(f.record_bailout(), BailoutAction::Deoptimize);
        assert_eq!(f.bailout_count(), 2);
        assert!(f.optimized().is_none());
    }

    #[test]
    fn test_baseline_only_function() {
        let engine = Engine::new(EngineConfig::new().with_jit(false));
        let f = engine.compile_function("(function(a) { return a + 1; })").unwrap();
        assert!(!f.is_optimized());
        let r = f.call(&[Value::number(1.0)], CallContext::root()).unwrap();
        assert_eq!(r.as_number(), Some(2.0));
        assert_eq!(engine.stats().baseline_entries, 1);
    }
}
