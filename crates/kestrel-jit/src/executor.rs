//! Optimized-tier execution
//!
//! Runs a synthesized [`OptimizedFunction`] block by block. Guards are
//! checked before the guarded operation writes anything, and a bailout
//! stops the activation with a [`FrameSnapshot`] instead of a value.

use kestrel_ir::{Operand, SiteId, Slot};
use kestrel_vm::{
    CallContext, Completion, PendingException, Value, VmError, VmResult,
    ops::{eval_binary, eval_numeric, eval_unary},
};
use smallvec::SmallVec;
use tracing::trace;

use crate::bailout::{BailoutReason, FrameSnapshot, InFlightCompletion};
use crate::compiler::OptimizedFunction;
use crate::graph::{BasicBlock, ExcSlot, ExitTag, Instr, Terminator, ThrowEdge};

/// How an optimized activation ended
#[derive(Debug)]
pub enum Outcome {
    /// Returned normally
    Return(Value),
    /// An exception left the function
    Throw(PendingException),
    /// Execution must continue in the baseline tier
    Bailout(Box<FrameSnapshot>),
}

/// One optimized activation
pub struct Executor<'f> {
    function: &'f OptimizedFunction,
    slots: Vec<Value>,
    exceptions: Vec<Option<PendingException>>,
}

impl<'f> Executor<'f> {
    /// Create an activation with `args` bound to the parameters
    pub fn new(function: &'f OptimizedFunction, args: &[Value]) -> Self {
        let mut slots = vec![Value::Undefined; function.slot_count as usize];
        for (slot, arg) in slots
            .iter_mut()
            .zip(args.iter().take(function.param_count as usize))
        {
            *slot = arg.clone();
        }
        Self {
            function,
            slots,
            exceptions: vec![None; function.exception_count as usize],
        }
    }

    /// Run a fresh activation
    pub fn call(function: &'f OptimizedFunction, args: &[Value], cx: CallContext) -> VmResult<Outcome> {
        Self::new(function, args).run(cx)
    }

    /// Execute until the activation returns, throws or bails out
    pub fn run(mut self, cx: CallContext) -> VmResult<Outcome> {
        let function = self.function;
        let graph = &function.graph;
        let mut current = graph.entry;

        loop {
            let block = graph
                .blocks
                .get(current.index())
                .ok_or_else(|| VmError::internal(format!("block {current} out of range")))?;

            for instr in &block.instrs {
                if let Some((site, reason)) = self.execute(instr)? {
                    return Ok(Outcome::Bailout(Box::new(self.snapshot(block, site, reason))));
                }
            }

            current = match &block.terminator {
                Terminator::Jump(target) => *target,

                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    if self.read(cond)?.to_boolean() {
                        *then_block
                    } else {
                        *else_block
                    }
                }

                Terminator::Call {
                    dst,
                    callee,
                    args,
                    position,
                    exception,
                    normal,
                    on_throw,
                } => {
                    let callee = self.read(callee)?;
                    let args = args
                        .iter()
                        .map(|arg| self.read(arg))
                        .collect::<VmResult<SmallVec<[Value; 4]>>>()?;
                    let result = match &callee {
                        Value::Function(function) => function.call(&args, cx.enter()?),
                        other => Err(VmError::NotCallable(other.to_js_string().to_string())),
                    };
                    match result {
                        Ok(value) => {
                            self.write(*dst, value)?;
                            *normal
                        }
                        Err(error) => {
                            let pending = error.into_pending(*position)?;
                            self.store_exception(*exception, pending)?;
                            match on_throw {
                                ThrowEdge::Resolved(handler) => *handler,
                                ThrowEdge::Pending(edge) => {
                                    return Err(VmError::internal(format!(
                                        "unrouted throw edge {edge} in block {current}"
                                    )));
                                }
                            }
                        }
                    }
                }

                Terminator::Return(slot) => return Ok(Outcome::Return(self.read_slot(*slot)?)),

                Terminator::Unwind(exc) => {
                    let exception = self.take_exception(*exc)?;
                    return Ok(Outcome::Throw(exception));
                }

                Terminator::Exit(_) | Terminator::EndFinally(_) | Terminator::Unreachable => {
                    return Err(VmError::internal(format!(
                        "block {current} ends in {}",
                        block.terminator
                    )));
                }
            };
        }
    }

    /// Execute one instruction; `Some` requests a bailout at that site
    fn execute(&mut self, instr: &Instr) -> VmResult<Option<(SiteId, BailoutReason)>> {
        match instr {
            Instr::Move { dst, src } => {
                let value = self.read(src)?;
                self.write(*dst, value)?;
            }

            Instr::Unary { dst, op, src } => {
                let value = eval_unary(*op, &self.read(src)?);
                self.write(*dst, value)?;
            }

            Instr::Binary {
                dst,
                op,
                lhs,
                rhs,
                guard,
                site,
            } => {
                let lhs = self.read(lhs)?;
                let rhs = self.read(rhs)?;
                let value = match guard {
                    Some(guard) => {
                        if !guard.holds(&lhs, &rhs) {
                            trace!(%site, op = op.symbol(), "speculation failed");
                            return Ok(Some((*site, BailoutReason::TypeGuardFailure)));
                        }
                        match (lhs.as_number(), rhs.as_number()) {
                            (Some(a), Some(b)) => eval_numeric(*op, a, b),
                            _ => None,
                        }
                        .unwrap_or_else(|| eval_binary(*op, &lhs, &rhs))
                    }
                    None => eval_binary(*op, &lhs, &rhs),
                };
                self.write(*dst, value)?;
            }

            Instr::Raise {
                exc,
                value,
                position,
            } => {
                let value = self.read(value)?;
                self.store_exception(*exc, PendingException::new(value, *position))?;
            }

            Instr::TakeException { dst, exc } => {
                let exception = self.take_exception(*exc)?;
                self.write(*dst, exception.value)?;
            }

            Instr::Deoptimize { site } => {
                return Ok(Some((*site, BailoutReason::Requested)));
            }
        }
        Ok(None)
    }

    fn read(&self, operand: &Operand) -> VmResult<Value> {
        match operand {
            Operand::Slot(slot) => self.read_slot(*slot),
            Operand::Const(constant) => Ok(Value::from(constant)),
        }
    }

    fn read_slot(&self, slot: Slot) -> VmResult<Value> {
        self.slots
            .get(slot.index())
            .cloned()
            .ok_or_else(|| VmError::internal(format!("slot {slot} out of range")))
    }

    fn write(&mut self, slot: Slot, value: Value) -> VmResult<()> {
        match self.slots.get_mut(slot.index()) {
            Some(target) => {
                *target = value;
                Ok(())
            }
            None => Err(VmError::internal(format!("slot {slot} out of range"))),
        }
    }

    fn store_exception(&mut self, exc: ExcSlot, exception: PendingException) -> VmResult<()> {
        match self.exceptions.get_mut(exc.index()) {
            Some(cell) => {
                *cell = Some(exception);
                Ok(())
            }
            None => Err(VmError::internal(format!("exception cell {exc} out of range"))),
        }
    }

    fn take_exception(&mut self, exc: ExcSlot) -> VmResult<PendingException> {
        self.exceptions
            .get_mut(exc.index())
            .and_then(Option::take)
            .ok_or_else(|| VmError::internal(format!("exception cell {exc} is empty")))
    }

    /// Completion a finally body resumes when it ends normally
    fn completion(&self, tag: ExitTag) -> Option<Completion> {
        match tag {
            ExitTag::Normal => Some(Completion::Normal),
            ExitTag::Break(label) => Some(Completion::Break(label)),
            ExitTag::Continue(label) => Some(Completion::Continue(label)),
            ExitTag::Return(slot) => self.slots.get(slot.index()).cloned().map(Completion::Return),
            ExitTag::Throw(exc) => self
                .exceptions
                .get(exc.index())
                .cloned()
                .flatten()
                .map(Completion::Throw),
        }
    }

    fn snapshot(&self, block: &BasicBlock, site: SiteId, reason: BailoutReason) -> FrameSnapshot {
        let in_flight = block
            .in_flight
            .iter()
            .map(|entry| InFlightCompletion {
                region: entry.region,
                completion: self.completion(entry.resume.tag),
                remaining: entry.resume.crosses.clone(),
            })
            .collect();
        trace!(%site, block = %block.id, ?reason, "capturing frame snapshot");
        FrameSnapshot {
            site,
            reason,
            block: block.id,
            slots: self.slots.clone(),
            active: block.active.clone(),
            in_flight,
        }
    }
}
