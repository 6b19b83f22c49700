//! Baseline interpreter
//!
//! Runs [`BytecodeFunction`]s with a dynamic handler stack and a completion
//! stack. Each finally body exists once in the bytecode; whatever caused
//! control to enter it (normal fallthrough, `break`, `continue`, `return` or
//! a throw) is pushed as a [`Completion`] and resumed by `EndFinally`.
//!
//! [`Interpreter::resume`] starts a frame in the middle of a function from a
//! [`ResumeState`] rebuilt after an optimized-code bailout.

use kestrel_ir::{LabelId, RegionId, RegionKind};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::{BytecodeFunction, HandlerEntry, Input, Instruction, LabelEntry};
use crate::callable::CallContext;
use crate::error::{PendingException, VmError, VmResult};
use crate::ops::{eval_binary, eval_unary};
use crate::value::Value;

/// Why control is leaving a statement
#[derive(Debug, Clone)]
pub enum Completion {
    /// Fell through
    Normal,
    /// `break label`
    Break(LabelId),
    /// `continue label`
    Continue(LabelId),
    /// `return value`; the value is fixed before any finally runs
    Return(Value),
    /// A throw with its original position
    Throw(PendingException),
}

/// One entered protected region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerFrame {
    /// Region id
    pub region: RegionId,
}

/// Frame state for starting execution mid-function
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Instruction to execute first
    pub pc: u32,
    /// Frame slots
    pub slots: Vec<Value>,
    /// Entered regions, outermost first
    pub handlers: Vec<HandlerFrame>,
    /// Completions of the finally bodies being executed, outermost first
    pub completions: Vec<Completion>,
}

/// Instruction execution result
enum InstructionResult {
    /// Continue to next instruction
    Continue,
    /// Jump by offset
    Jump(i32),
    /// Leave the current statement abruptly
    Complete(Completion),
}

/// Where unwinding delivered a completion
enum Unwound {
    /// Continue at a handler or label target
    Resume(usize),
    /// Leave the function with a value
    Return(Value),
    /// Leave the function with an exception
    Throw(PendingException),
}

/// Baseline interpreter for one activation
pub struct Interpreter<'f> {
    function: &'f BytecodeFunction,
    pc: usize,
    slots: Vec<Value>,
    handlers: SmallVec<[HandlerFrame; 4]>,
    completions: SmallVec<[Completion; 4]>,
    pending: Option<PendingException>,
}

impl<'f> Interpreter<'f> {
    /// Create an activation with `args` bound to the parameters
    pub fn new(function: &'f BytecodeFunction, args: &[Value]) -> Self {
        let mut slots = vec![Value::Undefined; function.slot_count as usize];
        for (slot, arg) in slots
            .iter_mut()
            .zip(args.iter().take(function.param_count as usize))
        {
            *slot = arg.clone();
        }
        Self {
            function,
            pc: 0,
            slots,
            handlers: SmallVec::new(),
            completions: SmallVec::new(),
            pending: None,
        }
    }

    /// Create an activation from a reconstructed frame
    pub fn resume(function: &'f BytecodeFunction, state: ResumeState) -> VmResult<Self> {
        if state.slots.len() != function.slot_count as usize {
            return Err(VmError::internal(format!(
                "resume state has {} slots, function has {}",
                state.slots.len(),
                function.slot_count
            )));
        }
        if state.pc as usize >= function.instructions.len() {
            return Err(VmError::internal(format!("resume pc {} out of range", state.pc)));
        }
        for frame in &state.handlers {
            if function.handler(frame.region).is_none() {
                return Err(VmError::internal(format!("unknown region {}", frame.region)));
            }
        }

        debug!(
            function = %function.name,
            pc = state.pc,
            handlers = state.handlers.len(),
            completions = state.completions.len(),
            "resuming in baseline tier"
        );

        Ok(Self {
            function,
            pc: state.pc as usize,
            slots: state.slots,
            handlers: state.handlers.into_iter().collect(),
            completions: state.completions.into_iter().collect(),
            pending: None,
        })
    }

    /// Run a fresh activation to completion
    pub fn call(function: &'f BytecodeFunction, args: &[Value], cx: CallContext) -> VmResult<Value> {
        Self::new(function, args).run(cx)
    }

    /// Execute until the activation returns or throws
    pub fn run(mut self, cx: CallContext) -> VmResult<Value> {
        let function = self.function;
        loop {
            let Some(instruction) = function.instructions.get(self.pc) else {
                return Err(VmError::internal(format!("pc {} out of range", self.pc)));
            };

            match self.execute(instruction, cx)? {
                InstructionResult::Continue => self.pc += 1,
                InstructionResult::Jump(offset) => {
                    self.pc = (self.pc as i64 + offset as i64) as usize;
                }
                InstructionResult::Complete(completion) => match self.unwind(completion)? {
                    Unwound::Resume(pc) => self.pc = pc,
                    Unwound::Return(value) => return Ok(value),
                    Unwound::Throw(exception) => {
                        return Err(VmError::Exception(Box::new(exception)));
                    }
                },
            }
        }
    }

    fn read(&self, input: Input) -> VmResult<Value> {
        match input {
            Input::Slot(slot) => self
                .slots
                .get(slot.index())
                .cloned()
                .ok_or_else(|| VmError::internal(format!("slot {slot} out of range"))),
            Input::Const(idx) => self
                .function
                .constants
                .get(idx)
                .map(Value::from)
                .ok_or_else(|| VmError::internal(format!("constant {} out of range", idx.index()))),
        }
    }

    fn write(&mut self, slot: kestrel_ir::Slot, value: Value) -> VmResult<()> {
        match self.slots.get_mut(slot.index()) {
            Some(target) => {
                *target = value;
                Ok(())
            }
            None => Err(VmError::internal(format!("slot {slot} out of range"))),
        }
    }

    fn handler_entry(&self, region: RegionId) -> VmResult<&'f HandlerEntry> {
        self.function
            .handler(region)
            .ok_or_else(|| VmError::internal(format!("unknown region {region}")))
    }

    fn label_entry(&self, label: LabelId) -> VmResult<&'f LabelEntry> {
        self.function
            .label(label)
            .ok_or_else(|| VmError::internal(format!("unknown label {label}")))
    }

    fn execute(&mut self, instruction: &Instruction, cx: CallContext) -> VmResult<InstructionResult> {
        match instruction {
            Instruction::Move { dst, src } => {
                let value = self.read(*src)?;
                self.write(*dst, value)?;
            }

            Instruction::Unary { dst, op, src } => {
                let value = eval_unary(*op, &self.read(*src)?);
                self.write(*dst, value)?;
            }

            Instruction::Binary { dst, op, lhs, rhs } => {
                let value = eval_binary(*op, &self.read(*lhs)?, &self.read(*rhs)?);
                self.write(*dst, value)?;
            }

            Instruction::Call {
                dst,
                callee,
                args,
                position,
            } => {
                let callee = self.read(*callee)?;
                let args = args
                    .iter()
                    .map(|arg| self.read(*arg))
                    .collect::<VmResult<SmallVec<[Value; 4]>>>()?;

                let result = match &callee {
                    Value::Function(function) => function.call(&args, cx.enter()?),
                    other => Err(VmError::NotCallable(other.to_js_string().to_string())),
                };
                match result {
                    Ok(value) => self.write(*dst, value)?,
                    Err(error) => {
                        let exception = error.into_pending(*position)?;
                        return Ok(InstructionResult::Complete(Completion::Throw(exception)));
                    }
                }
            }

            Instruction::Deoptimize => {}

            Instruction::Jump { offset } => return Ok(InstructionResult::Jump(offset.offset())),

            Instruction::JumpIfFalse { cond, offset } => {
                if !self.read(*cond)?.to_boolean() {
                    return Ok(InstructionResult::Jump(offset.offset()));
                }
            }

            Instruction::EnterTry { region } => {
                self.handlers.push(HandlerFrame { region: *region });
            }

            Instruction::LeaveTry { region } => match self.handlers.pop() {
                Some(frame) if frame.region == *region => {}
                other => {
                    return Err(VmError::internal(format!(
                        "leaving region {region} but handler stack top is {other:?}"
                    )));
                }
            },

            Instruction::Catch { dst } => {
                let exception = self
                    .pending
                    .take()
                    .ok_or_else(|| VmError::internal("catch without a pending exception"))?;
                self.write(*dst, exception.value)?;
            }

            Instruction::EnterFinally { .. } => self.completions.push(Completion::Normal),

            Instruction::EndFinally { region } => match self.completions.pop() {
                Some(Completion::Normal) => {}
                Some(completion) => {
                    trace!(region = %region, ?completion, "finally resumes completion");
                    return Ok(InstructionResult::Complete(completion));
                }
                None => {
                    return Err(VmError::internal(format!(
                        "end of finally {region} without a completion"
                    )));
                }
            },

            Instruction::Break { label } => {
                return Ok(InstructionResult::Complete(Completion::Break(*label)));
            }

            Instruction::Continue { label } => {
                return Ok(InstructionResult::Complete(Completion::Continue(*label)));
            }

            Instruction::Return { src } => {
                let value = self.read(*src)?;
                return Ok(InstructionResult::Complete(Completion::Return(value)));
            }

            Instruction::Throw { src, position } => {
                let value = self.read(*src)?;
                return Ok(InstructionResult::Complete(Completion::Throw(
                    PendingException::new(value, *position),
                )));
            }
        }
        Ok(InstructionResult::Continue)
    }

    /// Deliver an abrupt completion, innermost handler first
    fn unwind(&mut self, mut completion: Completion) -> VmResult<Unwound> {
        let target_depth = match &completion {
            Completion::Normal => return Ok(Unwound::Resume(self.pc + 1)),
            Completion::Break(label) | Completion::Continue(label) => {
                self.label_entry(*label)?.handler_depth as usize
            }
            Completion::Return(_) | Completion::Throw(_) => 0,
        };

        while self.handlers.len() > target_depth {
            let Some(frame) = self.handlers.pop() else {
                break;
            };
            let entry = self.handler_entry(frame.region)?;

            match entry.kind {
                RegionKind::Catch => match completion {
                    Completion::Throw(exception) => {
                        trace!(region = %entry.region, "exception caught");
                        self.completions.truncate(entry.finally_depth as usize);
                        self.pending = Some(exception);
                        return Ok(Unwound::Resume(entry.handler_pc as usize));
                    }
                    other => completion = other,
                },
                RegionKind::Finally => {
                    trace!(region = %entry.region, ?completion, "entering finally");
                    self.completions.truncate(entry.finally_depth as usize);
                    self.completions.push(completion);
                    return Ok(Unwound::Resume(entry.handler_pc as usize));
                }
            }
        }

        match completion {
            Completion::Break(label) => {
                let entry = self.label_entry(label)?;
                self.completions.truncate(entry.finally_depth as usize);
                Ok(Unwound::Resume(entry.break_pc as usize))
            }
            Completion::Continue(label) => {
                let entry = self.label_entry(label)?;
                let pc = entry.continue_pc.ok_or_else(|| {
                    VmError::internal(format!("continue to non-loop label {label}"))
                })?;
                self.completions.truncate(entry.finally_depth as usize);
                Ok(Unwound::Resume(pc as usize))
            }
            Completion::Return(value) => Ok(Unwound::Return(value)),
            Completion::Throw(exception) => Ok(Unwound::Throw(exception)),
            Completion::Normal => Ok(Unwound::Resume(self.pc + 1)),
        }
    }
}
