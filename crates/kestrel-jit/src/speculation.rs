//! Type speculation for binary operations
//!
//! Optimized code assumes the operands of arithmetic and relational
//! operators are numbers unless the front end's output shows they may hold
//! strings. The guard is checked before the operation commits anything, so a
//! failure is an eager bailout that re-executes the operation in the
//! baseline tier.
//!
//! ```text
//!   guard Numbers(lhs, rhs)
//!     ├─ both numbers → numeric fast path
//!     └─ otherwise    → bailout at the op's site
//! ```

use kestrel_ir::{BinaryOp, Block, Constant, Op, Operand, Slot, Stmt, StructuredFunction, UnaryOp};
use kestrel_vm::Value;
use serde::Serialize;

/// Assumption checked before a guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Speculation {
    /// Both operands are numbers
    Numbers,
}

impl Speculation {
    /// Whether the operands satisfy the assumption
    #[inline]
    pub fn holds(self, lhs: &Value, rhs: &Value) -> bool {
        match self {
            Self::Numbers => lhs.is_number() && rhs.is_number(),
        }
    }
}

/// Per-function decision of which binary operations get guards
#[derive(Debug, Clone, Default)]
pub struct SpeculationPlan {
    maybe_string: Vec<bool>,
}

impl SpeculationPlan {
    /// Find the slots that may hold a string.
    ///
    /// Flow-insensitive: a slot is tainted if any write to it anywhere in the
    /// body can produce a string. Parameters, call results and catch
    /// bindings are speculated to be numbers.
    pub fn analyze(function: &StructuredFunction) -> Self {
        let mut plan = Self {
            maybe_string: vec![false; function.slot_count as usize],
        };
        loop {
            let mut changed = false;
            plan.visit_block(&function.body, &mut changed);
            if !changed {
                break;
            }
        }
        plan
    }

    /// Whether `slot` may hold a string
    pub fn may_be_string(&self, slot: Slot) -> bool {
        self.maybe_string.get(slot.index()).copied().unwrap_or(false)
    }

    fn operand_may_be_string(&self, operand: &Operand) -> bool {
        match operand {
            Operand::Slot(slot) => self.may_be_string(*slot),
            Operand::Const(constant) => matches!(constant, Constant::String(_)),
        }
    }

    /// Guard to attach to `lhs op rhs`, if any
    pub fn guard_for(&self, op: BinaryOp, lhs: &Operand, rhs: &Operand) -> Option<Speculation> {
        if !op.is_numeric() || self.operand_may_be_string(lhs) || self.operand_may_be_string(rhs) {
            return None;
        }
        Some(Speculation::Numbers)
    }

    fn taint(&mut self, slot: Slot, changed: &mut bool) {
        if let Some(flag) = self.maybe_string.get_mut(slot.index())
            && !*flag
        {
            *flag = true;
            *changed = true;
        }
    }

    fn visit_block(&mut self, block: &Block, changed: &mut bool) {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Op(op) => self.visit_op(op, changed),
                Stmt::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    self.visit_block(then_block, changed);
                    self.visit_block(else_block, changed);
                }
                Stmt::Loop(lp) => {
                    self.visit_block(&lp.test, changed);
                    self.visit_block(&lp.body, changed);
                    self.visit_block(&lp.update, changed);
                }
                Stmt::Labeled { body, .. } => self.visit_block(body, changed),
                Stmt::Try(try_stmt) => {
                    self.visit_block(&try_stmt.block, changed);
                    if let Some(handler) = &try_stmt.handler {
                        self.visit_block(&handler.body, changed);
                    }
                    if let Some(finalizer) = &try_stmt.finalizer {
                        self.visit_block(&finalizer.body, changed);
                    }
                }
                Stmt::Break(_)
                | Stmt::Continue(_)
                | Stmt::Return(_)
                | Stmt::Throw { .. } => {}
            }
        }
    }

    fn visit_op(&mut self, op: &Op, changed: &mut bool) {
        let tainted = match op {
            Op::Move { dst, src } => self.operand_may_be_string(src).then_some(*dst),
            Op::Unary { dst, op, .. } => (*op == UnaryOp::TypeOf).then_some(*dst),
            Op::Binary { dst, op, lhs, rhs, .. } => (*op == BinaryOp::Add
                && (self.operand_may_be_string(lhs) || self.operand_may_be_string(rhs)))
            .then_some(*dst),
            Op::Call { .. } | Op::Deoptimize { .. } => None,
        };
        if let Some(slot) = tainted {
            self.taint(slot, changed);
        }
    }
}

/// Guard source used when speculation is turned off
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPlan;

/// Decides the guard of each binary operation during normalization
pub trait GuardPolicy {
    /// Guard to attach to `lhs op rhs`, if any
    fn guard(&self, op: BinaryOp, lhs: &Operand, rhs: &Operand) -> Option<Speculation>;
}

impl GuardPolicy for SpeculationPlan {
    fn guard(&self, op: BinaryOp, lhs: &Operand, rhs: &Operand) -> Option<Speculation> {
        self.guard_for(op, lhs, rhs)
    }
}

impl GuardPolicy for DisabledPlan {
    fn guard(&self, _op: BinaryOp, _lhs: &Operand, _rhs: &Operand) -> Option<Speculation> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_compiler::Compiler;

    fn plan(source: &str) -> (StructuredFunction, SpeculationPlan) {
        let function = Compiler::new(source).compile_function().unwrap();
        let plan = SpeculationPlan::analyze(&function);
        (function, plan)
    }

    #[test]
    fn test_string_accumulator_is_not_guarded() {
        let (_, plan) = plan("(function(a) { var r = '-'; r += 'A-'; return r; })");
        // slot 0 is the parameter, slot 1 the accumulator
        assert!(!plan.may_be_string(Slot(0)));
        assert!(plan.may_be_string(Slot(1)));
        let guard = plan.guard_for(BinaryOp::Add, &Operand::Slot(Slot(1)), &Operand::Const(Constant::string("A-")));
        assert_eq!(guard, None);
    }

    #[test]
    fn test_parameter_arithmetic_is_guarded() {
        let (_, plan) = plan("(function(a) { return a + 1; })");
        let guard = plan.guard_for(BinaryOp::Add, &Operand::Slot(Slot(0)), &Operand::Const(Constant::number(1.0)));
        assert_eq!(guard, Some(Speculation::Numbers));
    }

    #[test]
    fn test_equality_is_never_guarded() {
        let (_, plan) = plan("(function(a) { return a; })");
        let guard = plan.guard_for(BinaryOp::StrictEq, &Operand::Slot(Slot(0)), &Operand::Slot(Slot(0)));
        assert_eq!(guard, None);
    }

    #[test]
    fn test_taint_flows_through_moves() {
        let (_, plan) = plan("(function() { var a = 'x'; var b = 0; b = a; var c = b; return c; })");
        assert!(plan.may_be_string(Slot(0)));
        assert!(plan.may_be_string(Slot(1)));
        assert!(plan.may_be_string(Slot(2)));
    }

    #[test]
    fn test_guard_holds_only_for_numbers() {
        assert!(Speculation::Numbers.holds(&Value::number(1.0), &Value::number(2.0)));
        assert!(!Speculation::Numbers.holds(&Value::number(1.0), &Value::string("2")));
        assert!(!Speculation::Numbers.holds(&Value::Undefined, &Value::number(2.0)));
    }
}
