//! Normalized structured-control representation
//!
//! This is the input both tiers compile from: one function body whose
//! expressions have already been flattened into three-address [`Op`]s over
//! frame slots, while control flow keeps its source nesting (`if`, loops,
//! labeled blocks, `try`/`catch`/`finally`). Labels and protected regions
//! carry ids assigned by the front end; resolving them to code locations is
//! the job of each tier.

use std::sync::Arc;

use serde::Serialize;

use crate::operand::{LabelId, Operand, RegionId, SiteId, Slot};
use crate::ops::{BinaryOp, UnaryOp};
use crate::position::SourcePosition;

/// A function body ready for lowering
#[derive(Debug, Clone, Serialize)]
pub struct StructuredFunction {
    /// Function name, if the source named it
    pub name: Option<Arc<str>>,
    /// Parameters occupy slots `0..param_count`
    pub param_count: u16,
    /// Total number of frame slots (parameters, locals, temporaries)
    pub slot_count: u16,
    /// Debug names for slots; temporaries have none
    pub slot_names: Vec<Option<Arc<str>>>,
    /// Number of labels allocated
    pub label_count: u32,
    /// Number of protected regions allocated
    pub region_count: u32,
    /// Number of bailout sites allocated
    pub site_count: u32,
    /// The body
    pub body: Block,
}

impl StructuredFunction {
    /// Display name used in diagnostics
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

/// A sequence of statements
#[derive(Debug, Clone, Default, Serialize)]
pub struct Block {
    /// Statements in execution order
    pub stmts: Vec<Stmt>,
}

impl Block {
    /// Empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement
    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    /// Whether the block has no statements
    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Number of statements
    pub fn len(&self) -> usize {
        self.stmts.len()
    }
}

impl From<Vec<Stmt>> for Block {
    fn from(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// Structured statement
#[derive(Debug, Clone, Serialize)]
pub enum Stmt {
    /// Straight-line operation
    Op(Op),
    /// Two-way conditional on the truthiness of `cond`
    If {
        /// Condition
        cond: Operand,
        /// Taken when `cond` is truthy
        then_block: Block,
        /// Taken otherwise
        else_block: Block,
    },
    /// `while`/`for` loop
    Loop(LoopStmt),
    /// Labeled non-loop statement; only `break` may target it
    Labeled {
        /// Label that `break` resolves to
        label: LabelId,
        /// Labeled body
        body: Block,
    },
    /// `try` with a catch clause, a finally clause, or both
    Try(TryStmt),
    /// `break label`
    Break(LabelId),
    /// `continue label`
    Continue(LabelId),
    /// `return value`
    Return(Operand),
    /// `throw value`
    Throw {
        /// Thrown value
        value: Operand,
        /// Position of the `throw` keyword
        position: SourcePosition,
    },
}

impl Stmt {
    /// Whether control never falls through this statement
    pub fn is_abrupt(&self) -> bool {
        matches!(
            self,
            Self::Break(_) | Self::Continue(_) | Self::Return(_) | Self::Throw { .. }
        )
    }
}

/// Loop with an optional test and an update part.
///
/// Executes `test`, leaves when `cond` is falsy, runs `body`, then `update`.
/// `continue` resumes at `update`; `break` leaves the loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStmt {
    /// Label for `break`/`continue`
    pub label: LabelId,
    /// Computes the loop condition
    pub test: Block,
    /// Loop condition; `None` loops forever
    pub cond: Option<Operand>,
    /// Loop body
    pub body: Block,
    /// Runs after the body and on `continue`
    pub update: Block,
}

/// `try` statement
#[derive(Debug, Clone, Serialize)]
pub struct TryStmt {
    /// Protected block
    pub block: Block,
    /// Catch clause
    pub handler: Option<CatchClause>,
    /// Finally clause
    pub finalizer: Option<FinallyClause>,
}

/// `catch (binding) { body }`
#[derive(Debug, Clone, Serialize)]
pub struct CatchClause {
    /// Region covering the `try` block
    pub region: RegionId,
    /// Slot receiving the caught value
    pub binding: Slot,
    /// Handler body
    pub body: Block,
}

/// `finally { body }`
#[derive(Debug, Clone, Serialize)]
pub struct FinallyClause {
    /// Region covering the `try` block and the catch body
    pub region: RegionId,
    /// Finalizer body
    pub body: Block,
}

/// Kind of protected region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegionKind {
    /// Exceptions are routed to a catch body
    Catch,
    /// Every exit runs a finally body
    Finally,
}

/// Three-address operation over frame slots
#[derive(Debug, Clone, Serialize)]
pub enum Op {
    /// `dst = src`
    Move {
        /// Destination
        dst: Slot,
        /// Source
        src: Operand,
    },
    /// `dst = op src`
    Unary {
        /// Destination
        dst: Slot,
        /// Operator
        op: UnaryOp,
        /// Operand
        src: Operand,
    },
    /// `dst = lhs op rhs`; optimized code may speculate on the operand types
    Binary {
        /// Destination
        dst: Slot,
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
        /// Bailout site for a failed speculation
        site: SiteId,
    },
    /// `dst = callee(args...)`; may throw
    Call {
        /// Destination
        dst: Slot,
        /// Called value
        callee: Operand,
        /// Positional arguments
        args: Vec<Operand>,
        /// Position of the call expression
        position: SourcePosition,
    },
    /// `%DeoptimizeFunction(f)`: forces a bailout of the current activation
    Deoptimize {
        /// Bailout site
        site: SiteId,
    },
}

impl Op {
    /// Bailout site carried by this operation
    pub fn site(&self) -> Option<SiteId> {
        match self {
            Self::Binary { site, .. } | Self::Deoptimize { site } => Some(*site),
            _ => None,
        }
    }

    /// Slot written by this operation
    pub fn dst(&self) -> Option<Slot> {
        match self {
            Self::Move { dst, .. }
            | Self::Unary { dst, .. }
            | Self::Binary { dst, .. }
            | Self::Call { dst, .. } => Some(*dst),
            Self::Deoptimize { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::Constant;

    #[test]
    fn test_abrupt_statements() {
        assert!(Stmt::Break(LabelId(0)).is_abrupt());
        assert!(Stmt::Return(Operand::undefined()).is_abrupt());
        assert!(
            Stmt::Throw {
                value: Operand::Const(Constant::number(1.0)),
                position: SourcePosition::default(),
            }
            .is_abrupt()
        );
        assert!(!Stmt::Op(Op::Deoptimize { site: SiteId(0) }).is_abrupt());
    }

    #[test]
    fn test_op_accessors() {
        let op = Op::Binary {
            dst: Slot(3),
            op: BinaryOp::Add,
            lhs: Operand::Slot(Slot(0)),
            rhs: Operand::Const(Constant::number(1.0)),
            site: SiteId(7),
        };
        assert_eq!(op.site(), Some(SiteId(7)));
        assert_eq!(op.dst(), Some(Slot(3)));
        assert_eq!(Op::Deoptimize { site: SiteId(1) }.dst(), None);
    }

    #[test]
    fn test_serializes_for_dumps() {
        let block = Block::from(vec![Stmt::Break(LabelId(2))]);
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("Break"));
    }
}
