//! # Kestrel IR
//!
//! Vocabulary shared by every stage of the Kestrel pipeline:
//!
//! - frame slots, labels, protected-region and bailout-site identifiers
//! - constants and operators
//! - source positions
//! - the normalized structured-control representation handed from the
//!   front end to both execution tiers
//!
//! Both the baseline bytecode generator and the optimizing graph builder
//! consume the same [`StructuredFunction`], so identifiers such as
//! [`RegionId`] and [`SiteId`] name the same construct in either tier. That
//! shared identity is what lets a bailout move a frame between tiers.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod operand;
pub mod ops;
pub mod position;
pub mod structured;

pub use constant::Constant;
pub use operand::{LabelId, Operand, RegionId, SiteId, Slot};
pub use ops::{BinaryOp, UnaryOp};
pub use position::{LineIndex, SourcePosition};
pub use structured::{
    Block, CatchClause, FinallyClause, LoopStmt, Op, RegionKind, Stmt, StructuredFunction,
    TryStmt,
};
