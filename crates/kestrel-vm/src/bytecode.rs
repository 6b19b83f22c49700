//! Baseline bytecode
//!
//! Instructions address frame slots directly; the frame layout is the one
//! chosen by the front end, so both tiers agree on where every binding lives.
//! Exception handling is table driven: `EnterTry`/`LeaveTry` maintain the
//! dynamic handler stack and the [`HandlerEntry`] table says where each
//! region's handler starts.

use kestrel_ir::{BinaryOp, Constant, LabelId, RegionId, RegionKind, SiteId, Slot, SourcePosition, UnaryOp};
use serde::Serialize;

/// Index into the constant pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct ConstantIndex(pub u32);

impl ConstantIndex {
    /// Get index value
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Jump offset relative to the jumping instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct JumpOffset(pub i32);

impl JumpOffset {
    /// Get offset value
    #[inline]
    pub const fn offset(self) -> i32 {
        self.0
    }
}

/// Instruction input: a slot or a pooled constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Input {
    /// Read a frame slot
    Slot(Slot),
    /// Read a constant
    Const(ConstantIndex),
}

/// Bytecode instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Instruction {
    /// dst = src
    Move {
        /// Destination
        dst: Slot,
        /// Source
        src: Input,
    },
    /// dst = op src
    Unary {
        /// Destination
        dst: Slot,
        /// Operator
        op: UnaryOp,
        /// Operand
        src: Input,
    },
    /// dst = lhs op rhs
    Binary {
        /// Destination
        dst: Slot,
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Input,
        /// Right operand
        rhs: Input,
    },
    /// dst = callee(args...)
    Call {
        /// Destination
        dst: Slot,
        /// Called value
        callee: Input,
        /// Arguments
        args: Vec<Input>,
        /// Position reported for values thrown by native callees
        position: SourcePosition,
    },
    /// Deoptimization point; a no-op in this tier
    Deoptimize,
    /// Unconditional jump
    Jump {
        /// Offset
        offset: JumpOffset,
    },
    /// Jump if the condition is falsy
    JumpIfFalse {
        /// Condition
        cond: Input,
        /// Offset
        offset: JumpOffset,
    },
    /// Push a handler frame for `region`
    EnterTry {
        /// Region entered
        region: RegionId,
    },
    /// Pop the handler frame for `region`
    LeaveTry {
        /// Region left
        region: RegionId,
    },
    /// Move the pending exception into `dst`
    Catch {
        /// Catch binding
        dst: Slot,
    },
    /// Start a normal completion of a finally body
    EnterFinally {
        /// Finally region
        region: RegionId,
    },
    /// Finish a finally body: resume the completion it interrupted
    EndFinally {
        /// Finally region
        region: RegionId,
    },
    /// Abrupt `break` completion
    Break {
        /// Target label
        label: LabelId,
    },
    /// Abrupt `continue` completion
    Continue {
        /// Target label
        label: LabelId,
    },
    /// Abrupt `return` completion
    Return {
        /// Returned value
        src: Input,
    },
    /// Abrupt `throw` completion
    Throw {
        /// Thrown value
        src: Input,
        /// Position of the `throw` keyword
        position: SourcePosition,
    },
}

impl Instruction {
    /// Whether this is a jump with a patchable offset
    pub fn is_jump(&self) -> bool {
        matches!(self, Self::Jump { .. } | Self::JumpIfFalse { .. })
    }
}

/// Static description of a protected region
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerEntry {
    /// Region id shared with the optimizing tier
    pub region: RegionId,
    /// Catch or finally
    pub kind: RegionKind,
    /// First covered instruction
    pub start: u32,
    /// One past the last covered instruction
    pub end: u32,
    /// First instruction of the catch or finally body
    pub handler_pc: u32,
    /// Handler frames below this region's frame
    pub handler_depth: u32,
    /// Finally bodies executing around this region
    pub finally_depth: u32,
}

/// Where `break`/`continue` to a label lands
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelEntry {
    /// Label id
    pub label: LabelId,
    /// `break` target
    pub break_pc: u32,
    /// `continue` target; labeled blocks have none
    pub continue_pc: Option<u32>,
    /// Handler frames active at the labeled statement
    pub handler_depth: u32,
    /// Finally bodies executing around the labeled statement
    pub finally_depth: u32,
}

/// Constant pool with deduplication
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConstantPool {
    constants: Vec<Constant>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant to the pool, returns its index
    pub fn add(&mut self, constant: Constant) -> ConstantIndex {
        if let Some(idx) = self.constants.iter().position(|c| same_constant(c, &constant)) {
            return ConstantIndex(idx as u32);
        }
        let idx = self.constants.len() as u32;
        self.constants.push(constant);
        ConstantIndex(idx)
    }

    /// Get constant by index
    pub fn get(&self, index: ConstantIndex) -> Option<&Constant> {
        self.constants.get(index.0 as usize)
    }

    /// Number of constants
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

/// Bitwise identity for numbers so `0` and `-0` stay distinct
fn same_constant(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Number(x), Constant::Number(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

/// A function compiled for the baseline tier
#[derive(Debug, Clone, Serialize)]
pub struct BytecodeFunction {
    /// Function name
    pub name: String,
    /// Number of parameters
    pub param_count: u16,
    /// Number of frame slots
    pub slot_count: u16,
    /// Instructions
    pub instructions: Vec<Instruction>,
    /// Constants
    pub constants: ConstantPool,
    /// Protected regions, indexed by region id
    pub handlers: Vec<HandlerEntry>,
    /// Label targets, indexed by label id
    pub labels: Vec<LabelEntry>,
    /// Program counter of each bailout site, indexed by site id
    pub sites: Vec<u32>,
}

impl BytecodeFunction {
    /// Look up a region
    pub fn handler(&self, region: RegionId) -> Option<&HandlerEntry> {
        self.handlers.get(region.index())
    }

    /// Look up a label
    pub fn label(&self, label: LabelId) -> Option<&LabelEntry> {
        self.labels.get(label.index())
    }

    /// Program counter of a bailout site
    pub fn site_pc(&self, site: SiteId) -> Option<u32> {
        self.sites.get(site.index()).copied()
    }
}
