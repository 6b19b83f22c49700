//! Frame slots, identifiers and instruction operands

use std::fmt;

use serde::Serialize;

use crate::constant::Constant;

/// Frame slot holding a parameter, a local binding or a temporary.
///
/// Both tiers address the frame through the same slot numbering, so a
/// bailout can hand the slot vector over without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct Slot(pub u16);

impl Slot {
    /// Create a new slot
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Get slot index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Target of `break`/`continue`, resolved by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct LabelId(pub u32);

impl LabelId {
    /// Get label index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identity of one protected region (the catch part or the finally part
/// of a `try` statement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Get region index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Identity of an operation at which optimized code may bail out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct SiteId(pub u32);

impl SiteId {
    /// Get site index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Instruction input: a frame slot or an inline constant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    /// Read a frame slot
    Slot(Slot),
    /// Inline constant
    Const(Constant),
}

impl Operand {
    /// Operand reading `slot`
    #[inline]
    pub const fn slot(slot: Slot) -> Self {
        Self::Slot(slot)
    }

    /// The `undefined` constant
    #[inline]
    pub const fn undefined() -> Self {
        Self::Const(Constant::Undefined)
    }

    /// The slot this operand reads, if any
    #[inline]
    pub fn as_slot(&self) -> Option<Slot> {
        match self {
            Self::Slot(slot) => Some(*slot),
            Self::Const(_) => None,
        }
    }

    /// The constant this operand carries, if any
    #[inline]
    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Self::Const(constant) => Some(constant),
            Self::Slot(_) => None,
        }
    }
}

impl From<Slot> for Operand {
    fn from(slot: Slot) -> Self {
        Self::Slot(slot)
    }
}

impl From<Constant> for Operand {
    fn from(constant: Constant) -> Self {
        Self::Const(constant)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(slot) => write!(f, "{slot}"),
            Self::Const(constant) => write!(f, "{constant}"),
        }
    }
}
