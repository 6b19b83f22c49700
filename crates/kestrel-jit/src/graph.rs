//! Optimized-tier control-flow graph
//!
//! Blocks live in an arena and refer to each other by [`BlockId`]. Every way
//! of leaving a statement abruptly is an explicit [`ExitEdge`] carrying an
//! [`ExitTag`]; the finally synthesizer rewrites those edges into plain jumps
//! through materialized copies of the finally bodies they cross.

use std::fmt;

use kestrel_ir::{BinaryOp, LabelId, Operand, RegionId, SiteId, Slot, SourcePosition, UnaryOp};
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::error::LoweringError;
use crate::speculation::Speculation;

/// Index of a block in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Arena index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Frame cell holding a thrown value and its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct ExcSlot(pub u32);

impl ExcSlot {
    /// Frame index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExcSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Why control is leaving a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExitTag {
    /// Fallthrough out of a protected region
    Normal,
    /// `break label`
    Break(LabelId),
    /// `continue label`
    Continue(LabelId),
    /// `return`; the value was captured into the slot at the return site
    Return(Slot),
    /// `throw` or a throwing call; the exception sits in the cell
    Throw(ExcSlot),
}

impl fmt::Display for ExitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Break(label) => write!(f, "break {label}"),
            Self::Continue(label) => write!(f, "continue {label}"),
            Self::Return(slot) => write!(f, "return {slot}"),
            Self::Throw(exc) => write!(f, "throw {exc}"),
        }
    }
}

/// Final destination of an exit edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExitTarget {
    /// A block in the same function (label targets, fallthrough)
    Block(BlockId),
    /// A catch body; the exception is bound to `binding` on entry
    Catch {
        /// First block of the catch body
        entry: BlockId,
        /// Catch binding
        binding: Slot,
    },
    /// The function's single exit node
    FunctionExit,
    /// Propagate to the caller
    Unwind,
}

impl fmt::Display for ExitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(block) => write!(f, "{block}"),
            Self::Catch { entry, binding } => write!(f, "catch {entry} ({binding})"),
            Self::FunctionExit => write!(f, "exit"),
            Self::Unwind => write!(f, "unwind"),
        }
    }
}

/// An abrupt transfer not yet routed through its finally bodies
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExitEdge {
    /// Exit reason
    pub tag: ExitTag,
    /// Destination once every crossed finally body has run
    pub target: ExitTarget,
    /// Finally regions left on the way, innermost first
    pub crosses: Vec<RegionId>,
}

impl ExitEdge {
    /// Edge to `target` that crosses no finally region
    pub fn direct(tag: ExitTag, target: ExitTarget) -> Self {
        Self {
            tag,
            target,
            crosses: Vec::new(),
        }
    }
}

impl fmt::Display for ExitEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.tag, self.target)?;
        if !self.crosses.is_empty() {
            write!(f, " via [")?;
            for (i, region) in self.crosses.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{region}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Straight-line instruction
#[derive(Debug, Clone, Serialize)]
pub enum Instr {
    /// dst = src
    Move {
        /// Destination
        dst: Slot,
        /// Source
        src: Operand,
    },
    /// dst = op src
    Unary {
        /// Destination
        dst: Slot,
        /// Operator
        op: UnaryOp,
        /// Operand
        src: Operand,
    },
    /// dst = lhs op rhs, optionally guarded
    Binary {
        /// Destination
        dst: Slot,
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
        /// Speculation checked before the operation
        guard: Option<Speculation>,
        /// Bailout site if the guard fails
        site: SiteId,
    },
    /// Store a new exception into `exc`
    Raise {
        /// Exception cell
        exc: ExcSlot,
        /// Thrown value
        value: Operand,
        /// Throw site
        position: SourcePosition,
    },
    /// Bind a caught exception
    TakeException {
        /// Catch binding
        dst: Slot,
        /// Exception cell
        exc: ExcSlot,
    },
    /// Unconditional bailout of this activation
    Deoptimize {
        /// Bailout site
        site: SiteId,
    },
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move { dst, src } => write!(f, "{dst} = {src}"),
            Self::Unary { dst, op, src } => write!(f, "{dst} = {}{src}", op.symbol()),
            Self::Binary {
                dst,
                op,
                lhs,
                rhs,
                guard,
                site,
            } => {
                write!(f, "{dst} = {lhs} {} {rhs}", op.symbol())?;
                if let Some(guard) = guard {
                    write!(f, " [guard {guard:?} {site}]")?;
                }
                Ok(())
            }
            Self::Raise {
                exc,
                value,
                position,
            } => write!(f, "{exc} = raise {value} at {position}"),
            Self::TakeException { dst, exc } => write!(f, "{dst} = take {exc}"),
            Self::Deoptimize { site } => write!(f, "deoptimize {site}"),
        }
    }
}

/// Exception edge of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ThrowEdge {
    /// Not yet routed
    Pending(ExitEdge),
    /// Routed to a concrete block
    Resolved(BlockId),
}

/// Block terminator
#[derive(Debug, Clone, Serialize)]
pub enum Terminator {
    /// Unconditional jump
    Jump(BlockId),
    /// Two-way branch on truthiness
    Branch {
        /// Condition
        cond: Operand,
        /// Truthy successor
        then_block: BlockId,
        /// Falsy successor
        else_block: BlockId,
    },
    /// Call with a normal and an exceptional successor
    Call {
        /// Result slot
        dst: Slot,
        /// Called value
        callee: Operand,
        /// Arguments
        args: Vec<Operand>,
        /// Call site
        position: SourcePosition,
        /// Cell receiving a thrown exception
        exception: ExcSlot,
        /// Successor on return
        normal: BlockId,
        /// Successor on throw
        on_throw: ThrowEdge,
    },
    /// Abrupt exit awaiting finally synthesis
    Exit(ExitEdge),
    /// End of a finally template; only appears before synthesis
    EndFinally(RegionId),
    /// Leave the function with the value in `slot`
    Return(Slot),
    /// Propagate the exception in the cell to the caller
    Unwind(ExcSlot),
    /// Placeholder for a block still under construction
    Unreachable,
}

impl Terminator {
    /// Successors reached through plain control flow
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump(target) => vec![*target],
            Self::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Self::Call {
                normal, on_throw, ..
            } => match on_throw {
                ThrowEdge::Resolved(handler) => vec![*normal, *handler],
                ThrowEdge::Pending(_) => vec![*normal],
            },
            Self::Exit(_)
            | Self::EndFinally(_)
            | Self::Return(_)
            | Self::Unwind(_)
            | Self::Unreachable => Vec::new(),
        }
    }

    pub(crate) fn remap(&mut self, map: impl Fn(BlockId) -> BlockId) {
        match self {
            Self::Jump(target) => *target = map(*target),
            Self::Branch {
                then_block,
                else_block,
                ..
            } => {
                *then_block = map(*then_block);
                *else_block = map(*else_block);
            }
            Self::Call {
                normal, on_throw, ..
            } => {
                *normal = map(*normal);
                if let ThrowEdge::Resolved(handler) = on_throw {
                    *handler = map(*handler);
                }
            }
            Self::Exit(_)
            | Self::EndFinally(_)
            | Self::Return(_)
            | Self::Unwind(_)
            | Self::Unreachable => {}
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jump(target) => write!(f, "jump {target}"),
            Self::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "branch {cond} ? {then_block} : {else_block}"),
            Self::Call {
                dst,
                callee,
                args,
                exception,
                normal,
                on_throw,
                ..
            } => {
                write!(f, "{dst} = call {callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ") -> {normal}, throw {exception} -> ")?;
                match on_throw {
                    ThrowEdge::Pending(edge) => write!(f, "pending {edge}"),
                    ThrowEdge::Resolved(handler) => write!(f, "{handler}"),
                }
            }
            Self::Exit(edge) => write!(f, "exit {edge}"),
            Self::EndFinally(region) => write!(f, "end_finally {region}"),
            Self::Return(slot) => write!(f, "return {slot}"),
            Self::Unwind(exc) => write!(f, "unwind {exc}"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A finally body being executed around a block, with the exit it resumes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InFlight {
    /// Finally region whose body is running
    pub region: RegionId,
    /// Exit taken when the body completes normally
    pub resume: ExitEdge,
}

/// How a block came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockOrigin {
    /// Lowered directly from the function body
    Source,
    /// Instantiated from a finally template
    FinallyCopy {
        /// Region whose body was copied
        region: RegionId,
        /// Template block it was copied from
        template: BlockId,
    },
    /// Delivers an exit to its final target
    Delivery,
}

/// Basic block
#[derive(Debug, Clone, Serialize)]
pub struct BasicBlock {
    /// Own id
    pub id: BlockId,
    /// Straight-line instructions
    pub instrs: Vec<Instr>,
    /// Terminator
    pub terminator: Terminator,
    /// How the block came to exist
    pub origin: BlockOrigin,
    /// Finally body this block is a template of, if any; templates never run
    pub template: Option<RegionId>,
    /// Protected regions entered at this block, outermost first
    pub active: Vec<RegionId>,
    /// Finally bodies executing around this block, outermost first
    pub in_flight: Vec<InFlight>,
}

/// Function graph
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    /// Block arena
    pub blocks: Vec<BasicBlock>,
    /// Entry block
    pub entry: BlockId,
    /// Single exit node
    pub exit: BlockId,
}

impl Graph {
    /// Create a graph with entry and exit blocks
    pub fn new() -> Self {
        let mut graph = Self {
            blocks: Vec::new(),
            entry: BlockId(0),
            exit: BlockId(0),
        };
        graph.entry = graph.add_block(None, Vec::new(), Vec::new());
        graph.exit = graph.add_block(None, Vec::new(), Vec::new());
        graph
    }

    /// Append a source block
    pub fn add_block(
        &mut self,
        template: Option<RegionId>,
        active: Vec<RegionId>,
        in_flight: Vec<InFlight>,
    ) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            instrs: Vec::new(),
            terminator: Terminator::Unreachable,
            origin: BlockOrigin::Source,
            template,
            active,
            in_flight,
        });
        id
    }

    /// Append a copy of `block` under a new id, keeping its terminator as is
    pub fn push_block(&mut self, mut block: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        block.id = id;
        self.blocks.push(block);
        id
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the graph has no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get block by id
    pub fn block(&self, id: BlockId) -> Result<&BasicBlock, LoweringError> {
        self.blocks
            .get(id.index())
            .ok_or(LoweringError::MissingBlock(id))
    }

    /// Get mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut BasicBlock, LoweringError> {
        self.blocks
            .get_mut(id.index())
            .ok_or(LoweringError::MissingBlock(id))
    }

    /// Blocks reachable from the entry, in discovery order
    pub fn reachable(&self) -> Vec<BlockId> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = vec![self.entry];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(block) = self.blocks.get(id.index()) {
                let mut succs = block.terminator.successors();
                succs.reverse();
                stack.extend(succs);
            }
        }
        order
    }

    /// Check that synthesis left nothing unresolved on any reachable path
    pub fn verify(&self) -> Result<(), LoweringError> {
        for id in self.reachable() {
            let block = self.block(id)?;
            if block.template.is_some() {
                return Err(LoweringError::ReachableTemplate(id));
            }
            match &block.terminator {
                Terminator::Exit(edge) => {
                    return Err(LoweringError::UnresolvedExit {
                        block: id,
                        edge: edge.to_string(),
                    });
                }
                Terminator::Call {
                    on_throw: ThrowEdge::Pending(edge),
                    ..
                } => {
                    return Err(LoweringError::UnresolvedExit {
                        block: id,
                        edge: edge.to_string(),
                    });
                }
                Terminator::EndFinally(region) => {
                    return Err(LoweringError::ReachableEndFinally { block: id, region: *region });
                }
                Terminator::Unreachable => return Err(LoweringError::MissingTerminator(id)),
                _ => {}
            }
            for succ in block.terminator.successors() {
                self.block(succ)?;
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entry {}, exit {}", self.entry, self.exit)?;
        for block in &self.blocks {
            write!(f, "{}:", block.id)?;
            if let Some(region) = block.template {
                write!(f, " template({region})")?;
            }
            if let BlockOrigin::FinallyCopy { region, template } = block.origin {
                write!(f, " copy({region} of {template})")?;
            }
            if !block.active.is_empty() {
                write!(f, " active{:?}", block.active.iter().map(|r| r.0).collect::<Vec<_>>())?;
            }
            for in_flight in &block.in_flight {
                write!(f, " in_flight({}: {})", in_flight.region, in_flight.resume)?;
            }
            writeln!(f)?;
            for instr in &block.instrs {
                writeln!(f, "    {instr}")?;
            }
            writeln!(f, "    {}", block.terminator)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_rejects_reachable_exit() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        graph.blocks[entry.index()].terminator =
            Terminator::Exit(ExitEdge::direct(ExitTag::Normal, ExitTarget::FunctionExit));
        assert!(matches!(
            graph.verify(),
            Err(LoweringError::UnresolvedExit { .. })
        ));
    }

    #[test]
    fn test_edge_display() {
        let edge = ExitEdge {
            tag: ExitTag::Break(LabelId(1)),
            target: ExitTarget::Block(BlockId(4)),
            crosses: vec![RegionId(0), RegionId(2)],
        };
        assert_eq!(edge.to_string(), "break L1 -> b4 via [R0, R2]");
    }
}
