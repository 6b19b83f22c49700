//! Optimizing-tier errors
//!
//! Both enums describe defects in the lowering itself. Well-formed input
//! never produces them; compilation aborts as soon as one is detected.

use kestrel_ir::{LabelId, RegionId, SiteId};

use crate::graph::BlockId;

/// Construction-time defects found while building or synthesizing a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoweringError {
    /// `break`/`continue` names a label that does not enclose it
    #[error("label {0} does not enclose its break or continue")]
    UnresolvedLabel(LabelId),

    /// `continue` targets a labeled block rather than a loop
    #[error("continue to non-loop label {0}")]
    ContinueToNonLoop(LabelId),

    /// Two regions overlap without one containing the other
    #[error("regions {inner} and {outer} are not properly nested")]
    ImproperNesting {
        /// Region that should be contained
        inner: RegionId,
        /// Region that should contain it
        outer: RegionId,
    },

    /// A region id was used twice or never described
    #[error("unknown or duplicate region {0}")]
    UnknownRegion(RegionId),

    /// A bailout site was reused
    #[error("duplicate bailout site {0}")]
    DuplicateSite(SiteId),

    /// A reachable block still leaves through an unrouted exit
    #[error("unresolved exit in block {block}: {edge}")]
    UnresolvedExit {
        /// Offending block
        block: BlockId,
        /// Rendered edge
        edge: String,
    },

    /// A finally template end is reachable
    #[error("end of finally template {region} reachable from block {block}")]
    ReachableEndFinally {
        /// Offending block
        block: BlockId,
        /// Template region
        region: RegionId,
    },

    /// A template block is reachable without being copied
    #[error("finally template block {0} is reachable")]
    ReachableTemplate(BlockId),

    /// A reachable block was never terminated
    #[error("block {0} has no terminator")]
    MissingTerminator(BlockId),

    /// Block id outside the arena
    #[error("block {0} does not exist")]
    MissingBlock(BlockId),

    /// Temporaries no longer fit the slot space
    #[error("too many frame slots")]
    TooManySlots,

    /// Synthesis did not converge
    #[error("finally synthesis produced more than {limit} blocks")]
    TooManyBlocks {
        /// Block limit
        limit: usize,
    },
}

/// Result type for graph construction
pub type LoweringResult<T> = Result<T, LoweringError>;

/// Failure to turn an optimized frame into baseline state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BailoutError {
    /// The snapshot violates a structural invariant of the region table
    #[error("unrepresentable frame state at {site}: {reason}")]
    Unrepresentable {
        /// Bailout site
        site: SiteId,
        /// What did not line up
        reason: String,
    },

    /// The site has no baseline resume point
    #[error("bailout site {0} has no baseline resume point")]
    UnknownSite(SiteId),
}

impl BailoutError {
    pub(crate) fn unrepresentable(site: SiteId, reason: impl Into<String>) -> Self {
        Self::Unrepresentable {
            site,
            reason: reason.into(),
        }
    }
}
