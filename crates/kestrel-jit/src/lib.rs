//! # Kestrel JIT
//!
//! The optimizing tier. A [`StructuredFunction`](kestrel_ir::StructuredFunction)
//! is lowered in three passes:
//!
//! 1. [`normalize`]: build a block graph in which `break`, `continue`,
//!    `return`, `throw` and throwing calls are explicit exit edges, and
//!    record the [`RegionTable`]
//! 2. [`finally`]: route every exit edge through its own copy of each
//!    finally body it crosses
//! 3. [`Graph::verify`]: reject any reachable exit left unrouted
//!
//! The [`Executor`] runs the result. Failed speculation or
//! `%DeoptimizeFunction` stops it with a [`FrameSnapshot`], which the
//! [`BailoutCoordinator`] turns into baseline interpreter state.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bailout;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod finally;
pub mod graph;
pub mod normalize;
pub mod regions;
pub mod speculation;

pub use bailout::{
    BailoutCoordinator, BailoutKind, BailoutReason, DEOPT_THRESHOLD, FrameSnapshot,
    InFlightCompletion,
};
pub use compiler::{JitCompiler, JitOptions, OptimizedFunction};
pub use error::{BailoutError, LoweringError, LoweringResult};
pub use executor::{Executor, Outcome};
pub use finally::{FinallySynthesizer, SynthesisStats};
pub use graph::{
    BasicBlock, BlockId, BlockOrigin, ExcSlot, ExitEdge, ExitTag, ExitTarget, Graph, InFlight, Instr,
    Terminator, ThrowEdge,
};
pub use normalize::{NormalizedFunction, Normalizer};
pub use regions::{ProtectedRegion, RegionTable};
pub use speculation::{DisabledPlan, GuardPolicy, Speculation, SpeculationPlan};
