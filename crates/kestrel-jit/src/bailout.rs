//! Deoptimization bailout.
//!
//! When optimized code hits a failed speculation or a forced deoptimization
//! it stops and hands its frame to the [`BailoutCoordinator`] as a
//! [`FrameSnapshot`]. The coordinator checks the snapshot against the
//! region table and the baseline handler table, then rebuilds the baseline
//! frame so execution continues at the equivalent instruction.
//!
//! # Bailout flow
//!
//! ```text
//! optimized code:
//!   guard / deoptimize
//!     ├─ holds  → continue
//!     └─ fails  → FrameSnapshot { site, slots, active, in_flight }
//!
//! caller (engine):
//!   snapshot = run_optimized(...)
//!   state = coordinator.reconstruct(snapshot)
//!   increment bailout_count
//!   if bailout_count >= DEOPT_THRESHOLD:
//!     drop optimized code (never optimize again)
//!   resume baseline at state.pc
//! ```
//!
//! Eager bailouts resume *at* the site: nothing past the guard was
//! committed, so the baseline tier re-executes the operation. Lazy bailouts
//! resume *after* the site: the intrinsic already ran.

use kestrel_ir::{RegionId, RegionKind, SiteId};
use kestrel_vm::{BytecodeFunction, Completion, HandlerFrame, ResumeState, Value};
use tracing::debug;

use crate::error::BailoutError;
use crate::graph::BlockId;
use crate::regions::RegionTable;

/// Number of bailouts before a function's optimized code is discarded.
///
/// After this many bailouts, the function runs in the baseline tier for
/// the rest of the engine's lifetime.
pub const DEOPT_THRESHOLD: u32 = 10;

/// Where the baseline tier picks up relative to the bailout site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutKind {
    /// Re-execute the site's instruction
    Eager,
    /// Continue after the site's instruction
    Lazy,
}

/// Reason for a bailout from optimized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutReason {
    /// Type guard failed (e.g., expected numbers but got a string).
    TypeGuardFailure,
    /// `%DeoptimizeFunction` asked for it.
    Requested,
}

impl BailoutReason {
    /// How the baseline tier resumes for this reason
    pub fn kind(self) -> BailoutKind {
        match self {
            Self::TypeGuardFailure => BailoutKind::Eager,
            Self::Requested => BailoutKind::Lazy,
        }
    }
}

/// A finally body executing at the bailout point
#[derive(Debug, Clone)]
pub struct InFlightCompletion {
    /// Finally region whose body is running
    pub region: RegionId,
    /// What resumes when the body completes normally; `None` if its value
    /// was lost, which makes the snapshot unrepresentable
    pub completion: Option<Completion>,
    /// Finally regions the completion still has to pass, innermost first
    pub remaining: Vec<RegionId>,
}

/// Optimized frame state captured at a bailout site
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// Bailout site
    pub site: SiteId,
    /// Why the optimized code stopped
    pub reason: BailoutReason,
    /// Graph block that was executing
    pub block: BlockId,
    /// Frame slots, including optimizer temporaries
    pub slots: Vec<Value>,
    /// Protected regions entered, outermost first
    pub active: Vec<RegionId>,
    /// Finally bodies executing, outermost first
    pub in_flight: Vec<InFlightCompletion>,
}

impl FrameSnapshot {
    /// Eager or lazy resumption
    pub fn kind(&self) -> BailoutKind {
        self.reason.kind()
    }
}

/// Rebuilds baseline frames from optimized snapshots
#[derive(Debug, Clone, Copy)]
pub struct BailoutCoordinator<'a> {
    regions: &'a RegionTable,
    bytecode: &'a BytecodeFunction,
}

impl<'a> BailoutCoordinator<'a> {
    /// Create a coordinator for one function
    pub fn new(regions: &'a RegionTable, bytecode: &'a BytecodeFunction) -> Self {
        Self { regions, bytecode }
    }

    /// Check the snapshot against both tiers' region metadata
    pub fn validate(&self, snapshot: &FrameSnapshot) -> Result<u32, BailoutError> {
        let site = snapshot.site;
        let site_pc = self
            .bytecode
            .site_pc(site)
            .ok_or(BailoutError::UnknownSite(site))?;

        if snapshot.slots.len() < self.bytecode.slot_count as usize {
            return Err(BailoutError::unrepresentable(
                site,
                format!(
                    "{} slots captured, baseline frame needs {}",
                    snapshot.slots.len(),
                    self.bytecode.slot_count
                ),
            ));
        }

        let mut parent = None;
        for (depth, &id) in snapshot.active.iter().enumerate() {
            let region = self
                .regions
                .get(id)
                .ok_or_else(|| BailoutError::unrepresentable(site, format!("unknown region {id}")))?;
            if region.parent != parent {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("region {id} is not nested in {parent:?}"),
                ));
            }
            let entry = self
                .bytecode
                .handler(id)
                .ok_or_else(|| BailoutError::unrepresentable(site, format!("no baseline handler for {id}")))?;
            if entry.kind != region.kind || entry.handler_depth as usize != depth {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("handler {id} disagrees with the region table"),
                ));
            }
            if site_pc < entry.start || site_pc >= entry.end {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("pc {site_pc} outside handler {id}"),
                ));
            }
            parent = Some(id);
        }

        for (depth, in_flight) in snapshot.in_flight.iter().enumerate() {
            let id = in_flight.region;
            let region = self
                .regions
                .get(id)
                .filter(|r| r.kind == RegionKind::Finally)
                .ok_or_else(|| BailoutError::unrepresentable(site, format!("{id} is not a finally region")))?;
            let entry = self
                .bytecode
                .handler(id)
                .ok_or_else(|| BailoutError::unrepresentable(site, format!("no baseline handler for {id}")))?;
            if region.finally_depth as usize != depth || entry.finally_depth as usize != depth {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("finally {id} in flight at depth {depth}"),
                ));
            }
            if in_flight.completion.is_none() {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("completion of finally {id} was lost"),
                ));
            }
            if let Some(missing) = in_flight.remaining.iter().find(|r| !snapshot.active.contains(*r)) {
                return Err(BailoutError::unrepresentable(
                    site,
                    format!("pending exit crosses {missing}, which is not active"),
                ));
            }
        }

        Ok(site_pc)
    }

    /// Turn a snapshot into the state the baseline interpreter resumes from
    pub fn reconstruct(&self, snapshot: FrameSnapshot) -> Result<ResumeState, BailoutError> {
        let site_pc = self.validate(&snapshot)?;
        let pc = match snapshot.kind() {
            BailoutKind::Eager => site_pc,
            BailoutKind::Lazy => site_pc + 1,
        };

        let mut slots = snapshot.slots;
        slots.truncate(self.bytecode.slot_count as usize);
        let handlers = snapshot
            .active
            .iter()
            .map(|&region| HandlerFrame { region })
            .collect();
        let completions = snapshot
            .in_flight
            .into_iter()
            .filter_map(|in_flight| in_flight.completion)
            .collect::<Vec<_>>();

        debug!(
            site = %snapshot.site,
            reason = ?snapshot.reason,
            pc,
            handlers = snapshot.active.len(),
            completions = completions.len(),
            "reconstructed baseline frame"
        );

        Ok(ResumeState {
            pc,
            slots,
            handlers,
            completions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_vm::{BytecodeGenerator, PendingException};

    use crate::compiler::{JitCompiler, JitOptions};
    use kestrel_compiler::Compiler;

    fn compile(source: &str) -> (crate::compiler::OptimizedFunction, BytecodeFunction) {
        let function = Compiler::new(source).compile_function().unwrap();
        let optimized = JitCompiler::new(JitOptions::default()).compile(&function).unwrap();
        let bytecode = BytecodeGenerator::compile(&function).unwrap();
        (optimized, bytecode)
    }

    fn snapshot(site: u32, active: Vec<RegionId>, in_flight: Vec<InFlightCompletion>, slots: usize) -> FrameSnapshot {
        FrameSnapshot {
            site: SiteId(site),
            reason: BailoutReason::Requested,
            block: BlockId(0),
            slots: vec![Value::Undefined; slots],
            active,
            in_flight,
        }
    }

    #[test]
    fn lazy_bailout_resumes_after_site() {
        let (optimized, bytecode) = compile("(function(a) { %DeoptimizeFunction(f); return a; })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let state = coordinator
            .reconstruct(snapshot(0, Vec::new(), Vec::new(), optimized.slot_count as usize))
            .unwrap();
        assert_eq!(state.pc, bytecode.site_pc(SiteId(0)).unwrap() + 1);
        assert_eq!(state.slots.len(), bytecode.slot_count as usize);
    }

    #[test]
    fn eager_bailout_resumes_at_site() {
        let (optimized, bytecode) = compile("(function(a) { return a + 1; })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let mut snap = snapshot(0, Vec::new(), Vec::new(), optimized.slot_count as usize);
        snap.reason = BailoutReason::TypeGuardFailure;
        let state = coordinator.reconstruct(snap).unwrap();
        assert_eq!(state.pc, bytecode.site_pc(SiteId(0)).unwrap());
    }

    #[test]
    fn active_region_must_cover_site() {
        // the deopt site follows the try statement
        let (optimized, bytecode) =
            compile("(function(a) { try { a = 1; } catch (e) { } %DeoptimizeFunction(f); return a; })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let err = coordinator
            .validate(&snapshot(0, vec![RegionId(0)], Vec::new(), optimized.slot_count as usize))
            .unwrap_err();
        assert!(matches!(err, BailoutError::Unrepresentable { .. }));
    }

    #[test]
    fn in_flight_throw_becomes_completion() {
        let (optimized, bytecode) =
            compile("(function(a) { try { throw a; } finally { %DeoptimizeFunction(f); } })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let exception = PendingException::new(Value::number(1.0), Default::default());
        let in_flight = vec![InFlightCompletion {
            region: RegionId(0),
            completion: Some(Completion::Throw(exception)),
            remaining: Vec::new(),
        }];
        let state = coordinator
            .reconstruct(snapshot(0, Vec::new(), in_flight, optimized.slot_count as usize))
            .unwrap();
        assert_eq!(state.completions.len(), 1);
        assert!(state.handlers.is_empty());
    }

    #[test]
    fn lost_completion_is_unrepresentable() {
        let (optimized, bytecode) =
            compile("(function(a) { try { throw a; } finally { %DeoptimizeFunction(f); } })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let in_flight = vec![InFlightCompletion {
            region: RegionId(0),
            completion: None,
            remaining: Vec::new(),
        }];
        let err = coordinator
            .validate(&snapshot(0, Vec::new(), in_flight, optimized.slot_count as usize))
            .unwrap_err();
        assert!(matches!(err, BailoutError::Unrepresentable { .. }));
    }

    #[test]
    fn short_frame_is_unrepresentable() {
        let (optimized, bytecode) = compile("(function(a, b) { %DeoptimizeFunction(f); return a; })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let err = coordinator
            .validate(&snapshot(0, Vec::new(), Vec::new(), 1))
            .unwrap_err();
        assert!(matches!(err, BailoutError::Unrepresentable { .. }));
    }

    #[test]
    fn unknown_site_rejected() {
        let (optimized, bytecode) = compile("(function(a) { return a; })");
        let coordinator = BailoutCoordinator::new(&optimized.regions, &bytecode);
        let err = coordinator
            .validate(&snapshot(3, Vec::new(), Vec::new(), optimized.slot_count as usize))
            .unwrap_err();
        assert_eq!(err, BailoutError::UnknownSite(SiteId(3)));
    }
}
