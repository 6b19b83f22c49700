//! Tiering counters

use std::cell::Cell;
use std::rc::Rc;

use kestrel_jit::BailoutKind;

/// Snapshot of engine counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls that started in optimized code.
    pub optimized_entries: u64,
    /// Calls that ran only in the baseline tier.
    pub baseline_entries: u64,
    /// Bailouts from failed speculation.
    pub eager_bailouts: u64,
    /// Bailouts requested by `%DeoptimizeFunction`.
    pub lazy_bailouts: u64,
    /// Functions whose optimized code was dropped after repeated bailouts.
    pub deoptimizations: u64,
    /// Functions the optimizing compiler rejected; they run baseline only.
    pub jit_fallbacks: u64,
}

impl EngineStats {
    /// All bailouts
    pub fn bailouts(&self) -> u64 {
        self.eager_bailouts.saturating_add(self.lazy_bailouts)
    }
}

/// Counters shared by every function of one engine
#[derive(Debug, Clone, Default)]
pub(crate) struct StatsHandle(Rc<Cell<EngineStats>>);

impl StatsHandle {
    pub(crate) fn get(&self) -> EngineStats {
        self.0.get()
    }

    pub(crate) fn reset(&self) {
        self.0.set(EngineStats::default());
    }

    fn update(&self, f: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.0.get();
        f(&mut stats);
        self.0.set(stats);
    }

    pub(crate) fn optimized_entry(&self) {
        self.update(|s| s.optimized_entries = s.optimized_entries.saturating_add(1));
    }

    pub(crate) fn baseline_entry(&self) {
        self.update(|s| s.baseline_entries = s.baseline_entries.saturating_add(1));
    }

    pub(crate) fn bailout(&self, kind: BailoutKind) {
        self.update(|s| match kind {
            BailoutKind::Eager => s.eager_bailouts = s.eager_bailouts.saturating_add(1),
            BailoutKind::Lazy => s.lazy_bailouts = s.lazy_bailouts.saturating_add(1),
        });
    }

    pub(crate) fn deoptimization(&self) {
        self.update(|s| s.deoptimizations = s.deoptimizations.saturating_add(1));
    }

    pub(crate) fn jit_fallback(&self) {
        self.update(|s| s.jit_fallbacks = s.jit_fallbacks.saturating_add(1));
    }
}
