//! Engine configuration
//!
//! Defaults run every function in the optimized tier with speculation on.
//! The process environment can override them:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `KESTREL_DISABLE_JIT` | run only the baseline tier |
//! | `KESTREL_DISABLE_SPECULATION` | compile optimized code without type guards |
//! | `KESTREL_DEOPT_THRESHOLD` | bailouts before optimized code is dropped |

use std::sync::OnceLock;

use kestrel_jit::{DEOPT_THRESHOLD, JitOptions};
use tracing::warn;

/// Disables the optimized tier when truthy
pub const DISABLE_JIT_VAR: &str = "KESTREL_DISABLE_JIT";
/// Disables type speculation when truthy
pub const DISABLE_SPECULATION_VAR: &str = "KESTREL_DISABLE_SPECULATION";
/// Overrides [`DEOPT_THRESHOLD`]
pub const DEOPT_THRESHOLD_VAR: &str = "KESTREL_DEOPT_THRESHOLD";

static ENV_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Tier a function starts in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tier {
    /// Optimized graph, falling back on bailout
    #[default]
    Optimized,
    /// Bytecode interpreter only
    Baseline,
}

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Compile functions for the optimized tier
    pub jit: bool,
    /// Attach type guards to arithmetic
    pub speculation: bool,
    /// Bailouts a function may take before its optimized code is dropped
    pub deopt_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jit: true,
            speculation: true,
            deopt_threshold: DEOPT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from the process environment, read once per process.
    pub fn from_env() -> Self {
        *ENV_CONFIG.get_or_init(|| Self::from_lookup(|name| std::env::var(name).ok()))
    }

    /// Configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        // Set means on unless the value spells out "off"
        let flag = |name: &str| {
            lookup(name).is_some_and(|value| {
                !matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "" | "0" | "false" | "off" | "no"
                )
            })
        };
        Self {
            jit: !flag(DISABLE_JIT_VAR),
            speculation: !flag(DISABLE_SPECULATION_VAR),
            deopt_threshold: lookup(DEOPT_THRESHOLD_VAR)
                .and_then(|value| {
                    let threshold = value.trim().parse::<u32>().ok().filter(|threshold| *threshold > 0);
                    if threshold.is_none() {
                        warn!(
                            variable = DEOPT_THRESHOLD_VAR,
                            %value,
                            default = defaults.deopt_threshold,
                            "ignoring invalid deopt threshold"
                        );
                    }
                    threshold
                })
                .unwrap_or(defaults.deopt_threshold),
        }
    }

    /// Enable or disable the optimized tier
    pub fn with_jit(mut self, enabled: bool) -> Self {
        self.jit = enabled;
        self
    }

    /// Enable or disable speculation
    pub fn with_speculation(mut self, enabled: bool) -> Self {
        self.speculation = enabled;
        self
    }

    /// Set the deoptimization threshold; zero is treated as one
    pub fn with_deopt_threshold(mut self, threshold: u32) -> Self {
        self.deopt_threshold = threshold.max(1);
        self
    }

    /// Select the starting tier
    pub fn with_tier(self, tier: Tier) -> Self {
        self.with_jit(tier == Tier::Optimized)
    }

    /// Starting tier
    pub fn tier(&self) -> Tier {
        if self.jit {
            Tier::Optimized
        } else {
            Tier::Baseline
        }
    }

    /// Options handed to the optimizing compiler
    pub fn jit_options(&self) -> JitOptions {
        JitOptions {
            speculation: self.speculation,
        }
    }
}
