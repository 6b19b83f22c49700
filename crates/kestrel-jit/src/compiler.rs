//! Optimizing compiler driver

use kestrel_ir::{Slot, StructuredFunction};
use serde::Serialize;
use tracing::debug;

use crate::error::LoweringResult;
use crate::finally::{FinallySynthesizer, SynthesisStats};
use crate::graph::Graph;
use crate::normalize::{NormalizedFunction, Normalizer};
use crate::regions::RegionTable;
use crate::speculation::{DisabledPlan, SpeculationPlan};

/// Optimizing compiler options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    /// Attach type guards to binary operations
    pub speculation: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self { speculation: true }
    }
}

/// A function lowered for the optimized tier
#[derive(Debug, Clone, Serialize)]
pub struct OptimizedFunction {
    /// Function name
    pub name: String,
    /// Number of parameters
    pub param_count: u16,
    /// Slots shared with the baseline frame
    pub frame_slots: u16,
    /// All slots, including temporaries added by lowering
    pub slot_count: u32,
    /// Exception cells
    pub exception_count: u32,
    /// Slot holding the value returned by the exit block
    pub return_slot: Slot,
    /// Graph after finally synthesis
    pub graph: Graph,
    /// Protected regions
    pub regions: RegionTable,
    /// Finally bodies instantiated
    pub finally_copies: usize,
}

/// Lowers structured functions for the optimized tier
#[derive(Debug, Clone, Copy, Default)]
pub struct JitCompiler {
    options: JitOptions,
}

impl JitCompiler {
    /// Create a compiler
    pub fn new(options: JitOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> JitOptions {
        self.options
    }

    /// Build the exit-tagged graph without routing exits
    pub fn normalize(&self, function: &StructuredFunction) -> LoweringResult<NormalizedFunction> {
        if self.options.speculation {
            let plan = SpeculationPlan::analyze(function);
            Normalizer::normalize(function, &plan)
        } else {
            Normalizer::normalize(function, &DisabledPlan)
        }
    }

    /// Normalize, synthesize finally bodies and verify the result
    pub fn compile(&self, function: &StructuredFunction) -> LoweringResult<OptimizedFunction> {
        let mut normalized = self.normalize(function)?;
        let SynthesisStats { copies, .. } = FinallySynthesizer::synthesize(
            &mut normalized.graph,
            &normalized.regions,
            normalized.return_slot,
        )?;

        debug!(
            function = function.display_name(),
            blocks = normalized.graph.len(),
            regions = normalized.regions.len(),
            finally_copies = copies,
            speculation = self.options.speculation,
            "compiled optimized graph"
        );

        Ok(OptimizedFunction {
            name: function.display_name().to_string(),
            param_count: function.param_count,
            frame_slots: function.slot_count,
            slot_count: normalized.slot_count,
            exception_count: normalized.exception_count,
            return_slot: normalized.return_slot,
            graph: normalized.graph,
            regions: normalized.regions,
            finally_copies: copies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoweringError;
    use kestrel_compiler::Compiler;
    use kestrel_ir::{Block, LabelId, Stmt};

    fn compile(source: &str) -> OptimizedFunction {
        let function = Compiler::new(source).compile_function().unwrap();
        JitCompiler::default().compile(&function).unwrap()
    }

    #[test]
    fn test_compile_reports_frame_layout() {
        let optimized = compile("(function(a, b) { var c = a; return c; })");
        assert_eq!(optimized.param_count, 2);
        assert_eq!(optimized.frame_slots, 3);
        assert!(optimized.slot_count > u32::from(optimized.frame_slots));
        assert_eq!(optimized.finally_copies, 0);
    }

    #[test]
    fn test_break_to_unknown_label_is_defect() {
        let function = StructuredFunction {
            name: None,
            param_count: 0,
            slot_count: 0,
            slot_names: Vec::new(),
            label_count: 1,
            region_count: 0,
            site_count: 0,
            body: Block::from(vec![Stmt::Break(LabelId(0))]),
        };
        let err = JitCompiler::default().compile(&function).unwrap_err();
        assert_eq!(err, LoweringError::UnresolvedLabel(LabelId(0)));
    }

    #[test]
    fn test_continue_to_block_label_is_defect() {
        let function = StructuredFunction {
            name: None,
            param_count: 0,
            slot_count: 0,
            slot_names: Vec::new(),
            label_count: 1,
            region_count: 0,
            site_count: 0,
            body: Block::from(vec![Stmt::Labeled {
                label: LabelId(0),
                body: Block::from(vec![Stmt::Continue(LabelId(0))]),
            }]),
        };
        let err = JitCompiler::default().compile(&function).unwrap_err();
        assert_eq!(err, LoweringError::ContinueToNonLoop(LabelId(0)));
    }

    #[test]
    fn test_graph_serializes() {
        let optimized = compile("(function(a) { try { return a; } finally { a = 1; } })");
        let json = serde_json::to_value(&optimized).unwrap();
        assert!(json["graph"]["blocks"].is_array());
        assert_eq!(json["regions"]["regions"].as_array().unwrap().len(), 1);
    }
}
