//! Finally re-entry synthesis
//!
//! Every exit edge that leaves a finally region is routed through its own
//! copy of that region's finally body. A copy is keyed by the region, the
//! exit it resumes once the body completes normally, and the copy context it
//! was instantiated in; edges sharing all three share one copy.
//!
//! ```text
//!   exit return s7 -> exit via [R1, R0]
//!     ⇒ jump copy(R1, resume: return s7 via [R0])
//!         ... body of R1 ...
//!         exit return s7 -> exit via [R0]
//!           ⇒ jump copy(R0, resume: return s7)
//!               ... body of R0 ...
//!               jump deliver(return s7)
//! ```
//!
//! An abrupt exit inside a copy is routed from the copy's context, so it
//! replaces the exit the copy was going to resume.

use kestrel_ir::{Operand, RegionId, RegionKind, Slot};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::{LoweringError, LoweringResult};
use crate::graph::{
    BlockId, BlockOrigin, ExitEdge, ExitTag, ExitTarget, Graph, InFlight, Instr, Terminator,
    ThrowEdge,
};
use crate::regions::RegionTable;

/// Upper bound on blocks created by synthesis
pub const MAX_SYNTHESIZED_BLOCKS: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CopyId(u32);

/// One instantiation of a finally template
#[derive(Debug)]
struct FinallyCopy {
    region: RegionId,
    parent: Option<CopyId>,
    /// Template block to copied block
    map: FxHashMap<BlockId, BlockId>,
    /// Finally bodies executing inside this copy, outermost first
    in_flight: Vec<InFlight>,
}

/// Counters reported after synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    /// Finally bodies instantiated
    pub copies: usize,
    /// Delivery blocks created for catch, return and unwind targets
    pub deliveries: usize,
    /// Blocks added in total
    pub blocks_added: usize,
}

/// Rewrites exit edges into jumps through materialized finally bodies
pub struct FinallySynthesizer<'g> {
    graph: &'g mut Graph,
    regions: &'g RegionTable,
    return_slot: Slot,
    templates: FxHashMap<RegionId, Vec<BlockId>>,
    copies: Vec<FinallyCopy>,
    copy_index: FxHashMap<(RegionId, ExitEdge, Option<CopyId>), CopyId>,
    deliveries: FxHashMap<(ExitTag, ExitTarget), BlockId>,
    context: FxHashMap<BlockId, CopyId>,
    initial_len: usize,
}

impl<'g> FinallySynthesizer<'g> {
    /// Create a synthesizer over a freshly normalized graph
    pub fn new(graph: &'g mut Graph, regions: &'g RegionTable, return_slot: Slot) -> Self {
        let mut templates: FxHashMap<RegionId, Vec<BlockId>> = FxHashMap::default();
        for block in &graph.blocks {
            if let Some(region) = block.template {
                templates.entry(region).or_default().push(block.id);
            }
        }
        let initial_len = graph.len();
        Self {
            graph,
            regions,
            return_slot,
            templates,
            copies: Vec::new(),
            copy_index: FxHashMap::default(),
            deliveries: FxHashMap::default(),
            context: FxHashMap::default(),
            initial_len,
        }
    }

    /// Route every exit reachable from the entry block
    pub fn synthesize(graph: &'g mut Graph, regions: &'g RegionTable, return_slot: Slot) -> LoweringResult<SynthesisStats> {
        let mut synthesizer = Self::new(graph, regions, return_slot);
        synthesizer.run()?;
        let stats = SynthesisStats {
            copies: synthesizer.copies.len(),
            deliveries: synthesizer.deliveries.len(),
            blocks_added: synthesizer.graph.len() - synthesizer.initial_len,
        };
        synthesizer.graph.verify()?;
        debug!(
            copies = stats.copies,
            deliveries = stats.deliveries,
            blocks_added = stats.blocks_added,
            "finally synthesis complete"
        );
        Ok(stats)
    }

    fn run(&mut self) -> LoweringResult<()> {
        let mut visited = FxHashSet::default();
        let mut worklist = vec![self.graph.entry];

        while let Some(id) = worklist.pop() {
            if !visited.insert(id) {
                continue;
            }
            let context = self.context.get(&id).copied();

            match self.graph.block(id)?.terminator.clone() {
                Terminator::Exit(edge) => {
                    let target = self.route(context, &edge)?;
                    self.graph.block_mut(id)?.terminator = Terminator::Jump(target);
                }
                Terminator::Call {
                    on_throw: ThrowEdge::Pending(edge),
                    ..
                } => {
                    let handler = self.route(context, &edge)?;
                    if let Terminator::Call { on_throw, .. } = &mut self.graph.block_mut(id)?.terminator {
                        *on_throw = ThrowEdge::Resolved(handler);
                    }
                }
                _ => {}
            }

            worklist.extend(self.graph.block(id)?.terminator.successors());
        }
        Ok(())
    }

    /// Block that starts the journey of `edge` from a block in `context`
    fn route(&mut self, context: Option<CopyId>, edge: &ExitEdge) -> LoweringResult<BlockId> {
        let Some((&first, rest)) = edge.crosses.split_first() else {
            return self.deliver(context, edge.tag, edge.target);
        };

        let region = self
            .regions
            .get(first)
            .filter(|r| r.kind == RegionKind::Finally)
            .ok_or(LoweringError::UnknownRegion(first))?;
        let (depth, entry) = (region.finally_depth as usize, region.handler_entry);

        let parent = self.truncate(context, depth);
        if self.depth(parent) != depth {
            return Err(LoweringError::UnresolvedExit {
                block: entry,
                edge: format!("{edge} (not inside {depth} finally bodies)"),
            });
        }

        let resume = ExitEdge {
            tag: edge.tag,
            target: edge.target,
            crosses: rest.to_vec(),
        };
        let copy = self.instantiate(first, resume, parent)?;
        self.copies[copy.0 as usize]
            .map
            .get(&entry)
            .copied()
            .ok_or(LoweringError::MissingBlock(entry))
    }

    fn depth(&self, context: Option<CopyId>) -> usize {
        context.map_or(0, |c| self.copies[c.0 as usize].in_flight.len())
    }

    /// Innermost enclosing context at most `depth` finally bodies deep
    fn truncate(&self, mut context: Option<CopyId>, depth: usize) -> Option<CopyId> {
        while let Some(copy) = context {
            if self.depth(Some(copy)) <= depth {
                break;
            }
            context = self.copies[copy.0 as usize].parent;
        }
        context
    }

    /// Map a source or template block to the block that runs in `context`
    fn resolve(&self, context: Option<CopyId>, block: BlockId) -> LoweringResult<BlockId> {
        let Some(region) = self.graph.block(block)?.template else {
            return Ok(block);
        };
        let mut cursor = context;
        while let Some(copy) = cursor {
            let copy = &self.copies[copy.0 as usize];
            if copy.region == region {
                return copy.map.get(&block).copied().ok_or(LoweringError::MissingBlock(block));
            }
            cursor = copy.parent;
        }
        Err(LoweringError::UnresolvedExit {
            block,
            edge: format!("target outside any copy of {region}"),
        })
    }

    /// Final hop of an edge that crosses no more finally regions
    fn deliver(&mut self, context: Option<CopyId>, tag: ExitTag, target: ExitTarget) -> LoweringResult<BlockId> {
        let target = match target {
            ExitTarget::Block(block) => return self.resolve(context, block),
            ExitTarget::Catch { entry, binding } => ExitTarget::Catch {
                entry: self.resolve(context, entry)?,
                binding,
            },
            other => other,
        };
        if let Some(&block) = self.deliveries.get(&(tag, target)) {
            return Ok(block);
        }

        let (instrs, terminator, active, in_flight) = match (tag, target) {
            (ExitTag::Throw(exc), ExitTarget::Catch { entry, binding }) => {
                let entry_block = self.graph.block(entry)?;
                (
                    vec![Instr::TakeException { dst: binding, exc }],
                    Terminator::Jump(entry),
                    entry_block.active.clone(),
                    entry_block.in_flight.clone(),
                )
            }
            (ExitTag::Return(slot), ExitTarget::FunctionExit) => (
                vec![Instr::Move {
                    dst: self.return_slot,
                    src: Operand::Slot(slot),
                }],
                Terminator::Jump(self.graph.exit),
                Vec::new(),
                Vec::new(),
            ),
            (ExitTag::Throw(exc), ExitTarget::Unwind) => {
                (Vec::new(), Terminator::Unwind(exc), Vec::new(), Vec::new())
            }
            _ => {
                return Err(LoweringError::UnresolvedExit {
                    block: self.graph.exit,
                    edge: format!("{tag} cannot reach {target}"),
                });
            }
        };

        self.check_limit()?;
        let block = self.graph.add_block(None, active, in_flight);
        let delivery = self.graph.block_mut(block)?;
        delivery.instrs = instrs;
        delivery.terminator = terminator;
        delivery.origin = BlockOrigin::Delivery;
        self.deliveries.insert((tag, target), block);
        trace!(%block, %tag, %target, "delivery block");
        Ok(block)
    }

    /// Copy of `region`'s finally body that resumes `resume` afterwards
    fn instantiate(&mut self, region: RegionId, resume: ExitEdge, parent: Option<CopyId>) -> LoweringResult<CopyId> {
        let key = (region, resume, parent);
        if let Some(&copy) = self.copy_index.get(&key) {
            return Ok(copy);
        }
        let (region, resume, parent) = key.clone();

        let template = self
            .templates
            .get(&region)
            .cloned()
            .ok_or(LoweringError::UnknownRegion(region))?;

        let mut in_flight = parent.map_or_else(Vec::new, |p| self.copies[p.0 as usize].in_flight.clone());
        in_flight.push(InFlight {
            region,
            resume: resume.clone(),
        });

        let id = CopyId(self.copies.len() as u32);
        let mut map = FxHashMap::default();
        for &source in &template {
            self.check_limit()?;
            let mut block = self.graph.block(source)?.clone();
            block.template = None;
            block.origin = BlockOrigin::FinallyCopy {
                region,
                template: source,
            };
            block.in_flight = in_flight.clone();
            let copied = self.graph.push_block(block);
            map.insert(source, copied);
            self.context.insert(copied, id);
        }

        for &copied in map.values() {
            let block = self.graph.block_mut(copied)?;
            if matches!(block.terminator, Terminator::EndFinally(r) if r == region) {
                block.terminator = Terminator::Exit(resume.clone());
            } else {
                block.terminator.remap(|b| map.get(&b).copied().unwrap_or(b));
            }
        }

        trace!(%region, copy = id.0, %resume, blocks = map.len(), "instantiated finally body");
        self.copies.push(FinallyCopy {
            region,
            parent,
            map,
            in_flight,
        });
        self.copy_index.insert(key, id);
        Ok(id)
    }

    fn check_limit(&self) -> LoweringResult<()> {
        if self.graph.len() >= self.initial_len + MAX_SYNTHESIZED_BLOCKS {
            return Err(LoweringError::TooManyBlocks {
                limit: MAX_SYNTHESIZED_BLOCKS,
            });
        }
        Ok(())
    }
}
