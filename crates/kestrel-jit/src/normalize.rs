//! Control-flow normalizer
//!
//! Lowers a [`StructuredFunction`] into a [`Graph`] in which every way of
//! leaving a statement abruptly is an explicit [`ExitEdge`]:
//!
//! - `break`/`continue` target the block bound to their label
//! - `return` targets the function exit, carrying a slot captured at the
//!   return site
//! - `throw` targets the innermost catch body, or unwinds
//! - a call gets a throw edge next to its normal successor
//!
//! Each edge lists the finally regions it leaves, innermost first. Finally
//! bodies are lowered once as templates ending in `EndFinally`; the
//! synthesizer instantiates them per edge.

use kestrel_ir::{
    Block, LabelId, LoopStmt, Op, Operand, RegionId, RegionKind, Slot, Stmt, StructuredFunction,
    TryStmt,
};
use tracing::trace;

use crate::error::{LoweringError, LoweringResult};
use crate::graph::{BlockId, ExcSlot, ExitEdge, ExitTag, ExitTarget, Graph, Instr, Terminator, ThrowEdge};
use crate::regions::{ProtectedRegion, RegionTable};
use crate::speculation::GuardPolicy;

/// Graph and metadata produced by normalization
#[derive(Debug, Clone)]
pub struct NormalizedFunction {
    /// Graph with unrouted exits and finally templates
    pub graph: Graph,
    /// Protected regions over source blocks
    pub regions: RegionTable,
    /// Frame slots including temporaries added by lowering
    pub slot_count: u32,
    /// Exception cells
    pub exception_count: u32,
    /// Slot read by the exit block
    pub return_slot: Slot,
}

/// Handler stack entry during lowering
#[derive(Debug, Clone, Copy)]
struct OpenRegion {
    id: RegionId,
    kind: RegionKind,
    catch: Option<(BlockId, Slot)>,
}

/// Blocks bound to a label while its statement is being lowered
#[derive(Debug, Clone, Copy)]
struct LabelTarget {
    break_block: BlockId,
    continue_block: Option<BlockId>,
    /// Handler stack height at the labeled statement
    active_len: usize,
}

/// Lowers one structured function
pub struct Normalizer<'f, G: GuardPolicy> {
    policy: &'f G,
    graph: Graph,
    current: BlockId,
    open: Vec<OpenRegion>,
    finally_bodies: Vec<RegionId>,
    labels: Vec<Option<LabelTarget>>,
    regions: Vec<Option<ProtectedRegion>>,
    next_slot: u32,
    exception_count: u32,
    return_slot: Slot,
}

impl<'f, G: GuardPolicy> Normalizer<'f, G> {
    /// Create a normalizer
    pub fn new(function: &'f StructuredFunction, policy: &'f G) -> Self {
        let graph = Graph::new();
        let current = graph.entry;
        Self {
            policy,
            graph,
            current,
            open: Vec::new(),
            finally_bodies: Vec::new(),
            labels: vec![None; function.label_count as usize],
            regions: vec![None; function.region_count as usize],
            next_slot: function.slot_count as u32,
            exception_count: 0,
            return_slot: Slot(0),
        }
    }

    /// Lower `function` into a graph
    pub fn normalize(function: &'f StructuredFunction, policy: &'f G) -> LoweringResult<NormalizedFunction> {
        let mut normalizer = Self::new(function, policy);
        normalizer.return_slot = normalizer.new_slot()?;

        let exit = normalizer.graph.exit;
        normalizer.graph.block_mut(exit)?.terminator = Terminator::Return(normalizer.return_slot);

        normalizer.lower_block(&function.body)?;
        // Falling off the end returns undefined
        normalizer.lower_stmt(&Stmt::Return(Operand::undefined()))?;

        let regions = RegionTable::new(normalizer.regions)?;
        Ok(NormalizedFunction {
            graph: normalizer.graph,
            regions,
            slot_count: normalizer.next_slot,
            exception_count: normalizer.exception_count,
            return_slot: normalizer.return_slot,
        })
    }

    fn new_slot(&mut self) -> LoweringResult<Slot> {
        let index = u16::try_from(self.next_slot).map_err(|_| LoweringError::TooManySlots)?;
        self.next_slot += 1;
        Ok(Slot(index))
    }

    fn new_exception(&mut self) -> ExcSlot {
        let exc = ExcSlot(self.exception_count);
        self.exception_count += 1;
        exc
    }

    fn next_block_id(&self) -> BlockId {
        BlockId(self.graph.len() as u32)
    }

    fn new_block(&mut self) -> BlockId {
        let template = self.finally_bodies.last().copied();
        let active = self.open.iter().map(|r| r.id).collect();
        self.graph.add_block(template, active, Vec::new())
    }

    fn emit(&mut self, instr: Instr) -> LoweringResult<()> {
        self.graph.block_mut(self.current)?.instrs.push(instr);
        Ok(())
    }

    fn terminate(&mut self, terminator: Terminator) -> LoweringResult<()> {
        self.graph.block_mut(self.current)?.terminator = terminator;
        Ok(())
    }

    /// Finally regions on the handler stack above `height`, innermost first
    fn finally_crossed(&self, height: usize) -> Vec<RegionId> {
        self.open[height.min(self.open.len())..]
            .iter()
            .rev()
            .filter(|r| r.kind == RegionKind::Finally)
            .map(|r| r.id)
            .collect()
    }

    /// Edge taken by an exception raised at the current point
    fn throw_edge(&self, exc: ExcSlot) -> ExitEdge {
        let mut crosses = Vec::new();
        for region in self.open.iter().rev() {
            match (region.kind, region.catch) {
                (RegionKind::Catch, Some((entry, binding))) => {
                    return ExitEdge {
                        tag: ExitTag::Throw(exc),
                        target: ExitTarget::Catch { entry, binding },
                        crosses,
                    };
                }
                (RegionKind::Finally, _) => crosses.push(region.id),
                (RegionKind::Catch, None) => {}
            }
        }
        ExitEdge {
            tag: ExitTag::Throw(exc),
            target: ExitTarget::Unwind,
            crosses,
        }
    }

    fn label(&self, label: LabelId) -> LoweringResult<LabelTarget> {
        self.labels
            .get(label.index())
            .copied()
            .flatten()
            .ok_or(LoweringError::UnresolvedLabel(label))
    }

    fn bind_label(&mut self, label: LabelId, target: Option<LabelTarget>) -> LoweringResult<()> {
        let entry = self
            .labels
            .get_mut(label.index())
            .ok_or(LoweringError::UnresolvedLabel(label))?;
        *entry = target;
        Ok(())
    }

    /// Leave the current block abruptly and continue in a fresh unreachable block
    fn exit(&mut self, edge: ExitEdge) -> LoweringResult<()> {
        self.terminate(Terminator::Exit(edge))?;
        self.current = self.new_block();
        Ok(())
    }

    fn lower_block(&mut self, block: &Block) -> LoweringResult<()> {
        for stmt in &block.stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> LoweringResult<()> {
        match stmt {
            Stmt::Op(op) => self.lower_op(op),

            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                let then_entry = self.new_block();
                let else_entry = if else_block.is_empty() {
                    None
                } else {
                    Some(self.new_block())
                };
                let join = self.new_block();
                self.terminate(Terminator::Branch {
                    cond: cond.clone(),
                    then_block: then_entry,
                    else_block: else_entry.unwrap_or(join),
                })?;

                self.current = then_entry;
                self.lower_block(then_block)?;
                self.terminate(Terminator::Jump(join))?;

                if let Some(else_entry) = else_entry {
                    self.current = else_entry;
                    self.lower_block(else_block)?;
                    self.terminate(Terminator::Jump(join))?;
                }

                self.current = join;
                Ok(())
            }

            Stmt::Loop(lp) => self.lower_loop(lp),

            Stmt::Labeled { label, body } => {
                let exit = self.new_block();
                self.bind_label(
                    *label,
                    Some(LabelTarget {
                        break_block: exit,
                        continue_block: None,
                        active_len: self.open.len(),
                    }),
                )?;
                self.lower_block(body)?;
                self.terminate(Terminator::Jump(exit))?;
                self.bind_label(*label, None)?;
                self.current = exit;
                Ok(())
            }

            Stmt::Try(try_stmt) => self.lower_try(try_stmt),

            Stmt::Break(label) => {
                let target = self.label(*label)?;
                self.exit(ExitEdge {
                    tag: ExitTag::Break(*label),
                    target: ExitTarget::Block(target.break_block),
                    crosses: self.finally_crossed(target.active_len),
                })
            }

            Stmt::Continue(label) => {
                let target = self.label(*label)?;
                let block = target
                    .continue_block
                    .ok_or(LoweringError::ContinueToNonLoop(*label))?;
                self.exit(ExitEdge {
                    tag: ExitTag::Continue(*label),
                    target: ExitTarget::Block(block),
                    crosses: self.finally_crossed(target.active_len),
                })
            }

            Stmt::Return(value) => {
                // The value is fixed here, before any finally body runs
                let captured = self.new_slot()?;
                self.emit(Instr::Move {
                    dst: captured,
                    src: value.clone(),
                })?;
                self.exit(ExitEdge {
                    tag: ExitTag::Return(captured),
                    target: ExitTarget::FunctionExit,
                    crosses: self.finally_crossed(0),
                })
            }

            Stmt::Throw { value, position } => {
                let exc = self.new_exception();
                self.emit(Instr::Raise {
                    exc,
                    value: value.clone(),
                    position: *position,
                })?;
                let edge = self.throw_edge(exc);
                self.exit(edge)
            }
        }
    }

    fn lower_op(&mut self, op: &Op) -> LoweringResult<()> {
        match op {
            Op::Move { dst, src } => self.emit(Instr::Move {
                dst: *dst,
                src: src.clone(),
            }),
            Op::Unary { dst, op, src } => self.emit(Instr::Unary {
                dst: *dst,
                op: *op,
                src: src.clone(),
            }),
            Op::Binary {
                dst,
                op,
                lhs,
                rhs,
                site,
            } => {
                let guard = self.policy.guard(*op, lhs, rhs);
                self.emit(Instr::Binary {
                    dst: *dst,
                    op: *op,
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                    guard,
                    site: *site,
                })
            }
            Op::Deoptimize { site } => self.emit(Instr::Deoptimize { site: *site }),
            Op::Call {
                dst,
                callee,
                args,
                position,
            } => {
                let exception = self.new_exception();
                let normal = self.new_block();
                let on_throw = ThrowEdge::Pending(self.throw_edge(exception));
                self.terminate(Terminator::Call {
                    dst: *dst,
                    callee: callee.clone(),
                    args: args.clone(),
                    position: *position,
                    exception,
                    normal,
                    on_throw,
                })?;
                self.current = normal;
                Ok(())
            }
        }
    }

    fn lower_loop(&mut self, lp: &LoopStmt) -> LoweringResult<()> {
        let exit = self.new_block();
        let update = self.new_block();
        let head = self.new_block();
        self.bind_label(
            lp.label,
            Some(LabelTarget {
                break_block: exit,
                continue_block: Some(update),
                active_len: self.open.len(),
            }),
        )?;

        self.terminate(Terminator::Jump(head))?;
        self.current = head;
        self.lower_block(&lp.test)?;
        if let Some(cond) = &lp.cond {
            let body = self.new_block();
            self.terminate(Terminator::Branch {
                cond: cond.clone(),
                then_block: body,
                else_block: exit,
            })?;
            self.current = body;
        }
        self.lower_block(&lp.body)?;
        self.terminate(Terminator::Jump(update))?;

        self.current = update;
        self.lower_block(&lp.update)?;
        self.terminate(Terminator::Jump(head))?;

        self.bind_label(lp.label, None)?;
        self.current = exit;
        Ok(())
    }

    /// Fallthrough out of a `try` block or catch body
    fn leave_try(&mut self, after: BlockId, finally: Option<RegionId>) -> LoweringResult<()> {
        match finally {
            Some(region) => self.terminate(Terminator::Exit(ExitEdge {
                tag: ExitTag::Normal,
                target: ExitTarget::Block(after),
                crosses: vec![region],
            })),
            None => self.terminate(Terminator::Jump(after)),
        }
    }

    fn open_region(&mut self, id: RegionId, kind: RegionKind, catch: Option<(BlockId, Slot)>) {
        self.open.push(OpenRegion { id, kind, catch });
    }

    fn record_region(
        &mut self,
        id: RegionId,
        kind: RegionKind,
        start: BlockId,
        handler_entry: BlockId,
        binding: Option<Slot>,
    ) -> LoweringResult<()> {
        // The region is still on top of the handler stack
        let handler_depth = self.open.len().saturating_sub(1);
        let parent = handler_depth
            .checked_sub(1)
            .and_then(|i| self.open.get(i))
            .map(|r| r.id);
        let region = ProtectedRegion {
            id,
            kind,
            start,
            end: self.next_block_id(),
            handler_entry,
            binding,
            parent,
            handler_depth: handler_depth as u32,
            finally_depth: self.finally_bodies.len() as u32,
        };
        let slot = self
            .regions
            .get_mut(id.index())
            .ok_or(LoweringError::UnknownRegion(id))?;
        if slot.is_some() {
            return Err(LoweringError::UnknownRegion(id));
        }
        trace!(region = %id, kind = ?kind, start = %region.start, end = %region.end, "recorded protected region");
        *slot = Some(region);
        self.open.pop();
        Ok(())
    }

    fn lower_try(&mut self, try_stmt: &TryStmt) -> LoweringResult<()> {
        let after = self.new_block();
        let finally = try_stmt.finalizer.as_ref().map(|f| f.region);

        let finally_start = self.next_block_id();
        if let Some(region) = finally {
            self.open_region(region, RegionKind::Finally, None);
        }

        let catch_entry = match &try_stmt.handler {
            Some(handler) => {
                let entry = self.new_block();
                self.open_region(handler.region, RegionKind::Catch, Some((entry, handler.binding)));
                Some(entry)
            }
            None => None,
        };

        let try_entry = self.new_block();
        self.terminate(Terminator::Jump(try_entry))?;
        self.current = try_entry;
        self.lower_block(&try_stmt.block)?;
        self.leave_try(after, finally)?;

        if let (Some(handler), Some(entry)) = (&try_stmt.handler, catch_entry) {
            self.record_region(handler.region, RegionKind::Catch, try_entry, entry, Some(handler.binding))?;
            self.current = entry;
            self.lower_block(&handler.body)?;
            self.leave_try(after, finally)?;
        }

        if let Some(finalizer) = &try_stmt.finalizer {
            // Template blocks are allocated right after the covered range
            let template_entry = self.next_block_id();
            self.record_region(finalizer.region, RegionKind::Finally, finally_start, template_entry, None)?;

            self.finally_bodies.push(finalizer.region);
            self.current = self.new_block();
            self.lower_block(&finalizer.body)?;
            self.terminate(Terminator::EndFinally(finalizer.region))?;
            self.finally_bodies.pop();
        }

        self.current = after;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speculation::{DisabledPlan, SpeculationPlan};
    use kestrel_compiler::Compiler;

    fn normalize(source: &str) -> NormalizedFunction {
        let function = Compiler::new(source).compile_function().unwrap();
        let plan = SpeculationPlan::analyze(&function);
        Normalizer::normalize(&function, &plan).unwrap()
    }

    fn exits(normalized: &NormalizedFunction) -> Vec<ExitEdge> {
        normalized
            .graph
            .blocks
            .iter()
            .filter_map(|b| match &b.terminator {
                Terminator::Exit(edge) => Some(edge.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_throw_targets_innermost_catch() {
        let n = normalize("(function(a) { try { throw a; } catch (e) { return e; } })");
        let throw = exits(&n)
            .into_iter()
            .find(|e| matches!(e.tag, ExitTag::Throw(_)))
            .unwrap();
        assert!(matches!(throw.target, ExitTarget::Catch { .. }));
        assert!(throw.crosses.is_empty());
    }

    #[test]
    fn test_uncaught_throw_unwinds_through_finally() {
        let n = normalize("(function(a) { try { throw a; } finally { a = 1; } })");
        let throw = exits(&n)
            .into_iter()
            .find(|e| matches!(e.tag, ExitTag::Throw(_)))
            .unwrap();
        assert_eq!(throw.target, ExitTarget::Unwind);
        assert_eq!(throw.crosses, vec![RegionId(0)]);
    }

    #[test]
    fn test_throw_in_catch_crosses_finally() {
        let n = normalize("(function(a) { try { throw a; } catch (e) { throw e; } finally { a = 1; } })");
        let crosses: Vec<_> = exits(&n)
            .into_iter()
            .filter(|e| matches!(e.tag, ExitTag::Throw(_)))
            .map(|e| (e.target, e.crosses))
            .collect();
        assert_eq!(crosses.len(), 2);
        // from the try block: caught, no finally crossed yet
        assert!(crosses
            .iter()
            .any(|(target, via)| matches!(target, ExitTarget::Catch { .. }) && via.is_empty()));
        // from the catch body: through the finally, then out
        assert!(crosses
            .iter()
            .any(|(target, via)| *target == ExitTarget::Unwind && via.len() == 1));
    }

    #[test]
    fn test_return_crosses_all_finally_regions() {
        let n = normalize(
            "(function() { try { try { return 1; } finally { } } finally { } })",
        );
        let ret = exits(&n)
            .into_iter()
            .find(|e| matches!(e.tag, ExitTag::Return(_)) && !e.crosses.is_empty())
            .unwrap();
        assert_eq!(ret.target, ExitTarget::FunctionExit);
        assert_eq!(ret.crosses.len(), 2);
        // innermost first
        let inner = n.regions.get(ret.crosses[0]).unwrap();
        let outer = n.regions.get(ret.crosses[1]).unwrap();
        assert!(inner.handler_depth > outer.handler_depth);
    }

    #[test]
    fn test_break_crosses_only_regions_inside_label() {
        let n = normalize(
            "(function() { try { L: { try { break L; } finally { } } } finally { } })",
        );
        let brk = exits(&n)
            .into_iter()
            .find(|e| matches!(e.tag, ExitTag::Break(_)))
            .unwrap();
        assert_eq!(brk.crosses.len(), 1);
    }

    #[test]
    fn test_call_gets_throw_edge() {
        let n = normalize("(function(f) { try { f(); } catch (e) { } })");
        let call = n
            .graph
            .blocks
            .iter()
            .find_map(|b| match &b.terminator {
                Terminator::Call { on_throw, .. } => Some(on_throw.clone()),
                _ => None,
            })
            .unwrap();
        let ThrowEdge::Pending(edge) = call else {
            panic!("throw edge already resolved");
        };
        assert!(matches!(edge.target, ExitTarget::Catch { .. }));
    }

    #[test]
    fn test_active_regions_mirror_table() {
        let n = normalize(
            "(function(a) { try { a = 1; try { a = 2; } catch (e) { a = 3; } } finally { a = 4; } return a; })",
        );
        for block in &n.graph.blocks {
            assert_eq!(block.active, n.regions.enclosing(block.id), "block {}", block.id);
        }
    }

    #[test]
    fn test_catch_region_nested_in_finally_region() {
        let n = normalize("(function(a) { try { a = 1; } catch (e) { a = 2; } finally { a = 3; } })");
        let catch = n.regions.iter().find(|r| r.kind == RegionKind::Catch).unwrap();
        let finally = n.regions.iter().find(|r| r.kind == RegionKind::Finally).unwrap();
        assert_eq!(catch.parent, Some(finally.id));
        assert!(finally.start < catch.start && catch.end <= finally.end);
        assert!(!finally.covers(finally.handler_entry));
    }

    #[test]
    fn test_finally_template_marked() {
        let n = normalize("(function(a) { try { a = 1; } finally { a = 2; } })");
        let templates: Vec<_> = n.graph.blocks.iter().filter(|b| b.template.is_some()).collect();
        assert!(!templates.is_empty());
        assert!(templates
            .iter()
            .any(|b| matches!(b.terminator, Terminator::EndFinally(_))));
    }

    #[test]
    fn test_speculation_disabled_leaves_ops_unguarded() {
        let function = Compiler::new("(function(a) { return a + 1; })").compile_function().unwrap();
        let n = Normalizer::normalize(&function, &DisabledPlan).unwrap();
        let guarded = n.graph.blocks.iter().flat_map(|b| &b.instrs).any(|i| {
            matches!(i, Instr::Binary { guard: Some(_), .. })
        });
        assert!(!guarded);
    }
}
