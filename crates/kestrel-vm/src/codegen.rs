//! Bytecode generation from the structured representation

use kestrel_ir::{
    Block, LabelId, LoopStmt, Op, Operand, RegionId, RegionKind, SiteId, Stmt, StructuredFunction,
    TryStmt,
};
use thiserror::Error;
use tracing::debug;

use crate::bytecode::{
    BytecodeFunction, ConstantPool, HandlerEntry, Input, Instruction, JumpOffset, LabelEntry,
};

/// Bytecode generation errors
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// A label id has no target
    #[error("Label {0} was never defined")]
    UnresolvedLabel(LabelId),

    /// A region id has no handler
    #[error("Region {0} was never defined")]
    UnresolvedRegion(RegionId),

    /// A bailout site has no instruction
    #[error("Bailout site {0} was never emitted")]
    MissingSite(SiteId),

    /// Function too large for 32-bit jump offsets
    #[error("Function too large")]
    TooLarge,
}

/// Generates baseline bytecode for one function
pub struct BytecodeGenerator<'f> {
    function: &'f StructuredFunction,
    instructions: Vec<Instruction>,
    constants: ConstantPool,
    handlers: Vec<Option<HandlerEntry>>,
    labels: Vec<Option<LabelEntry>>,
    sites: Vec<Option<u32>>,
    /// Handler frames active at the current point
    handler_depth: u32,
    /// Finally bodies executing around the current point
    finally_depth: u32,
}

impl<'f> BytecodeGenerator<'f> {
    /// Create a generator for `function`
    pub fn new(function: &'f StructuredFunction) -> Self {
        Self {
            function,
            instructions: Vec::new(),
            constants: ConstantPool::new(),
            handlers: vec![None; function.region_count as usize],
            labels: vec![None; function.label_count as usize],
            sites: vec![None; function.site_count as usize],
            handler_depth: 0,
            finally_depth: 0,
        }
    }

    /// Compile `function` to bytecode
    pub fn compile(function: &'f StructuredFunction) -> Result<BytecodeFunction, BytecodeError> {
        let mut generator = Self::new(function);
        generator.gen_block(&function.body)?;
        if !function.body.stmts.last().is_some_and(Stmt::is_abrupt) {
            let src = generator.input(&Operand::undefined());
            generator.emit(Instruction::Return { src });
        }
        generator.finish()
    }

    fn finish(self) -> Result<BytecodeFunction, BytecodeError> {
        if u32::try_from(self.instructions.len()).is_err() {
            return Err(BytecodeError::TooLarge);
        }

        let handlers = self
            .handlers
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.ok_or(BytecodeError::UnresolvedRegion(RegionId(i as u32))))
            .collect::<Result<Vec<_>, _>>()?;
        let labels = self
            .labels
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.ok_or(BytecodeError::UnresolvedLabel(LabelId(i as u32))))
            .collect::<Result<Vec<_>, _>>()?;
        let sites = self
            .sites
            .into_iter()
            .enumerate()
            .map(|(i, pc)| pc.ok_or(BytecodeError::MissingSite(SiteId(i as u32))))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            function = self.function.display_name(),
            instructions = self.instructions.len(),
            handlers = handlers.len(),
            "generated baseline bytecode"
        );

        Ok(BytecodeFunction {
            name: self.function.display_name().to_string(),
            param_count: self.function.param_count,
            slot_count: self.function.slot_count,
            instructions: self.instructions,
            constants: self.constants,
            handlers,
            labels,
            sites,
        })
    }

    fn current_index(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Emit a placeholder jump (returns index for patching)
    fn emit_jump(&mut self) -> u32 {
        let idx = self.current_index();
        self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        idx
    }

    /// Emit a conditional jump (returns index for patching)
    fn emit_jump_if_false(&mut self, cond: Input) -> u32 {
        let idx = self.current_index();
        self.emit(Instruction::JumpIfFalse {
            cond,
            offset: JumpOffset(0),
        });
        idx
    }

    fn patch_jump(&mut self, index: u32, target: u32) {
        let offset = JumpOffset(target as i32 - index as i32);
        match &mut self.instructions[index as usize] {
            Instruction::Jump { offset: o } | Instruction::JumpIfFalse { offset: o, .. } => {
                *o = offset
            }
            other => debug_assert!(false, "not a jump instruction: {other:?}"),
        }
    }

    fn input(&mut self, operand: &Operand) -> Input {
        match operand {
            Operand::Slot(slot) => Input::Slot(*slot),
            Operand::Const(constant) => Input::Const(self.constants.add(constant.clone())),
        }
    }

    fn mark_site(&mut self, site: SiteId) {
        if let Some(entry) = self.sites.get_mut(site.index()) {
            *entry = Some(self.instructions.len() as u32);
        }
    }

    fn gen_block(&mut self, block: &Block) -> Result<(), BytecodeError> {
        for stmt in &block.stmts {
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), BytecodeError> {
        match stmt {
            Stmt::Op(op) => self.gen_op(op),

            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.input(cond);
                let jump_else = self.emit_jump_if_false(cond);
                self.gen_block(then_block)?;
                if else_block.is_empty() {
                    let end = self.current_index();
                    self.patch_jump(jump_else, end);
                } else {
                    let jump_end = self.emit_jump();
                    let else_start = self.current_index();
                    self.patch_jump(jump_else, else_start);
                    self.gen_block(else_block)?;
                    let end = self.current_index();
                    self.patch_jump(jump_end, end);
                }
            }

            Stmt::Loop(lp) => self.gen_loop(lp)?,

            Stmt::Labeled { label, body } => {
                self.gen_block(body)?;
                let break_pc = self.current_index();
                self.define_label(*label, break_pc, None);
            }

            Stmt::Try(try_stmt) => self.gen_try(try_stmt)?,

            Stmt::Break(label) => self.emit(Instruction::Break { label: *label }),

            Stmt::Continue(label) => self.emit(Instruction::Continue { label: *label }),

            Stmt::Return(value) => {
                let src = self.input(value);
                self.emit(Instruction::Return { src });
            }

            Stmt::Throw { value, position } => {
                let src = self.input(value);
                self.emit(Instruction::Throw {
                    src,
                    position: *position,
                });
            }
        }
        Ok(())
    }

    fn gen_op(&mut self, op: &Op) {
        match op {
            Op::Move { dst, src } => {
                let src = self.input(src);
                self.emit(Instruction::Move { dst: *dst, src });
            }
            Op::Unary { dst, op, src } => {
                let src = self.input(src);
                self.emit(Instruction::Unary {
                    dst: *dst,
                    op: *op,
                    src,
                });
            }
            Op::Binary {
                dst,
                op,
                lhs,
                rhs,
                site,
            } => {
                let lhs = self.input(lhs);
                let rhs = self.input(rhs);
                self.mark_site(*site);
                self.emit(Instruction::Binary {
                    dst: *dst,
                    op: *op,
                    lhs,
                    rhs,
                });
            }
            Op::Call {
                dst,
                callee,
                args,
                position,
            } => {
                let callee = self.input(callee);
                let args = args.iter().map(|arg| self.input(arg)).collect();
                self.emit(Instruction::Call {
                    dst: *dst,
                    callee,
                    args,
                    position: *position,
                });
            }
            Op::Deoptimize { site } => {
                self.mark_site(*site);
                self.emit(Instruction::Deoptimize);
            }
        }
    }

    fn define_label(&mut self, label: LabelId, break_pc: u32, continue_pc: Option<u32>) {
        if let Some(entry) = self.labels.get_mut(label.index()) {
            *entry = Some(LabelEntry {
                label,
                break_pc,
                continue_pc,
                handler_depth: self.handler_depth,
                finally_depth: self.finally_depth,
            });
        }
    }

    fn gen_loop(&mut self, lp: &LoopStmt) -> Result<(), BytecodeError> {
        let loop_start = self.current_index();
        self.gen_block(&lp.test)?;
        let exit_jump = match &lp.cond {
            Some(cond) => {
                let cond = self.input(cond);
                Some(self.emit_jump_if_false(cond))
            }
            None => None,
        };

        self.gen_block(&lp.body)?;

        let continue_pc = self.current_index();
        self.gen_block(&lp.update)?;
        let back = self.emit_jump();
        self.patch_jump(back, loop_start);

        let loop_end = self.current_index();
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, loop_end);
        }
        self.define_label(lp.label, loop_end, Some(continue_pc));
        Ok(())
    }

    fn gen_try(&mut self, try_stmt: &TryStmt) -> Result<(), BytecodeError> {
        // try { } catch { } finally { } pushes the finally frame first so the
        // catch body still runs under it
        let finally_start = try_stmt.finalizer.as_ref().map(|finalizer| {
            self.emit(Instruction::EnterTry {
                region: finalizer.region,
            });
            self.handler_depth += 1;
            self.current_index()
        });

        let catch_start = try_stmt.handler.as_ref().map(|handler| {
            self.emit(Instruction::EnterTry {
                region: handler.region,
            });
            self.handler_depth += 1;
            self.current_index()
        });

        self.gen_block(&try_stmt.block)?;

        if let (Some(handler), Some(start)) = (&try_stmt.handler, catch_start) {
            let end = self.current_index();
            self.emit(Instruction::LeaveTry {
                region: handler.region,
            });
            self.handler_depth -= 1;
            let skip_catch = self.emit_jump();

            let handler_pc = self.current_index();
            self.handlers[handler.region.index()] = Some(HandlerEntry {
                region: handler.region,
                kind: RegionKind::Catch,
                start,
                end,
                handler_pc,
                handler_depth: self.handler_depth,
                finally_depth: self.finally_depth,
            });
            self.emit(Instruction::Catch {
                dst: handler.binding,
            });
            self.gen_block(&handler.body)?;

            let after = self.current_index();
            self.patch_jump(skip_catch, after);
        }

        if let (Some(finalizer), Some(start)) = (&try_stmt.finalizer, finally_start) {
            let end = self.current_index();
            self.emit(Instruction::LeaveTry {
                region: finalizer.region,
            });
            self.handler_depth -= 1;
            self.emit(Instruction::EnterFinally {
                region: finalizer.region,
            });

            let handler_pc = self.current_index();
            self.handlers[finalizer.region.index()] = Some(HandlerEntry {
                region: finalizer.region,
                kind: RegionKind::Finally,
                start,
                end,
                handler_pc,
                handler_depth: self.handler_depth,
                finally_depth: self.finally_depth,
            });

            self.finally_depth += 1;
            self.gen_block(&finalizer.body)?;
            self.finally_depth -= 1;
            self.emit(Instruction::EndFinally {
                region: finalizer.region,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_compiler::Compiler;

    fn compile(source: &str) -> BytecodeFunction {
        let function = Compiler::new(source).compile_function().unwrap();
        BytecodeGenerator::compile(&function).unwrap()
    }

    #[test]
    fn test_handler_table_nesting() {
        let bytecode = compile(
            "(function() { try { try { throw 1; } finally { } } catch (e) { return e; } })",
        );
        assert_eq!(bytecode.handlers.len(), 2);
        let inner = bytecode
            .handlers
            .iter()
            .find(|h| h.kind == RegionKind::Finally)
            .unwrap();
        let outer = bytecode
            .handlers
            .iter()
            .find(|h| h.kind == RegionKind::Catch)
            .unwrap();
        assert!(outer.start <= inner.start && inner.end <= outer.end);
        assert_eq!(outer.handler_depth, 0);
        assert_eq!(inner.handler_depth, 1);
    }

    #[test]
    fn test_catch_region_inside_finally_region() {
        let bytecode = compile(
            "(function() { try { throw 1; } catch (e) { } finally { } })",
        );
        let catch = bytecode.handler(RegionId(0)).unwrap();
        let finally = bytecode.handler(RegionId(1)).unwrap();
        assert_eq!(catch.kind, RegionKind::Catch);
        assert_eq!(finally.kind, RegionKind::Finally);
        assert!(finally.end > catch.end);
        assert_eq!(finally.handler_depth, 0);
        assert_eq!(catch.handler_depth, 1);
    }

    #[test]
    fn test_label_depths() {
        let bytecode = compile(
            "(function() { L: try { while (true) { break L; } } finally { } })",
        );
        // `L` is defined outside the try, the loop inside it
        let outer = bytecode.labels.iter().find(|l| l.continue_pc.is_none()).unwrap();
        let inner = bytecode.labels.iter().find(|l| l.continue_pc.is_some()).unwrap();
        assert_eq!(outer.handler_depth, 0);
        assert_eq!(inner.handler_depth, 1);
    }

    #[test]
    fn test_sites_recorded() {
        let bytecode = compile("(function f(a) { %DeoptimizeFunction(f); return a + 1; })");
        assert_eq!(bytecode.sites.len(), 2);
        assert_eq!(bytecode.instructions[bytecode.sites[0] as usize], Instruction::Deoptimize);
        assert!(matches!(
            bytecode.instructions[bytecode.sites[1] as usize],
            Instruction::Binary { .. }
        ));
    }

    #[test]
    fn test_jump_offsets_patched() {
        let bytecode = compile("(function(a) { if (a) { return 1; } else { return 2; } })");
        for (idx, instruction) in bytecode.instructions.iter().enumerate() {
            if let Instruction::Jump { offset } | Instruction::JumpIfFalse { offset, .. } = instruction {
                assert_ne!(offset.offset(), 0, "unpatched jump at {idx}");
                let target = idx as i32 + offset.offset();
                assert!(target >= 0 && (target as usize) <= bytecode.instructions.len());
            }
        }
    }
}
