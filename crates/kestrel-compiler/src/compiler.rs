//! Main compiler implementation

use std::sync::Arc;

use kestrel_ir::{self as ir, BinaryOp, Constant, LabelId, LineIndex, Operand, Slot, UnaryOp};
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::{SourceType, Span};
use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::scope::{ScopeChain, SlotAllocator};

/// The compiler
///
/// Holds one source text. [`Compiler::compile_function`] expects the source
/// to be a single function expression (the harness form
/// `(function f(a, b) { ... })` or `(a, b) => { ... }`);
/// [`Compiler::compile_declarations`] accepts a list of function
/// declarations.
pub struct Compiler<'s> {
    source: &'s str,
    lines: LineIndex,
}

impl<'s> Compiler<'s> {
    /// Create a compiler for `source`
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            lines: LineIndex::new(source),
        }
    }

    /// Line index used for source positions
    pub fn line_index(&self) -> &LineIndex {
        &self.lines
    }

    /// Compile a source holding exactly one function expression
    pub fn compile_function(&self) -> CompileResult<ir::StructuredFunction> {
        let allocator = Allocator::default();
        let program = parse(&allocator, self.source)?;

        let [Statement::ExpressionStatement(expr_stmt)] = program.body.as_slice() else {
            return Err(CompileError::Expected("a single function expression"));
        };

        let mut expr = &expr_stmt.expression;
        while let Expression::ParenthesizedExpression(paren) = expr {
            expr = &paren.expression;
        }

        match expr {
            Expression::FunctionExpression(func) => self.lower_function(func),
            Expression::ArrowFunctionExpression(arrow) => self.lower_arrow(arrow),
            _ => Err(CompileError::Expected("a function expression")),
        }
    }

    /// Compile every top-level function declaration in the source
    pub fn compile_declarations(&self) -> CompileResult<Vec<ir::StructuredFunction>> {
        let allocator = Allocator::default();
        let program = parse(&allocator, self.source)?;

        let mut functions = Vec::new();
        for stmt in &program.body {
            match stmt {
                Statement::FunctionDeclaration(func) => functions.push(self.lower_function(func)?),
                Statement::EmptyStatement(_) => {}
                _ => return Err(CompileError::Expected("function declarations only")),
            }
        }
        Ok(functions)
    }

    fn lower_function(&self, func: &Function<'_>) -> CompileResult<ir::StructuredFunction> {
        if func.r#async || func.generator {
            return Err(CompileError::unsupported("async and generator functions"));
        }
        let name = func.id.as_ref().map(|id| Arc::from(id.name.as_str()));
        let mut lowering = FunctionLowering::new(&self.lines, name);
        lowering.declare_params(&func.params)?;

        let mut body = ir::Block::new();
        if let Some(func_body) = &func.body {
            lowering.lower_statements(&func_body.statements, &mut body)?;
        }
        Ok(lowering.finish(body))
    }

    fn lower_arrow(&self, arrow: &ArrowFunctionExpression<'_>) -> CompileResult<ir::StructuredFunction> {
        if arrow.r#async {
            return Err(CompileError::unsupported("async arrow functions"));
        }
        let mut lowering = FunctionLowering::new(&self.lines, None);
        lowering.declare_params(&arrow.params)?;

        let mut body = ir::Block::new();
        if arrow.expression {
            // Expression body: `(x) => x + 1` is stored as a single expression statement
            if let Some(Statement::ExpressionStatement(expr_stmt)) = arrow.body.statements.first() {
                let value = lowering.lower_expression(&expr_stmt.expression, &mut body)?;
                body.push(ir::Stmt::Return(value));
            }
        } else {
            lowering.lower_statements(&arrow.body.statements, &mut body)?;
        }
        Ok(lowering.finish(body))
    }
}

fn parse<'a>(allocator: &'a Allocator, source: &'a str) -> CompileResult<Program<'a>> {
    let options = ParseOptions {
        allow_v8_intrinsics: true,
        ..ParseOptions::default()
    };
    let result = Parser::new(allocator, source, SourceType::default())
        .with_options(options)
        .parse();

    if let Some(error) = result.errors.first() {
        return Err(CompileError::Parse(error.to_string()));
    }
    Ok(result.program)
}

/// A `break`/`continue` target visible at the current point
#[derive(Debug)]
struct LabelScope {
    names: Vec<String>,
    id: LabelId,
    is_loop: bool,
}

/// Per-function lowering state
struct FunctionLowering<'c> {
    lines: &'c LineIndex,
    name: Option<Arc<str>>,
    param_count: u16,
    scopes: ScopeChain,
    slots: SlotAllocator,
    labels: Vec<LabelScope>,
    /// Label names waiting for the loop they prefix (`L: while (...)`)
    pending_labels: Vec<String>,
    next_label: u32,
    next_region: u32,
    next_site: u32,
}

impl<'c> FunctionLowering<'c> {
    fn new(lines: &'c LineIndex, name: Option<Arc<str>>) -> Self {
        Self {
            lines,
            name,
            param_count: 0,
            scopes: ScopeChain::new(),
            slots: SlotAllocator::new(),
            labels: Vec::new(),
            pending_labels: Vec::new(),
            next_label: 0,
            next_region: 0,
            next_site: 0,
        }
    }

    fn finish(self, mut body: ir::Block) -> ir::StructuredFunction {
        // Falling off the end returns undefined
        if !body.stmts.last().is_some_and(ir::Stmt::is_abrupt) {
            body.push(ir::Stmt::Return(Operand::undefined()));
        }

        let function = ir::StructuredFunction {
            name: self.name,
            param_count: self.param_count,
            slot_count: self.slots.len(),
            slot_names: self.slots.into_names(),
            label_count: self.next_label,
            region_count: self.next_region,
            site_count: self.next_site,
            body,
        };
        debug!(
            function = function.display_name(),
            slots = function.slot_count,
            regions = function.region_count,
            sites = function.site_count,
            "lowered function to structured form"
        );
        function
    }

    fn declare_params(&mut self, params: &FormalParameters<'_>) -> CompileResult<()> {
        if params.rest.is_some() {
            return Err(CompileError::unsupported("Rest parameters"));
        }
        for param in &params.items {
            match &param.pattern {
                BindingPattern::BindingIdentifier(ident) => {
                    let slot = self.slots.named(&ident.name)?;
                    if self.scopes.declare(&ident.name, slot, false).is_none() {
                        return Err(self.syntax_error("Duplicate parameter name", ident.span));
                    }
                    self.param_count += 1;
                }
                _ => return Err(CompileError::unsupported("Complex parameter patterns")),
            }
        }
        Ok(())
    }

    fn syntax_error(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::syntax(message, self.lines.position(span.start))
    }

    fn alloc_region(&mut self) -> ir::RegionId {
        let id = ir::RegionId(self.next_region);
        self.next_region += 1;
        id
    }

    fn alloc_site(&mut self) -> ir::SiteId {
        let id = ir::SiteId(self.next_site);
        self.next_site += 1;
        id
    }

    fn with_label<T>(
        &mut self,
        names: Vec<String>,
        is_loop: bool,
        f: impl FnOnce(&mut Self, LabelId) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        self.labels.push(LabelScope { names, id, is_loop });
        let result = f(self, id);
        self.labels.pop();
        result
    }

    fn with_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> CompileResult<T>) -> CompileResult<T> {
        self.scopes.enter();
        let result = f(self);
        self.scopes.exit();
        result
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn lower_statements(
        &mut self,
        stmts: &[Statement<'_>],
        out: &mut ir::Block,
    ) -> CompileResult<()> {
        for stmt in stmts {
            self.lower_statement(stmt, out)?;
        }
        Ok(())
    }

    fn lower_statement(&mut self, stmt: &Statement<'_>, out: &mut ir::Block) -> CompileResult<()> {
        match stmt {
            Statement::ExpressionStatement(expr_stmt) => {
                self.lower_expression(&expr_stmt.expression, out)?;
                Ok(())
            }

            Statement::VariableDeclaration(decl) => self.lower_variable_declaration(decl, out),

            Statement::ReturnStatement(ret) => {
                let value = match &ret.argument {
                    Some(arg) => self.lower_expression(arg, out)?,
                    None => Operand::undefined(),
                };
                out.push(ir::Stmt::Return(value));
                Ok(())
            }

            Statement::BlockStatement(block) => {
                self.with_scope(|this| this.lower_statements(&block.body, out))
            }

            Statement::IfStatement(if_stmt) => self.lower_if(if_stmt, out),

            Statement::WhileStatement(while_stmt) => self.lower_while(while_stmt, out),

            Statement::DoWhileStatement(do_while) => self.lower_do_while(do_while, out),

            Statement::ForStatement(for_stmt) => self.lower_for(for_stmt, out),

            Statement::LabeledStatement(labeled) => self.lower_labeled(labeled, out),

            Statement::BreakStatement(brk) => {
                let name = brk.label.as_ref().map(|label| label.name.as_str());
                let label = self.resolve_break(name, brk.span)?;
                out.push(ir::Stmt::Break(label));
                Ok(())
            }

            Statement::ContinueStatement(cont) => {
                let name = cont.label.as_ref().map(|label| label.name.as_str());
                let label = self.resolve_continue(name, cont.span)?;
                out.push(ir::Stmt::Continue(label));
                Ok(())
            }

            Statement::ThrowStatement(throw_stmt) => {
                let value = self.lower_expression(&throw_stmt.argument, out)?;
                out.push(ir::Stmt::Throw {
                    value,
                    position: self.lines.position(throw_stmt.span.start),
                });
                Ok(())
            }

            Statement::TryStatement(try_stmt) => self.lower_try(try_stmt, out),

            Statement::EmptyStatement(_) => Ok(()),

            Statement::FunctionDeclaration(_) => {
                Err(CompileError::unsupported("Nested function declarations"))
            }

            _ => Err(CompileError::unsupported("Unknown statement type")),
        }
    }

    fn lower_variable_declaration(
        &mut self,
        decl: &VariableDeclaration<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<()> {
        let is_var = decl.kind == VariableDeclarationKind::Var;
        let is_const = decl.kind == VariableDeclarationKind::Const;

        for declarator in &decl.declarations {
            let BindingPattern::BindingIdentifier(ident) = &declarator.id else {
                return Err(CompileError::unsupported("Destructuring patterns"));
            };

            let slot = if is_var {
                match self.scopes.function_binding(&ident.name) {
                    Some(existing) => existing,
                    None => {
                        let slot = self.slots.named(&ident.name)?;
                        self.scopes.declare_var(&ident.name, slot)
                    }
                }
            } else {
                let slot = self.slots.named(&ident.name)?;
                self.scopes
                    .declare(&ident.name, slot, is_const)
                    .ok_or_else(|| {
                        self.syntax_error(
                            format!("Identifier '{}' has already been declared", ident.name),
                            ident.span,
                        )
                    })?
            };

            match &declarator.init {
                Some(init) => {
                    let value = self.lower_expression(init, out)?;
                    emit_move(slot, value, out);
                }
                None if !is_var => emit_move(slot, Operand::undefined(), out),
                None => {}
            }
        }

        Ok(())
    }

    fn lower_if(&mut self, if_stmt: &IfStatement<'_>, out: &mut ir::Block) -> CompileResult<()> {
        let cond = self.lower_expression(&if_stmt.test, out)?;

        let mut then_block = ir::Block::new();
        self.with_scope(|this| this.lower_statement(&if_stmt.consequent, &mut then_block))?;

        let mut else_block = ir::Block::new();
        if let Some(alternate) = &if_stmt.alternate {
            self.with_scope(|this| this.lower_statement(alternate, &mut else_block))?;
        }

        out.push(ir::Stmt::If {
            cond,
            then_block,
            else_block,
        });
        Ok(())
    }

    fn lower_while(
        &mut self,
        while_stmt: &WhileStatement<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<()> {
        let names = std::mem::take(&mut self.pending_labels);
        let stmt = self.with_label(names, true, |this, label| {
            let mut test = ir::Block::new();
            let cond = this.lower_expression(&while_stmt.test, &mut test)?;

            let mut body = ir::Block::new();
            this.with_scope(|this| this.lower_statement(&while_stmt.body, &mut body))?;

            Ok(ir::Stmt::Loop(ir::LoopStmt {
                label,
                test,
                cond: Some(cond),
                body,
                update: ir::Block::new(),
            }))
        })?;
        out.push(stmt);
        Ok(())
    }

    fn lower_do_while(
        &mut self,
        do_while: &DoWhileStatement<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<()> {
        let names = std::mem::take(&mut self.pending_labels);
        let stmt = self.with_label(names, true, |this, label| {
            let mut body = ir::Block::new();
            this.with_scope(|this| this.lower_statement(&do_while.body, &mut body))?;

            // The test runs where `continue` lands, so it lives in the update part
            let mut update = ir::Block::new();
            let cond = this.lower_expression(&do_while.test, &mut update)?;
            update.push(ir::Stmt::If {
                cond,
                then_block: ir::Block::new(),
                else_block: ir::Block::from(vec![ir::Stmt::Break(label)]),
            });

            Ok(ir::Stmt::Loop(ir::LoopStmt {
                label,
                test: ir::Block::new(),
                cond: None,
                body,
                update,
            }))
        })?;
        out.push(stmt);
        Ok(())
    }

    fn lower_for(&mut self, for_stmt: &ForStatement<'_>, out: &mut ir::Block) -> CompileResult<()> {
        let names = std::mem::take(&mut self.pending_labels);
        self.with_scope(|this| {
            if let Some(init) = &for_stmt.init {
                match init {
                    ForStatementInit::VariableDeclaration(decl) => {
                        this.lower_variable_declaration(decl, out)?;
                    }
                    _ => {
                        if let Some(expr) = init.as_expression() {
                            this.lower_expression(expr, out)?;
                        }
                    }
                }
            }

            let stmt = this.with_label(names, true, |this, label| {
                let mut test = ir::Block::new();
                let cond = match &for_stmt.test {
                    Some(expr) => Some(this.lower_expression(expr, &mut test)?),
                    None => None,
                };

                let mut body = ir::Block::new();
                this.with_scope(|this| this.lower_statement(&for_stmt.body, &mut body))?;

                let mut update = ir::Block::new();
                if let Some(expr) = &for_stmt.update {
                    this.lower_expression(expr, &mut update)?;
                }

                Ok(ir::Stmt::Loop(ir::LoopStmt {
                    label,
                    test,
                    cond,
                    body,
                    update,
                }))
            })?;
            out.push(stmt);
            Ok(())
        })
    }

    fn lower_labeled(
        &mut self,
        labeled: &LabeledStatement<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<()> {
        self.pending_labels.push(labeled.label.name.to_string());

        match &labeled.body {
            Statement::WhileStatement(_)
            | Statement::DoWhileStatement(_)
            | Statement::ForStatement(_)
            | Statement::LabeledStatement(_) => self.lower_statement(&labeled.body, out),
            body => {
                let names = std::mem::take(&mut self.pending_labels);
                let stmt = self.with_label(names, false, |this, label| {
                    let mut inner = ir::Block::new();
                    this.lower_statement(body, &mut inner)?;
                    Ok(ir::Stmt::Labeled { label, body: inner })
                })?;
                out.push(stmt);
                Ok(())
            }
        }
    }

    fn resolve_break(&self, name: Option<&str>, span: Span) -> CompileResult<LabelId> {
        let found = match name {
            Some(name) => self
                .labels
                .iter()
                .rev()
                .find(|scope| scope.names.iter().any(|n| n == name)),
            None => self.labels.iter().rev().find(|scope| scope.is_loop),
        };
        found.map(|scope| scope.id).ok_or_else(|| match name {
            Some(name) => self.syntax_error(format!("Undefined label '{name}'"), span),
            None => self.syntax_error("Illegal break statement", span),
        })
    }

    fn resolve_continue(&self, name: Option<&str>, span: Span) -> CompileResult<LabelId> {
        let found = match name {
            Some(name) => self
                .labels
                .iter()
                .rev()
                .find(|scope| scope.names.iter().any(|n| n == name)),
            None => self.labels.iter().rev().find(|scope| scope.is_loop),
        };
        match found {
            Some(scope) if scope.is_loop => Ok(scope.id),
            Some(_) => Err(self.syntax_error(
                format!(
                    "Illegal continue statement: '{}' does not denote an iteration statement",
                    name.unwrap_or_default()
                ),
                span,
            )),
            None => Err(self.syntax_error("Illegal continue statement", span)),
        }
    }

    fn lower_try(&mut self, try_stmt: &TryStatement<'_>, out: &mut ir::Block) -> CompileResult<()> {
        let mut block = ir::Block::new();
        self.with_scope(|this| this.lower_statements(&try_stmt.block.body, &mut block))?;

        let handler = match &try_stmt.handler {
            Some(clause) => Some(self.lower_catch_clause(clause)?),
            None => None,
        };

        let finalizer = match &try_stmt.finalizer {
            Some(finalizer) => {
                let region = self.alloc_region();
                let mut body = ir::Block::new();
                self.with_scope(|this| this.lower_statements(&finalizer.body, &mut body))?;
                Some(ir::FinallyClause { region, body })
            }
            None => None,
        };

        out.push(ir::Stmt::Try(ir::TryStmt {
            block,
            handler,
            finalizer,
        }));
        Ok(())
    }

    fn lower_catch_clause(&mut self, clause: &CatchClause<'_>) -> CompileResult<ir::CatchClause> {
        let region = self.alloc_region();
        self.with_scope(|this| {
            let binding = match &clause.param {
                Some(param) => match &param.pattern {
                    BindingPattern::BindingIdentifier(ident) => {
                        let slot = this.slots.named(&ident.name)?;
                        this.scopes.declare(&ident.name, slot, false);
                        slot
                    }
                    _ => return Err(CompileError::unsupported("Destructuring catch parameter")),
                },
                None => this.slots.temp()?,
            };

            let mut body = ir::Block::new();
            this.lower_statements(&clause.body.body, &mut body)?;
            Ok(ir::CatchClause {
                region,
                binding,
                body,
            })
        })
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn lower_expression(
        &mut self,
        expr: &Expression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        match expr {
            Expression::NumericLiteral(lit) => Ok(Operand::Const(Constant::Number(lit.value))),

            Expression::StringLiteral(lit) => Ok(Operand::Const(Constant::string(&lit.value))),

            Expression::BooleanLiteral(lit) => Ok(Operand::Const(Constant::Boolean(lit.value))),

            Expression::NullLiteral(_) => Ok(Operand::Const(Constant::Null)),

            Expression::Identifier(ident) => self.lower_identifier(&ident.name),

            Expression::ParenthesizedExpression(paren) => {
                self.lower_expression(&paren.expression, out)
            }

            Expression::BinaryExpression(binary) => self.lower_binary(binary, out),

            Expression::LogicalExpression(logical) => self.lower_logical(logical, out),

            Expression::UnaryExpression(unary) => self.lower_unary(unary, out),

            Expression::AssignmentExpression(assign) => self.lower_assignment(assign, out),

            Expression::UpdateExpression(update) => self.lower_update(update, out),

            Expression::ConditionalExpression(cond) => self.lower_conditional(cond, out),

            Expression::SequenceExpression(seq) => {
                let mut last = Operand::undefined();
                for expr in &seq.expressions {
                    last = self.lower_expression(expr, out)?;
                }
                Ok(last)
            }

            Expression::CallExpression(call) => self.lower_call(call, out),

            Expression::V8IntrinsicExpression(intrinsic) => self.lower_intrinsic(intrinsic, out),

            Expression::FunctionExpression(_) | Expression::ArrowFunctionExpression(_) => {
                Err(CompileError::unsupported("Nested functions"))
            }

            _ => Err(CompileError::unsupported("Unknown expression type")),
        }
    }

    fn lower_identifier(&self, name: &str) -> CompileResult<Operand> {
        if let Some(binding) = self.scopes.resolve(name) {
            return Ok(Operand::Slot(binding.slot));
        }
        match name {
            "undefined" => Ok(Operand::Const(Constant::Undefined)),
            "NaN" => Ok(Operand::Const(Constant::Number(f64::NAN))),
            "Infinity" => Ok(Operand::Const(Constant::Number(f64::INFINITY))),
            _ => Err(CompileError::unsupported(format!("Global reference `{name}`"))),
        }
    }

    fn resolve_assignable(&self, name: &str, span: Span) -> CompileResult<Slot> {
        match self.scopes.resolve(name) {
            Some(binding) if binding.is_const => {
                Err(self.syntax_error("Assignment to constant variable.", span))
            }
            Some(binding) => Ok(binding.slot),
            None => Err(CompileError::unsupported(format!("Global assignment `{name}`"))),
        }
    }

    /// Keep the value read from a binding stable when code emitted after
    /// the read (from `mark` on) writes that binding.
    fn pin(&mut self, operand: Operand, mark: usize, out: &mut ir::Block) -> CompileResult<Operand> {
        match operand {
            Operand::Slot(slot)
                if !self.slots.is_temp(slot) && writes_slot(&out.stmts[mark..], slot) =>
            {
                let temp = self.slots.temp()?;
                out.stmts.insert(
                    mark,
                    ir::Stmt::Op(ir::Op::Move {
                        dst: temp,
                        src: Operand::Slot(slot),
                    }),
                );
                Ok(Operand::Slot(temp))
            }
            other => Ok(other),
        }
    }

    fn emit_binary(
        &mut self,
        dst: Slot,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
        out: &mut ir::Block,
    ) {
        let site = self.alloc_site();
        out.push(ir::Stmt::Op(ir::Op::Binary {
            dst,
            op,
            lhs,
            rhs,
            site,
        }));
    }

    fn lower_binary(
        &mut self,
        binary: &BinaryExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let op = match binary.operator {
            BinaryOperator::Addition => BinaryOp::Add,
            BinaryOperator::Subtraction => BinaryOp::Sub,
            BinaryOperator::Multiplication => BinaryOp::Mul,
            BinaryOperator::Division => BinaryOp::Div,
            BinaryOperator::Remainder => BinaryOp::Rem,
            BinaryOperator::LessThan => BinaryOp::Lt,
            BinaryOperator::LessEqualThan => BinaryOp::Le,
            BinaryOperator::GreaterThan => BinaryOp::Gt,
            BinaryOperator::GreaterEqualThan => BinaryOp::Ge,
            BinaryOperator::Equality => BinaryOp::Eq,
            BinaryOperator::Inequality => BinaryOp::Ne,
            BinaryOperator::StrictEquality => BinaryOp::StrictEq,
            BinaryOperator::StrictInequality => BinaryOp::StrictNe,
            other => {
                return Err(CompileError::unsupported(format!(
                    "Binary operator: {:?}",
                    other
                )));
            }
        };

        let lhs = self.lower_expression(&binary.left, out)?;
        let mark = out.len();
        let rhs = self.lower_expression(&binary.right, out)?;
        let lhs = self.pin(lhs, mark, out)?;

        let dst = self.slots.temp()?;
        self.emit_binary(dst, op, lhs, rhs, out);
        Ok(Operand::Slot(dst))
    }

    fn lower_logical(
        &mut self,
        logical: &LogicalExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let result = self.slots.temp()?;
        let left = self.lower_expression(&logical.left, out)?;
        emit_move(result, left, out);

        let mut rhs_block = ir::Block::new();
        let right = self.lower_expression(&logical.right, &mut rhs_block)?;
        emit_move(result, right, &mut rhs_block);

        let stmt = match logical.operator {
            LogicalOperator::And => ir::Stmt::If {
                cond: Operand::Slot(result),
                then_block: rhs_block,
                else_block: ir::Block::new(),
            },
            LogicalOperator::Or => ir::Stmt::If {
                cond: Operand::Slot(result),
                then_block: ir::Block::new(),
                else_block: rhs_block,
            },
            LogicalOperator::Coalesce => {
                let is_nullish = self.slots.temp()?;
                self.emit_binary(
                    is_nullish,
                    BinaryOp::Eq,
                    Operand::Slot(result),
                    Operand::Const(Constant::Null),
                    out,
                );
                ir::Stmt::If {
                    cond: Operand::Slot(is_nullish),
                    then_block: rhs_block,
                    else_block: ir::Block::new(),
                }
            }
        };
        out.push(stmt);
        Ok(Operand::Slot(result))
    }

    fn lower_unary(
        &mut self,
        unary: &UnaryExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let op = match unary.operator {
            UnaryOperator::UnaryNegation => UnaryOp::Neg,
            UnaryOperator::UnaryPlus => UnaryOp::Plus,
            UnaryOperator::LogicalNot => UnaryOp::Not,
            UnaryOperator::Typeof => UnaryOp::TypeOf,
            UnaryOperator::Void => UnaryOp::Void,
            other => {
                return Err(CompileError::unsupported(format!(
                    "Unary operator: {:?}",
                    other
                )));
            }
        };

        let src = self.lower_expression(&unary.argument, out)?;
        let dst = self.slots.temp()?;
        out.push(ir::Stmt::Op(ir::Op::Unary { dst, op, src }));
        Ok(Operand::Slot(dst))
    }

    fn lower_assignment(
        &mut self,
        assign: &AssignmentExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let AssignmentTarget::AssignmentTargetIdentifier(ident) = &assign.left else {
            return Err(CompileError::InvalidAssignmentTarget);
        };
        let slot = self.resolve_assignable(&ident.name, ident.span)?;

        let op = match assign.operator {
            AssignmentOperator::Assign => None,
            AssignmentOperator::Addition => Some(BinaryOp::Add),
            AssignmentOperator::Subtraction => Some(BinaryOp::Sub),
            AssignmentOperator::Multiplication => Some(BinaryOp::Mul),
            AssignmentOperator::Division => Some(BinaryOp::Div),
            AssignmentOperator::Remainder => Some(BinaryOp::Rem),
            other => {
                return Err(CompileError::unsupported(format!(
                    "Assignment operator: {:?}",
                    other
                )));
            }
        };

        let mark = out.len();
        let value = self.lower_expression(&assign.right, out)?;
        match op {
            None => emit_move(slot, value, out),
            Some(op) => {
                // `x op= e` reads `x` before evaluating `e`
                let current = self.pin(Operand::Slot(slot), mark, out)?;
                self.emit_binary(slot, op, current, value, out);
            }
        }
        Ok(Operand::Slot(slot))
    }

    fn lower_update(
        &mut self,
        update: &UpdateExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let SimpleAssignmentTarget::AssignmentTargetIdentifier(ident) = &update.argument else {
            return Err(CompileError::InvalidAssignmentTarget);
        };
        let slot = self.resolve_assignable(&ident.name, ident.span)?;
        let op = match update.operator {
            UpdateOperator::Increment => BinaryOp::Add,
            UpdateOperator::Decrement => BinaryOp::Sub,
        };

        let old = self.slots.temp()?;
        out.push(ir::Stmt::Op(ir::Op::Unary {
            dst: old,
            op: UnaryOp::Plus,
            src: Operand::Slot(slot),
        }));
        self.emit_binary(
            slot,
            op,
            Operand::Slot(old),
            Operand::Const(Constant::Number(1.0)),
            out,
        );

        Ok(if update.prefix {
            Operand::Slot(slot)
        } else {
            Operand::Slot(old)
        })
    }

    fn lower_conditional(
        &mut self,
        cond: &ConditionalExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        let result = self.slots.temp()?;
        let test = self.lower_expression(&cond.test, out)?;

        let mut then_block = ir::Block::new();
        let value = self.lower_expression(&cond.consequent, &mut then_block)?;
        emit_move(result, value, &mut then_block);

        let mut else_block = ir::Block::new();
        let value = self.lower_expression(&cond.alternate, &mut else_block)?;
        emit_move(result, value, &mut else_block);

        out.push(ir::Stmt::If {
            cond: test,
            then_block,
            else_block,
        });
        Ok(Operand::Slot(result))
    }

    fn lower_call(
        &mut self,
        call: &CallExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        if call
            .arguments
            .iter()
            .any(|arg| matches!(arg, Argument::SpreadElement(_)))
        {
            return Err(CompileError::unsupported("Spread arguments"));
        }

        let mut operands = Vec::with_capacity(call.arguments.len() + 1);
        let mut marks = Vec::with_capacity(call.arguments.len() + 1);

        operands.push(self.lower_expression(&call.callee, out)?);
        marks.push(out.len());
        for arg in &call.arguments {
            operands.push(self.lower_expression(arg.to_expression(), out)?);
            marks.push(out.len());
        }

        // Later marks first so earlier insertion points stay valid
        for i in (0..operands.len()).rev() {
            let operand = std::mem::replace(&mut operands[i], Operand::undefined());
            operands[i] = self.pin(operand, marks[i], out)?;
        }

        let mut operands = operands.into_iter();
        let callee = operands.next().unwrap_or_else(Operand::undefined);
        let args = operands.collect();

        let dst = self.slots.temp()?;
        out.push(ir::Stmt::Op(ir::Op::Call {
            dst,
            callee,
            args,
            position: self.lines.position(call.span.start),
        }));
        Ok(Operand::Slot(dst))
    }

    fn lower_intrinsic(
        &mut self,
        intrinsic: &V8IntrinsicExpression<'_>,
        out: &mut ir::Block,
    ) -> CompileResult<Operand> {
        // The argument only names the running function; it is never evaluated
        match intrinsic.name.name.as_str() {
            "DeoptimizeFunction" | "DeoptimizeNow" => {
                let site = self.alloc_site();
                out.push(ir::Stmt::Op(ir::Op::Deoptimize { site }));
                Ok(Operand::undefined())
            }
            other => Err(CompileError::unsupported(format!("Intrinsic %{other}"))),
        }
    }
}

fn emit_move(dst: Slot, src: Operand, out: &mut ir::Block) {
    if src.as_slot() == Some(dst) {
        return;
    }
    out.push(ir::Stmt::Op(ir::Op::Move { dst, src }));
}

/// Whether any statement in `stmts` (including nested blocks) writes `slot`
fn writes_slot(stmts: &[ir::Stmt], slot: Slot) -> bool {
    stmts.iter().any(|stmt| match stmt {
        ir::Stmt::Op(op) => op.dst() == Some(slot),
        ir::Stmt::If {
            then_block,
            else_block,
            ..
        } => writes_slot(&then_block.stmts, slot) || writes_slot(&else_block.stmts, slot),
        ir::Stmt::Loop(lp) => {
            writes_slot(&lp.test.stmts, slot)
                || writes_slot(&lp.body.stmts, slot)
                || writes_slot(&lp.update.stmts, slot)
        }
        ir::Stmt::Labeled { body, .. } => writes_slot(&body.stmts, slot),
        ir::Stmt::Try(try_stmt) => {
            writes_slot(&try_stmt.block.stmts, slot)
                || try_stmt
                    .handler
                    .as_ref()
                    .is_some_and(|h| writes_slot(&h.body.stmts, slot))
                || try_stmt
                    .finalizer
                    .as_ref()
                    .is_some_and(|f| writes_slot(&f.body.stmts, slot))
        }
        ir::Stmt::Break(_)
        | ir::Stmt::Continue(_)
        | ir::Stmt::Return(_)
        | ir::Stmt::Throw { .. } => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ir::{Op, Stmt};

    fn compile(source: &str) -> ir::StructuredFunction {
        Compiler::new(source).compile_function().unwrap()
    }

    fn find_try(block: &ir::Block) -> Option<&ir::TryStmt> {
        block.stmts.iter().find_map(|stmt| match stmt {
            Stmt::Try(t) => Some(t),
            Stmt::Labeled { body, .. } => find_try(body),
            _ => None,
        })
    }

    #[test]
    fn test_compile_parameters() {
        let func = compile("(function f(a, b) { return b; })");
        assert_eq!(func.param_count, 2);
        assert_eq!(func.name.as_deref(), Some("f"));
        assert!(matches!(
            func.body.stmts.last(),
            Some(Stmt::Return(Operand::Slot(Slot(1))))
        ));
    }

    #[test]
    fn test_compile_arrow() {
        let func = compile("(a,b)=>{ if(a) throw b; else return b; }");
        assert_eq!(func.param_count, 2);
        assert!(func.name.is_none());
        assert!(matches!(func.body.stmts[0], Stmt::If { .. }));
    }

    #[test]
    fn test_compile_arrow_expression_body() {
        let func = compile("(a) => a + 1");
        assert!(matches!(func.body.stmts.last(), Some(Stmt::Return(_))));
        assert_eq!(func.site_count, 1);
    }

    #[test]
    fn test_compile_throw_position() {
        let src = "(function(a, b) {        \n  if (a == 1) throw 1;   \n})";
        let func = compile(src);
        let Stmt::If { then_block, .. } = &func.body.stmts[1] else {
            panic!("expected if, got {:?}", func.body.stmts);
        };
        let Stmt::Throw { position, .. } = &then_block.stmts[0] else {
            panic!("expected throw");
        };
        assert_eq!(position.line, 2);
        assert_eq!(position.offset, 40);
    }

    #[test]
    fn test_compile_try_catch_finally_regions() {
        let func = compile(
            "(function() { try { throw 1; } catch (e) { return e; } finally { return 2; } })",
        );
        let try_stmt = find_try(&func.body).unwrap();
        let handler = try_stmt.handler.as_ref().unwrap();
        let finalizer = try_stmt.finalizer.as_ref().unwrap();
        assert_ne!(handler.region, finalizer.region);
        assert_eq!(func.region_count, 2);
    }

    #[test]
    fn test_compile_labeled_try() {
        let func = compile(
            "(function(a) { var r = '-'; L: try { if (a) break L; } catch (e) {} return r; })",
        );
        let Stmt::Labeled { label, body } = &func.body.stmts[1] else {
            panic!("expected labeled statement");
        };
        let try_stmt = find_try(body).unwrap();
        let Stmt::If { then_block, .. } = &try_stmt.block.stmts[0] else {
            panic!("expected if");
        };
        assert!(matches!(then_block.stmts[0], Stmt::Break(l) if l == *label));
    }

    #[test]
    fn test_unlabeled_break_targets_innermost_loop() {
        let func = compile("(function() { while (true) { for (;;) { break; } } })");
        let Stmt::Loop(outer) = &func.body.stmts[0] else {
            panic!("expected loop");
        };
        let Stmt::Loop(inner) = &outer.body.stmts[0] else {
            panic!("expected inner loop");
        };
        assert!(matches!(inner.body.stmts[0], Stmt::Break(l) if l == inner.label));
        assert_ne!(inner.label, outer.label);
    }

    #[test]
    fn test_labeled_continue_on_loop() {
        let func = compile("(function() { outer: while (true) { while (true) { continue outer; } } })");
        let Stmt::Loop(outer) = &func.body.stmts[0] else {
            panic!("expected loop");
        };
        let Stmt::Loop(inner) = &outer.body.stmts[0] else {
            panic!("expected inner loop");
        };
        assert!(matches!(inner.body.stmts[0], Stmt::Continue(l) if l == outer.label));
    }

    #[test]
    fn test_continue_to_block_label_rejected() {
        let err = Compiler::new("(function() { L: { while (true) { continue L; } } })")
            .compile_function()
            .unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. } | CompileError::Parse(_)));
    }

    #[test]
    fn test_deoptimize_intrinsic() {
        let func = compile("(function f(a) { %DeoptimizeFunction(f); return a; })");
        assert!(matches!(
            func.body.stmts[0],
            Stmt::Op(Op::Deoptimize { site }) if site == ir::SiteId(0)
        ));
    }

    #[test]
    fn test_compound_assignment_reads_target_first() {
        let func = compile("(function(r) { r += (r = 'x'); return r; })");
        // The original value of `r` is copied before the nested assignment runs
        assert!(matches!(
            func.body.stmts[0],
            Stmt::Op(Op::Move { src: Operand::Slot(Slot(0)), .. })
        ));
    }

    #[test]
    fn test_call_arguments_and_position() {
        let func = compile("(function(fun) { return fun(1, 'a'); })");
        let Stmt::Op(Op::Call { args, position, .. }) = &func.body.stmts[0] else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(position.offset, 24);
    }

    #[test]
    fn test_global_reference_unsupported() {
        let err = Compiler::new("(function() { return missing; })")
            .compile_function()
            .unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn test_compile_declarations() {
        let functions = Compiler::new(
            "function thrower() { throw 'T-'; } function returner() { return 'R-'; }",
        )
        .compile_declarations()
        .unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].display_name(), "thrower");
        assert_eq!(functions[1].display_name(), "returner");
    }

    #[test]
    fn test_parse_error() {
        let err = Compiler::new("(function( {").compile_function().unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
    }
}
