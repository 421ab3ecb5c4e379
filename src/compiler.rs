//! # Compiler Module
//!
//! Lowers the analysed syntax tree to the flat tuple stream. The entire
//! program becomes one queue:
//!
//! ```text
//!   BEGIN bodies
//! main_loop:
//!   ConsumeInput eof=end_section
//!   rule patterns and actions
//!   Jump main_loop
//! end_section:
//!   END bodies
//!   Halt
//!   function bodies
//! ```
//!
//! Control flow uses the forward-reference pattern: jumps are emitted
//! against fresh symbolic addresses which are pinned to tuple slots as
//! lowering reaches them. `TupleList::post_process` then verifies that
//! no referenced address was left unresolved.

use crate::ast::*;
use crate::error::{AwkError, AwkResult, Span};
use crate::opcode::{
    special, AddressId, FunctionInfo, GetlineSource, Opcode, Redirect, StoreTarget, TupleList,
};
use crate::semantic::FunctionTable;
use crate::settings::Settings;
use crate::token::Builtin;

use rustc_hash::FxHashMap;

// -----------------------------------------------------------------------------
// COMPILER STATE
// -----------------------------------------------------------------------------

/// Which part of the program is being lowered; `next` and `return` are
/// only legal in some of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Begin,
    Main,
    End,
    Function,
}

/// Loop bookkeeping for `break`/`continue`. A for-in loop keeps its key
/// enumerator on the operand stack, so `break` must pop it first.
struct LoopCtx {
    break_addr: AddressId,
    continue_addr: AddressId,
    is_forin: bool,
}

/// A resolved variable location.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Global(u32),
    Local(u32),
}

pub struct Compiler<'a> {
    list: TupleList,
    table: &'a FunctionTable,
    globals: FxHashMap<String, u32>,
    global_names: Vec<(String, u32)>,
    num_globals: u32,
    /// Formals of the function being lowered, when inside one.
    params: Option<Vec<String>>,
    loops: Vec<LoopCtx>,
    section: Section,
    /// Pattern-only rules print `$0` unless extensions claimed them.
    blank_rule_prints: bool,
    /// `-ni`: no automatic input loop is emitted.
    no_auto_input: bool,
    hidden_counter: usize,
}

/// Lowers a resolved program into an executable tuple list.
pub fn compile(
    program: &Program,
    table: &FunctionTable,
    settings: &Settings,
) -> AwkResult<TupleList> {
    let mut compiler = Compiler::new(table, settings);
    compiler.compile_program(program)?;
    let mut list = compiler.finish();
    list.post_process()?;
    Ok(list)
}

impl<'a> Compiler<'a> {
    fn new(table: &'a FunctionTable, settings: &Settings) -> Self {
        let mut compiler = Self {
            list: TupleList::new(),
            table,
            globals: FxHashMap::default(),
            global_names: Vec::new(),
            num_globals: 0,
            params: None,
            loops: Vec::new(),
            section: Section::Begin,
            blank_rule_prints: !settings.user_extensions,
            no_auto_input: settings.no_auto_input,
            hidden_counter: 0,
        };
        for name in special::NAMES {
            compiler.global_offset(name);
        }
        compiler
    }

    fn finish(mut self) -> TupleList {
        self.list.num_globals = self.num_globals;
        self.list.global_offsets = self.global_names;
        self.list
    }

    // -------------------------------------------------------------------------
    // PROGRAM LAYOUT
    // -------------------------------------------------------------------------

    fn compile_program(&mut self, program: &Program) -> AwkResult<()> {
        // Function entry addresses exist before any call is lowered; the
        // call tuple names the function index, not the address.
        let mut function_items = Vec::new();
        for item in &program.items {
            if let Item::Function(decl) = item {
                let index = self
                    .table
                    .index_of(&decl.name)
                    .expect("declared during analysis");
                let entry = self.list.new_address(format!("fn_{}", decl.name));
                let sig = self.table.get(index);
                self.list.functions.push(FunctionInfo {
                    name: decl.name.clone(),
                    num_params: decl.params.len() as u16,
                    array_params: sig.passing_modes(),
                    entry,
                });
                function_items.push((decl, entry));
            }
        }

        let end_addr = self.list.new_address("end_section");

        for item in &program.items {
            if let Item::Begin { body, .. } = item {
                self.section = Section::Begin;
                self.compile_stmts(body)?;
            }
        }

        let rules: Vec<_> = program
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Rule {
                    pattern, action, ..
                } => Some((pattern, action)),
                _ => None,
            })
            .collect();
        let has_ends = program
            .items
            .iter()
            .any(|item| matches!(item, Item::End { .. }));

        if (!rules.is_empty() || has_ends) && !self.no_auto_input {
            let loop_addr = self.list.new_address("main_loop");
            self.list.resolve_here(loop_addr);
            self.list.emit(Opcode::ConsumeInput { eof: end_addr });
            self.section = Section::Main;
            for (pattern, action) in rules {
                self.compile_rule(pattern.as_ref(), action.as_deref())?;
            }
            self.list.emit(Opcode::Jump(loop_addr));
            self.list.main_loop = Some(loop_addr);
        }

        self.list.resolve_here(end_addr);
        self.list.end_section = end_addr;
        for item in &program.items {
            if let Item::End { body, .. } = item {
                self.section = Section::End;
                self.compile_stmts(body)?;
            }
        }
        self.list.emit(Opcode::Halt);

        self.section = Section::Function;
        for (decl, entry) in function_items {
            self.list.resolve_here(entry);
            self.params = Some(decl.params.clone());
            self.compile_stmts(&decl.body)?;
            self.list.emit(Opcode::PushUninit);
            self.list.emit(Opcode::Return);
            self.params = None;
        }

        Ok(())
    }

    fn compile_rule(
        &mut self,
        pattern: Option<&Pattern>,
        action: Option<&[Stmt]>,
    ) -> AwkResult<()> {
        match pattern {
            None => self.compile_rule_body(action)?,
            Some(Pattern::Expr(expr)) => {
                let skip = self.list.new_address("rule_skip");
                self.compile_expr(expr)?;
                self.list.emit(Opcode::JumpIfFalse(skip));
                self.compile_rule_body(action)?;
                self.list.resolve_here(skip);
            }
            Some(Pattern::Range(start, end)) => {
                // Range state survives across records in a hidden global.
                let flag = self.hidden_global("range");
                let in_range = self.list.new_address("range_active");
                let run = self.list.new_address("range_run");
                let skip = self.list.new_address("range_skip");

                self.list.emit(Opcode::LoadGlobal(flag));
                self.list.emit(Opcode::JumpIfTrue(in_range));

                self.compile_expr(start)?;
                self.list.emit(Opcode::JumpIfFalse(skip));
                self.list.emit(Opcode::PushInt(1));
                self.list.emit(Opcode::StoreGlobal(flag));
                self.list.emit(Opcode::Pop);

                // The end pattern is tested on the starting record too:
                // a range may open and close on the same line.
                self.list.resolve_here(in_range);
                self.compile_expr(end)?;
                self.list.emit(Opcode::JumpIfFalse(run));
                self.list.emit(Opcode::PushInt(0));
                self.list.emit(Opcode::StoreGlobal(flag));
                self.list.emit(Opcode::Pop);

                self.list.resolve_here(run);
                self.compile_rule_body(action)?;
                self.list.resolve_here(skip);
            }
        }
        Ok(())
    }

    fn compile_rule_body(&mut self, action: Option<&[Stmt]>) -> AwkResult<()> {
        match action {
            Some(stmts) => self.compile_stmts(stmts),
            None => {
                if self.blank_rule_prints {
                    self.emit_field0();
                    self.list.emit(Opcode::Print {
                        argc: 1,
                        redirect: Redirect::None,
                    });
                }
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // STATEMENTS
    // -------------------------------------------------------------------------

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> AwkResult<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> AwkResult<()> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.list.emit(Opcode::Pop);
                Ok(())
            }
            Stmt::Print { args, redirect, .. } => self.compile_print(args, redirect, false),
            Stmt::Printf { args, redirect, .. } => self.compile_print(args, redirect, true),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let else_addr = self.list.new_address("if_else");
                self.compile_expr(condition)?;
                self.list.emit(Opcode::JumpIfFalse(else_addr));
                self.compile_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let end_addr = self.list.new_address("if_end");
                    self.list.emit(Opcode::Jump(end_addr));
                    self.list.resolve_here(else_addr);
                    self.compile_stmt(else_branch)?;
                    self.list.resolve_here(end_addr);
                } else {
                    self.list.resolve_here(else_addr);
                }
                Ok(())
            }
            Stmt::While { condition, body, .. } => {
                let start = self.list.new_address("while_start");
                let end = self.list.new_address("while_end");
                self.list.resolve_here(start);
                self.compile_expr(condition)?;
                self.list.emit(Opcode::JumpIfFalse(end));
                self.loops.push(LoopCtx {
                    break_addr: end,
                    continue_addr: start,
                    is_forin: false,
                });
                self.compile_stmt(body)?;
                self.loops.pop();
                self.list.emit(Opcode::Jump(start));
                self.list.resolve_here(end);
                Ok(())
            }
            Stmt::DoWhile { body, condition, .. } => {
                let start = self.list.new_address("do_start");
                let cont = self.list.new_address("do_cond");
                let end = self.list.new_address("do_end");
                self.list.resolve_here(start);
                self.loops.push(LoopCtx {
                    break_addr: end,
                    continue_addr: cont,
                    is_forin: false,
                });
                self.compile_stmt(body)?;
                self.loops.pop();
                self.list.resolve_here(cont);
                self.compile_expr(condition)?;
                self.list.emit(Opcode::JumpIfTrue(start));
                self.list.resolve_here(end);
                Ok(())
            }
            Stmt::For {
                init,
                condition,
                update,
                body,
                ..
            } => {
                if let Some(init) = init {
                    self.compile_stmt(init)?;
                }
                let cond_addr = self.list.new_address("for_cond");
                let cont = self.list.new_address("for_update");
                let end = self.list.new_address("for_end");
                self.list.resolve_here(cond_addr);
                if let Some(condition) = condition {
                    self.compile_expr(condition)?;
                    self.list.emit(Opcode::JumpIfFalse(end));
                }
                self.loops.push(LoopCtx {
                    break_addr: end,
                    continue_addr: cont,
                    is_forin: false,
                });
                self.compile_stmt(body)?;
                self.loops.pop();
                self.list.resolve_here(cont);
                if let Some(update) = update {
                    self.compile_stmt(update)?;
                }
                self.list.emit(Opcode::Jump(cond_addr));
                self.list.resolve_here(end);
                Ok(())
            }
            Stmt::ForIn {
                var, array, body, ..
            } => {
                match self.resolve(array) {
                    Slot::Global(off) => self.list.emit(Opcode::ArrayRefGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::ArrayRefLocal(off)),
                };
                self.list.emit(Opcode::KeyList);
                let start = self.list.new_address("forin_next");
                let end = self.list.new_address("forin_end");
                self.list.resolve_here(start);
                self.list.emit(Opcode::IterNext { end });
                match self.resolve(var) {
                    Slot::Global(off) => self.list.emit(Opcode::StoreGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::StoreLocal(off)),
                };
                self.list.emit(Opcode::Pop);
                self.loops.push(LoopCtx {
                    break_addr: end,
                    continue_addr: start,
                    is_forin: true,
                });
                self.compile_stmt(body)?;
                self.loops.pop();
                self.list.emit(Opcode::Jump(start));
                self.list.resolve_here(end);
                Ok(())
            }
            Stmt::Block { stmts, .. } => self.compile_stmts(stmts),
            Stmt::Break { span } => {
                let ctx = self.loops.last().ok_or_else(|| {
                    AwkError::semantic("'break' outside of a loop", *span)
                })?;
                let (target, pops) = (ctx.break_addr, ctx.is_forin);
                if pops {
                    // Discard the key enumerator left on the stack.
                    self.list.emit(Opcode::Pop);
                }
                self.list.emit(Opcode::Jump(target));
                Ok(())
            }
            Stmt::Continue { span } => {
                let ctx = self.loops.last().ok_or_else(|| {
                    AwkError::semantic("'continue' outside of a loop", *span)
                })?;
                let target = ctx.continue_addr;
                self.list.emit(Opcode::Jump(target));
                Ok(())
            }
            Stmt::Next { span } => {
                if matches!(self.section, Section::Begin | Section::End) {
                    return Err(AwkError::semantic(
                        "'next' cannot be used inside BEGIN or END",
                        *span,
                    ));
                }
                self.list.emit(Opcode::Next);
                Ok(())
            }
            Stmt::NextFile { span } => {
                if matches!(self.section, Section::Begin | Section::End) {
                    return Err(AwkError::semantic(
                        "'nextfile' cannot be used inside BEGIN or END",
                        *span,
                    ));
                }
                self.list.emit(Opcode::NextFile);
                Ok(())
            }
            Stmt::Exit { code, .. } => {
                let has_code = code.is_some();
                if let Some(code) = code {
                    self.compile_expr(code)?;
                }
                self.list.emit(Opcode::Exit { has_code });
                Ok(())
            }
            Stmt::Return { value, span } => {
                if self.section != Section::Function {
                    return Err(AwkError::semantic(
                        "'return' outside of a function",
                        *span,
                    ));
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.list.emit(Opcode::PushUninit);
                    }
                }
                self.list.emit(Opcode::Return);
                Ok(())
            }
            Stmt::Delete {
                array, subscripts, ..
            } => {
                if subscripts.is_empty() {
                    match self.resolve(array) {
                        Slot::Global(off) => self.list.emit(Opcode::DeleteArrayGlobal(off)),
                        Slot::Local(off) => self.list.emit(Opcode::DeleteArrayLocal(off)),
                    };
                } else {
                    self.compile_subscripts(subscripts)?;
                    match self.resolve(array) {
                        Slot::Global(off) => self.list.emit(Opcode::DeleteElemGlobal(off)),
                        Slot::Local(off) => self.list.emit(Opcode::DeleteElemLocal(off)),
                    };
                }
                Ok(())
            }
        }
    }

    fn compile_print(
        &mut self,
        args: &[Expr],
        redirect: &Option<(OutputRedirect, Box<Expr>)>,
        is_printf: bool,
    ) -> AwkResult<()> {
        let mut argc = args.len() as u16;
        if args.is_empty() && !is_printf {
            self.emit_field0();
            argc = 1;
        } else {
            for arg in args {
                self.compile_expr(arg)?;
            }
        }

        let redirect_kind = match redirect {
            None => Redirect::None,
            Some((kind, target)) => {
                self.compile_expr(target)?;
                match kind {
                    OutputRedirect::Truncate => Redirect::Truncate,
                    OutputRedirect::Append => Redirect::Append,
                    OutputRedirect::Pipe => Redirect::Pipe,
                    OutputRedirect::TwoWayPipe => Redirect::TwoWayPipe,
                }
            }
        };

        let op = if is_printf {
            Opcode::Printf {
                argc,
                redirect: redirect_kind,
            }
        } else {
            Opcode::Print {
                argc,
                redirect: redirect_kind,
            }
        };
        self.list.emit(op);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // EXPRESSIONS
    // -------------------------------------------------------------------------

    /// Lowers one expression; exactly one value is left on the stack.
    fn compile_expr(&mut self, expr: &Expr) -> AwkResult<()> {
        match expr {
            Expr::Int { value, .. } => {
                self.list.emit(Opcode::PushInt(*value));
                Ok(())
            }
            Expr::Double { value, .. } => {
                self.list.emit(Opcode::PushDouble(*value));
                Ok(())
            }
            Expr::Str { value, .. } => {
                self.list.emit(Opcode::PushStr(value.clone()));
                Ok(())
            }
            Expr::Ere { pattern, .. } => {
                // A bare ERE tests the current record.
                self.emit_field0();
                self.list.emit(Opcode::PushStr(pattern.clone()));
                self.list.emit(Opcode::Match { negate: false });
                Ok(())
            }
            Expr::Var { name, .. } => {
                match self.resolve(name) {
                    Slot::Global(off) => self.list.emit(Opcode::LoadGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::LoadLocal(off)),
                };
                Ok(())
            }
            Expr::Field { index, .. } => {
                self.compile_expr(index)?;
                self.list.emit(Opcode::LoadField);
                Ok(())
            }
            Expr::ArrayElem {
                array, subscripts, ..
            } => {
                self.compile_subscripts(subscripts)?;
                match self.resolve(array) {
                    Slot::Global(off) => self.list.emit(Opcode::ArrayLoadGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::ArrayLoadLocal(off)),
                };
                Ok(())
            }
            Expr::Assign { target, value, .. } => {
                self.compile_assignment(target, |c| c.compile_expr(value))
            }
            Expr::CompoundAssign {
                target, op, value, ..
            } => self.compile_compound(target, *op, value),
            Expr::Binary {
                left, op, right, ..
            } => self.compile_binary(left, *op, right),
            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.list.emit(Opcode::Negate),
                    UnaryOp::Pos => self.list.emit(Opcode::AsNumber),
                    UnaryOp::Not => self.list.emit(Opcode::Not),
                };
                Ok(())
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                let else_addr = self.list.new_address("ternary_else");
                let end_addr = self.list.new_address("ternary_end");
                self.compile_expr(condition)?;
                self.list.emit(Opcode::JumpIfFalse(else_addr));
                self.compile_expr(then_expr)?;
                self.list.emit(Opcode::Jump(end_addr));
                self.list.resolve_here(else_addr);
                self.compile_expr(else_expr)?;
                self.list.resolve_here(end_addr);
                Ok(())
            }
            Expr::Match {
                left,
                pattern,
                negate,
                ..
            } => {
                self.compile_expr(left)?;
                self.compile_pattern_operand(pattern)?;
                self.list.emit(Opcode::Match { negate: *negate });
                Ok(())
            }
            Expr::In {
                subscripts, array, ..
            } => {
                self.compile_subscripts(subscripts)?;
                match self.resolve(array) {
                    Slot::Global(off) => self.list.emit(Opcode::InGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::InLocal(off)),
                };
                Ok(())
            }
            Expr::Concat { left, right, .. } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.list.emit(Opcode::Concat);
                Ok(())
            }
            Expr::IncDec {
                target,
                op,
                postfix,
                ..
            } => {
                let binop = match op {
                    IncDecOp::Inc => BinOp::Add,
                    IncDecOp::Dec => BinOp::Sub,
                };
                self.compile_compound_with(target, binop, |c| {
                    c.list.emit(Opcode::PushInt(1));
                    Ok(())
                })?;
                if *postfix {
                    // Recover the pre-increment value from the result.
                    self.list.emit(Opcode::PushInt(1));
                    match op {
                        IncDecOp::Inc => self.list.emit(Opcode::Sub),
                        IncDecOp::Dec => self.list.emit(Opcode::Add),
                    };
                }
                Ok(())
            }
            Expr::Call {
                name,
                args,
                resolved,
                span,
            } => {
                let index = resolved.ok_or_else(|| {
                    AwkError::semantic(
                        format!("call to unresolved function '{}'", name),
                        *span,
                    )
                })?;
                let modes = self.table.get(index).passing_modes();
                for (i, arg) in args.iter().enumerate() {
                    if modes.get(i).copied().unwrap_or(false) {
                        match arg {
                            Expr::Var { name, .. } => {
                                match self.resolve(name) {
                                    Slot::Global(off) => {
                                        self.list.emit(Opcode::ArrayRefGlobal(off))
                                    }
                                    Slot::Local(off) => {
                                        self.list.emit(Opcode::ArrayRefLocal(off))
                                    }
                                };
                            }
                            other => {
                                return Err(AwkError::semantic(
                                    format!(
                                        "argument {} of '{}' must be an array",
                                        i + 1,
                                        name
                                    ),
                                    other.span(),
                                ));
                            }
                        }
                    } else {
                        self.compile_expr(arg)?;
                    }
                }
                self.list.emit(Opcode::Call {
                    function: index,
                    argc: args.len() as u16,
                });
                Ok(())
            }
            Expr::BuiltinCall { builtin, args, span } => {
                self.compile_builtin(*builtin, args, *span)
            }
            Expr::ExtensionCall { keyword, args, .. } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.list.emit(Opcode::InvokeExtension {
                    keyword: keyword.clone(),
                    argc: args.len() as u16,
                });
                Ok(())
            }
            Expr::Getline { source, target, .. } => self.compile_getline(source, target),
            Expr::Grouping { exprs, span } => {
                if exprs.len() == 1 {
                    self.compile_expr(&exprs[0])
                } else {
                    Err(AwkError::semantic(
                        "grouped expression list is only valid before 'in'",
                        *span,
                    ))
                }
            }
        }
    }

    /// Short-circuit logical operators produce 0/1 like every other
    /// boolean result.
    fn compile_binary(&mut self, left: &Expr, op: BinOp, right: &Expr) -> AwkResult<()> {
        match op {
            BinOp::And => {
                let false_addr = self.list.new_address("and_false");
                let end_addr = self.list.new_address("and_end");
                self.compile_expr(left)?;
                self.list.emit(Opcode::JumpIfFalse(false_addr));
                self.compile_expr(right)?;
                self.list.emit(Opcode::JumpIfFalse(false_addr));
                self.list.emit(Opcode::PushInt(1));
                self.list.emit(Opcode::Jump(end_addr));
                self.list.resolve_here(false_addr);
                self.list.emit(Opcode::PushInt(0));
                self.list.resolve_here(end_addr);
                return Ok(());
            }
            BinOp::Or => {
                let true_addr = self.list.new_address("or_true");
                let end_addr = self.list.new_address("or_end");
                self.compile_expr(left)?;
                self.list.emit(Opcode::JumpIfTrue(true_addr));
                self.compile_expr(right)?;
                self.list.emit(Opcode::JumpIfTrue(true_addr));
                self.list.emit(Opcode::PushInt(0));
                self.list.emit(Opcode::Jump(end_addr));
                self.list.resolve_here(true_addr);
                self.list.emit(Opcode::PushInt(1));
                self.list.resolve_here(end_addr);
                return Ok(());
            }
            _ => {}
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        match op {
            BinOp::Add => self.list.emit(Opcode::Add),
            BinOp::Sub => self.list.emit(Opcode::Sub),
            BinOp::Mul => self.list.emit(Opcode::Mul),
            BinOp::Div => self.list.emit(Opcode::Div),
            BinOp::Mod => self.list.emit(Opcode::Mod),
            BinOp::Pow => self.list.emit(Opcode::Pow),
            BinOp::Lt => self.list.emit(Opcode::Lt),
            BinOp::Le => self.list.emit(Opcode::Le),
            BinOp::Gt => self.list.emit(Opcode::Gt),
            BinOp::Ge => self.list.emit(Opcode::Ge),
            BinOp::Eq => self.list.emit(Opcode::Eq),
            BinOp::Ne => self.list.emit(Opcode::Ne),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        Ok(())
    }

    /// Assignment: the stored value stays on the stack.
    fn compile_assignment(
        &mut self,
        target: &LValue,
        value: impl FnOnce(&mut Self) -> AwkResult<()>,
    ) -> AwkResult<()> {
        match target {
            LValue::Var { name, .. } => {
                value(self)?;
                match self.resolve(name) {
                    Slot::Global(off) => self.list.emit(Opcode::StoreGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::StoreLocal(off)),
                };
            }
            LValue::Field { index, .. } => {
                self.compile_expr(index)?;
                value(self)?;
                self.list.emit(Opcode::StoreField);
            }
            LValue::ArrayElem {
                array, subscripts, ..
            } => {
                self.compile_subscripts(subscripts)?;
                value(self)?;
                match self.resolve(array) {
                    Slot::Global(off) => self.list.emit(Opcode::ArrayStoreGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::ArrayStoreLocal(off)),
                };
            }
        }
        Ok(())
    }

    fn compile_compound(&mut self, target: &LValue, op: BinOp, value: &Expr) -> AwkResult<()> {
        self.compile_compound_with(target, op, |c| c.compile_expr(value))
    }

    /// Read-modify-write on an lvalue, evaluating the key or field index
    /// exactly once. Leaves the new value on the stack.
    fn compile_compound_with(
        &mut self,
        target: &LValue,
        op: BinOp,
        value: impl FnOnce(&mut Self) -> AwkResult<()>,
    ) -> AwkResult<()> {
        let arith = |c: &mut Self| match op {
            BinOp::Add => c.list.emit(Opcode::Add),
            BinOp::Sub => c.list.emit(Opcode::Sub),
            BinOp::Mul => c.list.emit(Opcode::Mul),
            BinOp::Div => c.list.emit(Opcode::Div),
            BinOp::Mod => c.list.emit(Opcode::Mod),
            BinOp::Pow => c.list.emit(Opcode::Pow),
            _ => unreachable!("compound assignment is arithmetic"),
        };

        match target {
            LValue::Var { name, .. } => {
                match self.resolve(name) {
                    Slot::Global(off) => {
                        self.list.emit(Opcode::LoadGlobal(off));
                        value(self)?;
                        arith(self);
                        self.list.emit(Opcode::StoreGlobal(off));
                    }
                    Slot::Local(off) => {
                        self.list.emit(Opcode::LoadLocal(off));
                        value(self)?;
                        arith(self);
                        self.list.emit(Opcode::StoreLocal(off));
                    }
                };
            }
            LValue::Field { index, .. } => {
                self.compile_expr(index)?;
                self.list.emit(Opcode::Dup);
                self.list.emit(Opcode::LoadField);
                value(self)?;
                arith(self);
                self.list.emit(Opcode::StoreField);
            }
            LValue::ArrayElem {
                array, subscripts, ..
            } => {
                self.compile_subscripts(subscripts)?;
                self.list.emit(Opcode::Dup);
                let slot = self.resolve(array);
                match slot {
                    Slot::Global(off) => self.list.emit(Opcode::ArrayLoadGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::ArrayLoadLocal(off)),
                };
                value(self)?;
                arith(self);
                match slot {
                    Slot::Global(off) => self.list.emit(Opcode::ArrayStoreGlobal(off)),
                    Slot::Local(off) => self.list.emit(Opcode::ArrayStoreLocal(off)),
                };
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // BUILTINS / GETLINE
    // -------------------------------------------------------------------------

    fn compile_builtin(&mut self, builtin: Builtin, args: &[Expr], _span: Span) -> AwkResult<()> {
        match builtin {
            Builtin::Sub | Builtin::Gsub => {
                self.compile_pattern_operand(&args[0])?;
                self.compile_expr(&args[1])?;
                let target = match args.get(2) {
                    None => StoreTarget::Record,
                    Some(expr) => self.store_target_for(expr)?,
                };
                self.list.emit(Opcode::Substitute {
                    global: builtin == Builtin::Gsub,
                    target,
                });
                Ok(())
            }
            Builtin::Split => {
                self.compile_expr(&args[0])?;
                match &args[1] {
                    Expr::Var { name, .. } => {
                        match self.resolve(name) {
                            Slot::Global(off) => self.list.emit(Opcode::ArrayRefGlobal(off)),
                            Slot::Local(off) => self.list.emit(Opcode::ArrayRefLocal(off)),
                        };
                    }
                    other => {
                        return Err(AwkError::semantic(
                            "second argument of split must be an array",
                            other.span(),
                        ));
                    }
                }
                if let Some(sep) = args.get(2) {
                    self.compile_pattern_operand(sep)?;
                }
                self.list.emit(Opcode::CallBuiltin {
                    builtin,
                    argc: args.len() as u16,
                });
                Ok(())
            }
            Builtin::Match => {
                self.compile_expr(&args[0])?;
                self.compile_pattern_operand(&args[1])?;
                self.list.emit(Opcode::CallBuiltin { builtin, argc: 2 });
                Ok(())
            }
            Builtin::Dump => {
                if let Some(arg) = args.first() {
                    match arg {
                        Expr::Var { name, .. } => {
                            match self.resolve(name) {
                                Slot::Global(off) => {
                                    self.list.emit(Opcode::ArrayRefGlobal(off))
                                }
                                Slot::Local(off) => self.list.emit(Opcode::ArrayRefLocal(off)),
                            };
                        }
                        other => {
                            return Err(AwkError::semantic(
                                "_dump takes an array argument",
                                other.span(),
                            ));
                        }
                    }
                }
                self.list.emit(Opcode::CallBuiltin {
                    builtin,
                    argc: args.len() as u16,
                });
                Ok(())
            }
            _ => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.list.emit(Opcode::CallBuiltin {
                    builtin,
                    argc: args.len() as u16,
                });
                Ok(())
            }
        }
    }

    fn compile_getline(
        &mut self,
        source: &GetlineSrc,
        target: &Option<LValue>,
    ) -> AwkResult<()> {
        let source_kind = match source {
            GetlineSrc::CurrentInput => GetlineSource::CurrentInput,
            GetlineSrc::File(expr) => {
                self.compile_expr(expr)?;
                GetlineSource::File
            }
            GetlineSrc::Command(expr) => {
                self.compile_expr(expr)?;
                GetlineSource::Command
            }
        };

        let target_kind = match target {
            None => StoreTarget::Record,
            Some(LValue::Var { name, .. }) => match self.resolve(name) {
                Slot::Global(off) => StoreTarget::Global(off),
                Slot::Local(off) => StoreTarget::Local(off),
            },
            Some(LValue::Field { index, .. }) => {
                self.compile_expr(index)?;
                StoreTarget::Field
            }
            Some(LValue::ArrayElem {
                array, subscripts, ..
            }) => {
                self.compile_subscripts(subscripts)?;
                match self.resolve(array) {
                    Slot::Global(off) => StoreTarget::GlobalArrayElem(off),
                    Slot::Local(off) => StoreTarget::LocalArrayElem(off),
                }
            }
        };

        self.list.emit(Opcode::Getline {
            source: source_kind,
            target: target_kind,
        });
        Ok(())
    }

    /// The in-place target of `sub`/`gsub`, with its key or field index
    /// lowered onto the stack.
    fn store_target_for(&mut self, expr: &Expr) -> AwkResult<StoreTarget> {
        match expr {
            Expr::Var { name, .. } => Ok(match self.resolve(name) {
                Slot::Global(off) => StoreTarget::Global(off),
                Slot::Local(off) => StoreTarget::Local(off),
            }),
            Expr::Field { index, .. } => {
                self.compile_expr(index)?;
                Ok(StoreTarget::Field)
            }
            Expr::ArrayElem {
                array, subscripts, ..
            } => {
                self.compile_subscripts(subscripts)?;
                Ok(match self.resolve(array) {
                    Slot::Global(off) => StoreTarget::GlobalArrayElem(off),
                    Slot::Local(off) => StoreTarget::LocalArrayElem(off),
                })
            }
            other => Err(AwkError::semantic(
                "substitution target must be assignable",
                other.span(),
            )),
        }
    }

    /// An ERE literal in pattern position pushes its text; anything else
    /// evaluates as a dynamic pattern string.
    fn compile_pattern_operand(&mut self, expr: &Expr) -> AwkResult<()> {
        if let Expr::Ere { pattern, .. } = expr {
            self.list.emit(Opcode::PushStr(pattern.clone()));
            Ok(())
        } else {
            self.compile_expr(expr)
        }
    }

    // -------------------------------------------------------------------------
    // HELPERS
    // -------------------------------------------------------------------------

    /// Lowers one or more subscripts to a single key, joining with
    /// SUBSEP when more than one.
    fn compile_subscripts(&mut self, subscripts: &[Expr]) -> AwkResult<()> {
        for sub in subscripts {
            self.compile_expr(sub)?;
        }
        if subscripts.len() > 1 {
            self.list.emit(Opcode::JoinSubsep(subscripts.len() as u16));
        }
        Ok(())
    }

    /// Pushes `$0`.
    fn emit_field0(&mut self) {
        self.list.emit(Opcode::PushInt(0));
        self.list.emit(Opcode::LoadField);
    }

    /// Resolves a name to a function-local formal slot or a global slot.
    fn resolve(&mut self, name: &str) -> Slot {
        if let Some(params) = &self.params {
            if let Some(index) = params.iter().position(|p| p == name) {
                return Slot::Local(index as u32);
            }
        }
        Slot::Global(self.global_offset(name))
    }

    fn global_offset(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.globals.get(name) {
            return offset;
        }
        let offset = self.num_globals;
        self.num_globals += 1;
        self.globals.insert(name.to_string(), offset);
        self.global_names.push((name.to_string(), offset));
        offset
    }

    /// A global slot invisible to scripts, used for range-pattern state.
    fn hidden_global(&mut self, kind: &str) -> u32 {
        let name = format!("<{}{}>", kind, self.hidden_counter);
        self.hidden_counter += 1;
        self.global_offset(&name)
    }
}
