//! # Semantic Analysis Module
//!
//! Resolves function-call references over the parsed tree. The same pass
//! runs twice: the first run binds calls to already-seen definitions and
//! classifies each formal parameter as array or scalar from its uses
//! inside the body; the second run ties call sites to forward-referenced
//! definitions and propagates array-ness through call chains.
//!
//! After the second run, every remaining unresolved call is an error —
//! builtins and extension keywords were already claimed by the parser.

use crate::ast::*;
use crate::error::{AwkError, AwkResult, Span};
use crate::token::Builtin;

use rustc_hash::FxHashMap;

// -----------------------------------------------------------------------------
// FUNCTION TABLE
// -----------------------------------------------------------------------------

/// One user-defined function signature.
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub name: String,
    pub params: Vec<String>,
    /// Array/scalar classification per formal; `None` until a use decides.
    /// Undecided formals pass by value.
    pub array_params: Vec<Option<bool>>,
    pub span: Span,
}

impl FuncSig {
    /// Final passing mode per formal (undecided formals are scalars).
    pub fn passing_modes(&self) -> Vec<bool> {
        self.array_params
            .iter()
            .map(|p| p.unwrap_or(false))
            .collect()
    }
}

/// Name → definition mapping, in definition order.
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    pub funcs: Vec<FuncSig>,
    by_name: FxHashMap<String, u32>,
}

impl FunctionTable {
    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, index: u32) -> &FuncSig {
        &self.funcs[index as usize]
    }

    fn declare(&mut self, decl: &FunctionDecl) -> AwkResult<()> {
        if self.by_name.contains_key(&decl.name) {
            return Err(AwkError::semantic(
                format!("function '{}' is defined twice", decl.name),
                decl.span,
            ));
        }
        let index = self.funcs.len() as u32;
        self.funcs.push(FuncSig {
            name: decl.name.clone(),
            params: decl.params.clone(),
            array_params: vec![None; decl.params.len()],
            span: decl.span,
        });
        self.by_name.insert(decl.name.clone(), index);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ANALYSIS DRIVER
// -----------------------------------------------------------------------------

/// Runs both semantic passes and returns the completed function table.
pub fn analyze(program: &mut Program) -> AwkResult<FunctionTable> {
    let mut table = FunctionTable::default();
    for item in &program.items {
        if let Item::Function(decl) = item {
            table.declare(decl)?;
        }
    }

    // Functions may be referenced before they are defined; the second run
    // sees the classifications the first run produced.
    resolve_pass(program, &mut table)?;
    resolve_pass(program, &mut table)?;

    check_all_resolved(program)?;
    Ok(table)
}

/// A requested classification of one formal parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Array,
    Scalar,
}

struct PendingMark {
    func: u32,
    param: usize,
    mark: Mark,
    span: Span,
}

fn resolve_pass(program: &mut Program, table: &mut FunctionTable) -> AwkResult<()> {
    let mut pending: Vec<PendingMark> = Vec::new();

    for item in &mut program.items {
        match item {
            Item::Begin { body, .. } | Item::End { body, .. } => {
                let mut walker = Walker::new(table, None, &mut pending);
                walker.stmts(body)?;
            }
            Item::Rule { pattern, action, .. } => {
                let mut walker = Walker::new(table, None, &mut pending);
                match pattern {
                    Some(Pattern::Expr(e)) => walker.expr(e, Ctx::Scalar)?,
                    Some(Pattern::Range(a, b)) => {
                        walker.expr(a, Ctx::Scalar)?;
                        walker.expr(b, Ctx::Scalar)?;
                    }
                    None => {}
                }
                if let Some(body) = action {
                    walker.stmts(body)?;
                }
            }
            Item::Function(decl) => {
                let index = table
                    .index_of(&decl.name)
                    .expect("declared in the collection pass");
                let mut walker = Walker::new(table, Some(index), &mut pending);
                walker.stmts(&mut decl.body)?;
            }
        }
    }

    for mark in pending {
        let wanted = mark.mark == Mark::Array;
        let current = table.funcs[mark.func as usize].array_params[mark.param];
        match current {
            None => {
                table.funcs[mark.func as usize].array_params[mark.param] = Some(wanted);
            }
            Some(existing) if existing != wanted => {
                let sig = &table.funcs[mark.func as usize];
                return Err(AwkError::semantic(
                    format!(
                        "parameter '{}' of function '{}' is used as both array and scalar",
                        sig.params[mark.param], sig.name
                    ),
                    mark.span,
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Errors on any call left unbound after both passes.
fn check_all_resolved(program: &Program) -> AwkResult<()> {
    struct Check;
    impl Check {
        fn stmts(&self, stmts: &[Stmt]) -> AwkResult<()> {
            for stmt in stmts {
                self.stmt(stmt)?;
            }
            Ok(())
        }

        fn stmt(&self, stmt: &Stmt) -> AwkResult<()> {
            match stmt {
                Stmt::Expr { expr, .. } => self.expr(expr),
                Stmt::Print { args, redirect, .. } | Stmt::Printf { args, redirect, .. } => {
                    for arg in args {
                        self.expr(arg)?;
                    }
                    if let Some((_, target)) = redirect {
                        self.expr(target)?;
                    }
                    Ok(())
                }
                Stmt::If {
                    condition,
                    then_branch,
                    else_branch,
                    ..
                } => {
                    self.expr(condition)?;
                    self.stmt(then_branch)?;
                    if let Some(else_branch) = else_branch {
                        self.stmt(else_branch)?;
                    }
                    Ok(())
                }
                Stmt::While { condition, body, .. } | Stmt::DoWhile { condition, body, .. } => {
                    self.expr(condition)?;
                    self.stmt(body)
                }
                Stmt::For {
                    init,
                    condition,
                    update,
                    body,
                    ..
                } => {
                    if let Some(init) = init {
                        self.stmt(init)?;
                    }
                    if let Some(condition) = condition {
                        self.expr(condition)?;
                    }
                    if let Some(update) = update {
                        self.stmt(update)?;
                    }
                    self.stmt(body)
                }
                Stmt::ForIn { body, .. } => self.stmt(body),
                Stmt::Block { stmts, .. } => self.stmts(stmts),
                Stmt::Exit { code: Some(e), .. } => self.expr(e),
                Stmt::Return { value: Some(e), .. } => self.expr(e),
                Stmt::Delete { subscripts, .. } => {
                    for s in subscripts {
                        self.expr(s)?;
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn expr(&self, expr: &Expr) -> AwkResult<()> {
            match expr {
                Expr::Call {
                    name,
                    args,
                    resolved,
                    span,
                } => {
                    if resolved.is_none() {
                        return Err(AwkError::semantic(
                            format!("call to undefined function '{}'", name),
                            *span,
                        ));
                    }
                    for arg in args {
                        self.expr(arg)?;
                    }
                    Ok(())
                }
                Expr::BuiltinCall { args, .. } | Expr::ExtensionCall { args, .. } => {
                    for arg in args {
                        self.expr(arg)?;
                    }
                    Ok(())
                }
                Expr::Field { index, .. } => self.expr(index),
                Expr::ArrayElem { subscripts, .. } => {
                    for s in subscripts {
                        self.expr(s)?;
                    }
                    Ok(())
                }
                Expr::Assign { target, value, .. } => {
                    self.lvalue(target)?;
                    self.expr(value)
                }
                Expr::CompoundAssign { target, value, .. } => {
                    self.lvalue(target)?;
                    self.expr(value)
                }
                Expr::Binary { left, right, .. } | Expr::Concat { left, right, .. } => {
                    self.expr(left)?;
                    self.expr(right)
                }
                Expr::Unary { operand, .. } => self.expr(operand),
                Expr::Ternary {
                    condition,
                    then_expr,
                    else_expr,
                    ..
                } => {
                    self.expr(condition)?;
                    self.expr(then_expr)?;
                    self.expr(else_expr)
                }
                Expr::Match { left, pattern, .. } => {
                    self.expr(left)?;
                    self.expr(pattern)
                }
                Expr::In { subscripts, .. } => {
                    for s in subscripts {
                        self.expr(s)?;
                    }
                    Ok(())
                }
                Expr::IncDec { target, .. } => self.lvalue(target),
                Expr::Getline { source, target, .. } => {
                    match source {
                        GetlineSrc::File(e) | GetlineSrc::Command(e) => self.expr(e)?,
                        GetlineSrc::CurrentInput => {}
                    }
                    if let Some(target) = target {
                        self.lvalue(target)?;
                    }
                    Ok(())
                }
                Expr::Grouping { exprs, .. } => {
                    for e in exprs {
                        self.expr(e)?;
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn lvalue(&self, lvalue: &LValue) -> AwkResult<()> {
            match lvalue {
                LValue::Field { index, .. } => self.expr(index),
                LValue::ArrayElem { subscripts, .. } => {
                    for s in subscripts {
                        self.expr(s)?;
                    }
                    Ok(())
                }
                LValue::Var { .. } => Ok(()),
            }
        }
    }

    let check = Check;
    for item in &program.items {
        match item {
            Item::Begin { body, .. } | Item::End { body, .. } => check.stmts(body)?,
            Item::Rule { pattern, action, .. } => {
                match pattern {
                    Some(Pattern::Expr(e)) => check.expr(e)?,
                    Some(Pattern::Range(a, b)) => {
                        check.expr(a)?;
                        check.expr(b)?;
                    }
                    None => {}
                }
                if let Some(body) = action {
                    check.stmts(body)?;
                }
            }
            Item::Function(decl) => check.stmts(&decl.body)?,
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// TREE WALKER
// -----------------------------------------------------------------------------

/// How an expression's value is consumed, for array/scalar inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    /// Definitely used as a scalar.
    Scalar,
    /// Argument of a user function call: array-ness flows from the callee.
    Neutral,
}

struct Walker<'a> {
    table: &'a FunctionTable,
    /// Index of the enclosing function, when walking a function body.
    current: Option<u32>,
    pending: &'a mut Vec<PendingMark>,
}

impl<'a> Walker<'a> {
    fn new(
        table: &'a FunctionTable,
        current: Option<u32>,
        pending: &'a mut Vec<PendingMark>,
    ) -> Self {
        Self {
            table,
            current,
            pending,
        }
    }

    /// Position of `name` in the enclosing function's formals.
    fn param_index(&self, name: &str) -> Option<(u32, usize)> {
        let func = self.current?;
        let sig = self.table.get(func);
        sig.params
            .iter()
            .position(|p| p == name)
            .map(|i| (func, i))
    }

    fn mark(&mut self, name: &str, mark: Mark, span: Span) {
        if let Some((func, param)) = self.param_index(name) {
            self.pending.push(PendingMark {
                func,
                param,
                mark,
                span,
            });
        }
    }

    fn stmts(&mut self, stmts: &mut [Stmt]) -> AwkResult<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &mut Stmt) -> AwkResult<()> {
        match stmt {
            Stmt::Expr { expr, .. } => self.expr(expr, Ctx::Scalar),
            Stmt::Print { args, redirect, .. } | Stmt::Printf { args, redirect, .. } => {
                for arg in args.iter_mut() {
                    self.expr(arg, Ctx::Scalar)?;
                }
                if let Some((_, target)) = redirect {
                    self.expr(target, Ctx::Scalar)?;
                }
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.expr(condition, Ctx::Scalar)?;
                self.stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    self.stmt(else_branch)?;
                }
                Ok(())
            }
            Stmt::While { condition, body, .. } | Stmt::DoWhile { condition, body, .. } => {
                self.expr(condition, Ctx::Scalar)?;
                self.stmt(body)
            }
            Stmt::For {
                init,
                condition,
                update,
                body,
                ..
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                if let Some(condition) = condition {
                    self.expr(condition, Ctx::Scalar)?;
                }
                if let Some(update) = update {
                    self.stmt(update)?;
                }
                self.stmt(body)
            }
            Stmt::ForIn {
                var, array, body, span,
            } => {
                self.mark(var, Mark::Scalar, *span);
                self.mark(array, Mark::Array, *span);
                self.stmt(body)
            }
            Stmt::Block { stmts, .. } => self.stmts(stmts),
            Stmt::Exit { code: Some(e), .. } => self.expr(e, Ctx::Scalar),
            Stmt::Return { value: Some(e), .. } => self.expr(e, Ctx::Scalar),
            Stmt::Delete {
                array,
                subscripts,
                span,
            } => {
                self.mark(array, Mark::Array, *span);
                for s in subscripts.iter_mut() {
                    self.expr(s, Ctx::Scalar)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn lvalue(&mut self, lvalue: &mut LValue) -> AwkResult<()> {
        match lvalue {
            LValue::Var { name, span } => {
                let (name, span) = (name.clone(), *span);
                self.mark(&name, Mark::Scalar, span);
                Ok(())
            }
            LValue::Field { index, .. } => self.expr(index, Ctx::Scalar),
            LValue::ArrayElem {
                array,
                subscripts,
                span,
            } => {
                let (array, span) = (array.clone(), *span);
                self.mark(&array, Mark::Array, span);
                for s in subscripts.iter_mut() {
                    self.expr(s, Ctx::Scalar)?;
                }
                Ok(())
            }
        }
    }

    fn expr(&mut self, expr: &mut Expr, ctx: Ctx) -> AwkResult<()> {
        match expr {
            Expr::Var { name, span } => {
                if ctx == Ctx::Scalar {
                    let (name, span) = (name.clone(), *span);
                    self.mark(&name, Mark::Scalar, span);
                }
                Ok(())
            }
            Expr::Field { index, .. } => self.expr(index, Ctx::Scalar),
            Expr::ArrayElem {
                array,
                subscripts,
                span,
            } => {
                let (array, span) = (array.clone(), *span);
                self.mark(&array, Mark::Array, span);
                for s in subscripts.iter_mut() {
                    self.expr(s, Ctx::Scalar)?;
                }
                Ok(())
            }
            Expr::Assign { target, value, .. } => {
                self.lvalue(target)?;
                self.expr(value, Ctx::Scalar)
            }
            Expr::CompoundAssign { target, value, .. } => {
                self.lvalue(target)?;
                self.expr(value, Ctx::Scalar)
            }
            Expr::Binary { left, right, .. } | Expr::Concat { left, right, .. } => {
                self.expr(left, Ctx::Scalar)?;
                self.expr(right, Ctx::Scalar)
            }
            Expr::Unary { operand, .. } => self.expr(operand, Ctx::Scalar),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.expr(condition, Ctx::Scalar)?;
                self.expr(then_expr, Ctx::Scalar)?;
                self.expr(else_expr, Ctx::Scalar)
            }
            Expr::Match { left, pattern, .. } => {
                self.expr(left, Ctx::Scalar)?;
                self.expr(pattern, Ctx::Scalar)
            }
            Expr::In {
                subscripts,
                array,
                span,
            } => {
                let (array, span) = (array.clone(), *span);
                self.mark(&array, Mark::Array, span);
                for s in subscripts.iter_mut() {
                    self.expr(s, Ctx::Scalar)?;
                }
                Ok(())
            }
            Expr::IncDec { target, .. } => self.lvalue(target),
            Expr::Call {
                name,
                args,
                resolved,
                span,
            } => {
                let index = self.table.index_of(name);
                if let Some(index) = index {
                    let sig = self.table.get(index);
                    if args.len() > sig.params.len() {
                        return Err(AwkError::semantic(
                            format!(
                                "function '{}' takes at most {} arguments, got {}",
                                name,
                                sig.params.len(),
                                args.len()
                            ),
                            *span,
                        ));
                    }
                    *resolved = Some(index);

                    // Tie actual parameters to the callee's formals:
                    // a bare variable passed where the callee wants an
                    // array is itself an array.
                    let modes: Vec<Option<bool>> = sig.array_params.clone();
                    for (i, arg) in args.iter_mut().enumerate() {
                        match modes.get(i).copied().flatten() {
                            Some(true) => {
                                if let Expr::Var { name, span } = arg {
                                    let (name, span) = (name.clone(), *span);
                                    self.mark(&name, Mark::Array, span);
                                } else {
                                    self.expr(arg, Ctx::Scalar)?;
                                }
                            }
                            Some(false) => self.expr(arg, Ctx::Scalar)?,
                            None => self.expr(arg, Ctx::Neutral)?,
                        }
                    }
                } else {
                    for arg in args.iter_mut() {
                        self.expr(arg, Ctx::Neutral)?;
                    }
                }
                Ok(())
            }
            Expr::BuiltinCall { builtin, args, .. } => {
                // split()'s second argument is an output array.
                for (i, arg) in args.iter_mut().enumerate() {
                    if *builtin == Builtin::Split && i == 1 {
                        if let Expr::Var { name, span } = arg {
                            let (name, span) = (name.clone(), *span);
                            self.mark(&name, Mark::Array, span);
                            continue;
                        }
                    }
                    if *builtin == Builtin::Dump {
                        if let Expr::Var { name, span } = arg {
                            let (name, span) = (name.clone(), *span);
                            self.mark(&name, Mark::Array, span);
                            continue;
                        }
                    }
                    self.expr(arg, Ctx::Scalar)?;
                }
                Ok(())
            }
            Expr::ExtensionCall { args, .. } => {
                for arg in args.iter_mut() {
                    self.expr(arg, Ctx::Neutral)?;
                }
                Ok(())
            }
            Expr::Getline { source, target, .. } => {
                match source {
                    GetlineSrc::File(e) | GetlineSrc::Command(e) => self.expr(e, Ctx::Scalar)?,
                    GetlineSrc::CurrentInput => {}
                }
                if let Some(target) = target {
                    self.lvalue(target)?;
                }
                Ok(())
            }
            Expr::Grouping { exprs, .. } => {
                for e in exprs.iter_mut() {
                    self.expr(e, Ctx::Scalar)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
