use crate::error::Span;
use crate::token::Builtin;

use std::io::Write;

/// A parsed AWK program: BEGIN/END blocks, pattern-action rules, and
/// function definitions, in source order.
#[derive(Debug, Clone)]
pub struct Program {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    Begin {
        body: Vec<Stmt>,
        span: Span,
    },
    End {
        body: Vec<Stmt>,
        span: Span,
    },
    Rule {
        pattern: Option<Pattern>,
        /// `None` is a pattern-only rule (implicit `print $0`).
        action: Option<Vec<Stmt>>,
        span: Span,
    },
    Function(FunctionDecl),
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Expr(Expr),
    Range(Expr, Expr),
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr {
        expr: Expr,
        span: Span,
    },
    Print {
        args: Vec<Expr>,
        redirect: Option<(OutputRedirect, Box<Expr>)>,
        span: Span,
    },
    Printf {
        args: Vec<Expr>,
        redirect: Option<(OutputRedirect, Box<Expr>)>,
        span: Span,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    DoWhile {
        body: Box<Stmt>,
        condition: Expr,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        update: Option<Box<Stmt>>,
        body: Box<Stmt>,
        span: Span,
    },
    ForIn {
        var: String,
        array: String,
        body: Box<Stmt>,
        span: Span,
    },
    Block {
        stmts: Vec<Stmt>,
        span: Span,
    },
    Break {
        span: Span,
    },
    Continue {
        span: Span,
    },
    Next {
        span: Span,
    },
    NextFile {
        span: Span,
    },
    Exit {
        code: Option<Expr>,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Delete {
        array: String,
        /// Empty means `delete arr` — clear the whole array.
        subscripts: Vec<Expr>,
        span: Span,
    },
}

/// Output redirection on `print`/`printf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRedirect {
    Truncate,
    Append,
    Pipe,
    TwoWayPipe,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int {
        value: i64,
        span: Span,
    },
    Double {
        value: f64,
        span: Span,
    },
    Str {
        value: String,
        span: Span,
    },
    /// A bare ERE literal in expression position: matches against `$0`.
    Ere {
        pattern: String,
        span: Span,
    },
    Var {
        name: String,
        span: Span,
    },
    Field {
        index: Box<Expr>,
        span: Span,
    },
    ArrayElem {
        array: String,
        subscripts: Vec<Expr>,
        span: Span,
    },
    Assign {
        target: LValue,
        value: Box<Expr>,
        span: Span,
    },
    CompoundAssign {
        target: LValue,
        op: BinOp,
        value: Box<Expr>,
        span: Span,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        span: Span,
    },
    /// `left ~ pattern` / `left !~ pattern`.
    Match {
        left: Box<Expr>,
        pattern: Box<Expr>,
        negate: bool,
        span: Span,
    },
    /// `key in arr` / `(k1, k2) in arr`.
    In {
        subscripts: Vec<Expr>,
        array: String,
        span: Span,
    },
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    IncDec {
        target: LValue,
        op: IncDecOp,
        postfix: bool,
        span: Span,
    },
    /// Call of a user-defined function; `resolved` is bound by the
    /// semantic passes to an index into the function table.
    Call {
        name: String,
        args: Vec<Expr>,
        resolved: Option<u32>,
        span: Span,
    },
    BuiltinCall {
        builtin: Builtin,
        args: Vec<Expr>,
        span: Span,
    },
    /// Call of a registered extension keyword.
    ExtensionCall {
        keyword: String,
        args: Vec<Expr>,
        span: Span,
    },
    Getline {
        source: GetlineSrc,
        target: Option<LValue>,
        span: Span,
    },
    /// A parenthesised expression list. Only valid directly before `in`
    /// or as a `print`/`printf` argument list; the parser enforces this.
    Grouping {
        exprs: Vec<Expr>,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub enum GetlineSrc {
    CurrentInput,
    File(Box<Expr>),
    Command(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum LValue {
    Var {
        name: String,
        span: Span,
    },
    Field {
        index: Box<Expr>,
        span: Span,
    },
    ArrayElem {
        array: String,
        subscripts: Vec<Expr>,
        span: Span,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDecOp {
    Inc,
    Dec,
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int { span, .. }
            | Expr::Double { span, .. }
            | Expr::Str { span, .. }
            | Expr::Ere { span, .. }
            | Expr::Var { span, .. }
            | Expr::Field { span, .. }
            | Expr::ArrayElem { span, .. }
            | Expr::Assign { span, .. }
            | Expr::CompoundAssign { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Ternary { span, .. }
            | Expr::Match { span, .. }
            | Expr::In { span, .. }
            | Expr::Concat { span, .. }
            | Expr::IncDec { span, .. }
            | Expr::Call { span, .. }
            | Expr::BuiltinCall { span, .. }
            | Expr::ExtensionCall { span, .. }
            | Expr::Getline { span, .. }
            | Expr::Grouping { span, .. } => *span,
        }
    }
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr { span, .. }
            | Stmt::Print { span, .. }
            | Stmt::Printf { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::For { span, .. }
            | Stmt::ForIn { span, .. }
            | Stmt::Block { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Next { span }
            | Stmt::NextFile { span }
            | Stmt::Exit { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Delete { span, .. } => *span,
        }
    }
}

impl LValue {
    pub fn span(&self) -> Span {
        match self {
            LValue::Var { span, .. }
            | LValue::Field { span, .. }
            | LValue::ArrayElem { span, .. } => *span,
        }
    }
}

// -----------------------------------------------------------------------------
// SYNTAX TREE DUMP (-S)
// -----------------------------------------------------------------------------

impl Program {
    /// Writes the syntax tree as indented text, one node per line.
    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for item in &self.items {
            match item {
                Item::Begin { body, .. } => {
                    writeln!(out, "BEGIN")?;
                    dump_stmts(out, body, 1)?;
                }
                Item::End { body, .. } => {
                    writeln!(out, "END")?;
                    dump_stmts(out, body, 1)?;
                }
                Item::Rule { pattern, action, .. } => {
                    match pattern {
                        None => writeln!(out, "rule <always>")?,
                        Some(Pattern::Expr(e)) => writeln!(out, "rule {}", expr_brief(e))?,
                        Some(Pattern::Range(a, b)) => {
                            writeln!(out, "rule range {}, {}", expr_brief(a), expr_brief(b))?
                        }
                    }
                    match action {
                        Some(body) => dump_stmts(out, body, 1)?,
                        None => writeln!(out, "  <print $0>")?,
                    }
                }
                Item::Function(decl) => {
                    writeln!(out, "function {}({})", decl.name, decl.params.join(", "))?;
                    dump_stmts(out, &decl.body, 1)?;
                }
            }
        }
        Ok(())
    }
}

fn dump_stmts(out: &mut dyn Write, stmts: &[Stmt], depth: usize) -> std::io::Result<()> {
    for stmt in stmts {
        dump_stmt(out, stmt, depth)?;
    }
    Ok(())
}

fn dump_stmt(out: &mut dyn Write, stmt: &Stmt, depth: usize) -> std::io::Result<()> {
    let pad = "  ".repeat(depth);
    match stmt {
        Stmt::Expr { expr, .. } => writeln!(out, "{}expr {}", pad, expr_brief(expr)),
        Stmt::Print { args, redirect, .. } => {
            writeln!(out, "{}print/{}{}", pad, args.len(), redirect_brief(redirect))
        }
        Stmt::Printf { args, redirect, .. } => {
            writeln!(out, "{}printf/{}{}", pad, args.len(), redirect_brief(redirect))
        }
        Stmt::If {
            condition,
            then_branch,
            else_branch,
            ..
        } => {
            writeln!(out, "{}if {}", pad, expr_brief(condition))?;
            dump_stmt(out, then_branch, depth + 1)?;
            if let Some(else_branch) = else_branch {
                writeln!(out, "{}else", pad)?;
                dump_stmt(out, else_branch, depth + 1)?;
            }
            Ok(())
        }
        Stmt::While { condition, body, .. } => {
            writeln!(out, "{}while {}", pad, expr_brief(condition))?;
            dump_stmt(out, body, depth + 1)
        }
        Stmt::DoWhile { body, condition, .. } => {
            writeln!(out, "{}do-while {}", pad, expr_brief(condition))?;
            dump_stmt(out, body, depth + 1)
        }
        Stmt::For { body, .. } => {
            writeln!(out, "{}for", pad)?;
            dump_stmt(out, body, depth + 1)
        }
        Stmt::ForIn { var, array, body, .. } => {
            writeln!(out, "{}for ({} in {})", pad, var, array)?;
            dump_stmt(out, body, depth + 1)
        }
        Stmt::Block { stmts, .. } => {
            writeln!(out, "{}block", pad)?;
            dump_stmts(out, stmts, depth + 1)
        }
        Stmt::Break { .. } => writeln!(out, "{}break", pad),
        Stmt::Continue { .. } => writeln!(out, "{}continue", pad),
        Stmt::Next { .. } => writeln!(out, "{}next", pad),
        Stmt::NextFile { .. } => writeln!(out, "{}nextfile", pad),
        Stmt::Exit { code, .. } => writeln!(
            out,
            "{}exit{}",
            pad,
            code.as_ref()
                .map(|e| format!(" {}", expr_brief(e)))
                .unwrap_or_default()
        ),
        Stmt::Return { value, .. } => writeln!(
            out,
            "{}return{}",
            pad,
            value
                .as_ref()
                .map(|e| format!(" {}", expr_brief(e)))
                .unwrap_or_default()
        ),
        Stmt::Delete {
            array, subscripts, ..
        } => {
            if subscripts.is_empty() {
                writeln!(out, "{}delete {}", pad, array)
            } else {
                writeln!(out, "{}delete {}[{} subscripts]", pad, array, subscripts.len())
            }
        }
    }
}

fn redirect_brief(redirect: &Option<(OutputRedirect, Box<Expr>)>) -> &'static str {
    match redirect {
        None => "",
        Some((OutputRedirect::Truncate, _)) => " > file",
        Some((OutputRedirect::Append, _)) => " >> file",
        Some((OutputRedirect::Pipe, _)) => " | cmd",
        Some((OutputRedirect::TwoWayPipe, _)) => " |& cmd",
    }
}

/// One-line summary of an expression for the tree dump.
fn expr_brief(expr: &Expr) -> String {
    match expr {
        Expr::Int { value, .. } => value.to_string(),
        Expr::Double { value, .. } => value.to_string(),
        Expr::Str { value, .. } => format!("{:?}", value),
        Expr::Ere { pattern, .. } => format!("/{}/", pattern),
        Expr::Var { name, .. } => name.clone(),
        Expr::Field { index, .. } => format!("${}", expr_brief(index)),
        Expr::ArrayElem { array, .. } => format!("{}[..]", array),
        Expr::Assign { target, .. } => format!("{} = ..", lvalue_brief(target)),
        Expr::CompoundAssign { target, op, .. } => {
            format!("{} {:?}= ..", lvalue_brief(target), op)
        }
        Expr::Binary { op, .. } => format!("({:?})", op),
        Expr::Unary { op, .. } => format!("({:?})", op),
        Expr::Ternary { .. } => "(?:)".to_string(),
        Expr::Match { negate, .. } => if *negate { "(!~)" } else { "(~)" }.to_string(),
        Expr::In { array, .. } => format!("(in {})", array),
        Expr::Concat { .. } => "(concat)".to_string(),
        Expr::IncDec { op, postfix, .. } => format!("({:?} postfix={})", op, postfix),
        Expr::Call { name, args, .. } => format!("{}({} args)", name, args.len()),
        Expr::BuiltinCall { builtin, args, .. } => {
            format!("{}({} args)", builtin.name(), args.len())
        }
        Expr::ExtensionCall { keyword, args, .. } => {
            format!("@{}({} args)", keyword, args.len())
        }
        Expr::Getline { .. } => "getline".to_string(),
        Expr::Grouping { exprs, .. } => format!("({} grouped)", exprs.len()),
    }
}

fn lvalue_brief(lvalue: &LValue) -> String {
    match lvalue {
        LValue::Var { name, .. } => name.clone(),
        LValue::Field { index, .. } => format!("${}", expr_brief(index)),
        LValue::ArrayElem { array, .. } => format!("{}[..]", array),
    }
}
