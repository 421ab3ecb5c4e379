use crate::ast::*;
use crate::error::{AwkError, AwkResult, Span};
use crate::token::{Token, TokenKind};

use rustc_hash::FxHashMap;

/// Operator precedence, low to high, following the POSIX AWK table.
/// Concatenation sits between the relational operators and addition;
/// `^` binds tighter than unary minus; `$` tighter than `++`/`--`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None = 0,
    Assignment = 1, // = += -= *= /= %= ^=
    Ternary = 2,    // ?:
    Or = 3,         // ||
    And = 4,        // &&
    In = 5,         // in
    Match = 6,      // ~ !~  (and `cmd | getline`)
    Comparison = 7, // < <= > >= != ==
    Concat = 8,     // juxtaposition
    Term = 9,       // + -
    Factor = 10,    // * / %
    Unary = 11,     // ! - +
    Power = 12,     // ^
    IncDec = 13,    // ++ -- (postfix)
    Field = 14,     // $
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    /// Registered extension keywords with their accepted arity range.
    ext_keywords: FxHashMap<String, (usize, usize)>,
    /// Inside unparenthesised `print`/`printf` arguments, where `>` and
    /// `|` are redirections rather than operators.
    in_print: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            ext_keywords: FxHashMap::default(),
            in_print: false,
        }
    }

    /// Registers extension keywords so calls to them parse with their
    /// declared arity.
    pub fn with_extension_keywords(mut self, keywords: FxHashMap<String, (usize, usize)>) -> Self {
        self.ext_keywords = keywords;
        self
    }

    // -------------------------------------------------------------------------
    // PROGRAM STRUCTURE
    // -------------------------------------------------------------------------

    /// Parses the whole token stream into a `Program`.
    pub fn parse(&mut self) -> AwkResult<Program> {
        let mut items = Vec::new();
        loop {
            self.skip_terminators();
            if self.is_at_end() {
                break;
            }
            items.push(self.parse_item()?);
        }
        Ok(Program { items })
    }

    fn parse_item(&mut self) -> AwkResult<Item> {
        match self.peek_kind() {
            TokenKind::Begin => {
                let span = self.advance().span;
                self.skip_newlines();
                let body = self.parse_action()?;
                Ok(Item::Begin { body, span })
            }
            TokenKind::End => {
                let span = self.advance().span;
                self.skip_newlines();
                let body = self.parse_action()?;
                Ok(Item::End { body, span })
            }
            TokenKind::Function => Ok(Item::Function(self.parse_function()?)),
            TokenKind::LBrace => {
                let span = self.peek().span;
                let body = self.parse_action()?;
                Ok(Item::Rule {
                    pattern: None,
                    action: Some(body),
                    span,
                })
            }
            _ => {
                let span = self.peek().span;
                let pattern = self.parse_pattern()?;
                let action = if self.check_kind(&TokenKind::LBrace) {
                    Some(self.parse_action()?)
                } else {
                    None
                };
                Ok(Item::Rule {
                    pattern: Some(pattern),
                    action,
                    span,
                })
            }
        }
    }

    fn parse_pattern(&mut self) -> AwkResult<Pattern> {
        let start = self.expression()?;
        if self.match_kind(&TokenKind::Comma) {
            self.skip_newlines();
            let end = self.expression()?;
            Ok(Pattern::Range(start, end))
        } else {
            Ok(Pattern::Expr(start))
        }
    }

    fn parse_function(&mut self) -> AwkResult<FunctionDecl> {
        let span = self.advance().span; // consume 'function'
        let name = match self.peek_kind().clone() {
            TokenKind::FuncName(name) | TokenKind::Ident(name) => {
                self.advance();
                name
            }
            _ => {
                return Err(AwkError::parser(
                    "expected function name",
                    self.peek().span,
                ));
            }
        };
        self.expect_kind(&TokenKind::LParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check_kind(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident("expected parameter name")?);
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.expect_kind(&TokenKind::RParen, "expected ')' after parameters")?;
        self.skip_newlines();
        let body = self.parse_action()?;
        Ok(FunctionDecl {
            name,
            params,
            body,
            span,
        })
    }

    /// Parses a brace-delimited statement list.
    fn parse_action(&mut self) -> AwkResult<Vec<Stmt>> {
        self.expect_kind(&TokenKind::LBrace, "expected '{'")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if self.check_kind(&TokenKind::RBrace) || self.is_at_end() {
                break;
            }
            stmts.push(self.parse_statement()?);
        }
        self.expect_kind(&TokenKind::RBrace, "expected '}'")?;
        Ok(stmts)
    }

    // -------------------------------------------------------------------------
    // STATEMENTS
    // -------------------------------------------------------------------------

    fn parse_statement(&mut self) -> AwkResult<Stmt> {
        match self.peek_kind() {
            TokenKind::LBrace => {
                let span = self.peek().span;
                let stmts = self.parse_action()?;
                Ok(Stmt::Block { stmts, span })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                let span = self.advance().span;
                self.expect_terminator()?;
                Ok(Stmt::Break { span })
            }
            TokenKind::Continue => {
                let span = self.advance().span;
                self.expect_terminator()?;
                Ok(Stmt::Continue { span })
            }
            TokenKind::Next => {
                let span = self.advance().span;
                self.expect_terminator()?;
                Ok(Stmt::Next { span })
            }
            TokenKind::NextFile => {
                let span = self.advance().span;
                self.expect_terminator()?;
                Ok(Stmt::NextFile { span })
            }
            TokenKind::Exit => {
                let span = self.advance().span;
                let code = if self.starts_expression() {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect_terminator()?;
                Ok(Stmt::Exit { code, span })
            }
            TokenKind::Return => {
                let span = self.advance().span;
                let value = if self.starts_expression() {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect_terminator()?;
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Delete => self.parse_delete(),
            TokenKind::Print => self.parse_print(false),
            TokenKind::Printf => self.parse_print(true),
            TokenKind::Semicolon => {
                // empty statement
                let span = self.advance().span;
                Ok(Stmt::Block {
                    stmts: Vec::new(),
                    span,
                })
            }
            _ => {
                let expr = self.expression()?;
                let span = expr.span();
                self.expect_terminator()?;
                Ok(Stmt::Expr { expr, span })
            }
        }
    }

    fn parse_if(&mut self) -> AwkResult<Stmt> {
        let span = self.advance().span; // consume 'if'
        self.expect_kind(&TokenKind::LParen, "expected '(' after 'if'")?;
        let condition = self.paren_expression()?;
        self.expect_kind(&TokenKind::RParen, "expected ')' after condition")?;
        self.skip_newlines();
        let then_branch = Box::new(self.parse_statement()?);

        let else_branch = if self.check_else_ahead() {
            self.skip_terminators();
            self.advance(); // consume 'else'
            self.skip_newlines();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            span,
        })
    }

    fn parse_while(&mut self) -> AwkResult<Stmt> {
        let span = self.advance().span; // consume 'while'
        self.expect_kind(&TokenKind::LParen, "expected '(' after 'while'")?;
        let condition = self.paren_expression()?;
        self.expect_kind(&TokenKind::RParen, "expected ')' after condition")?;
        self.skip_newlines();
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While {
            condition,
            body,
            span,
        })
    }

    fn parse_do_while(&mut self) -> AwkResult<Stmt> {
        let span = self.advance().span; // consume 'do'
        let body = Box::new(self.parse_statement()?);
        self.skip_terminators();
        self.expect_kind(&TokenKind::While, "expected 'while' after 'do' body")?;
        self.expect_kind(&TokenKind::LParen, "expected '(' after 'while'")?;
        let condition = self.paren_expression()?;
        self.expect_kind(&TokenKind::RParen, "expected ')' after condition")?;
        self.expect_terminator()?;
        Ok(Stmt::DoWhile {
            body,
            condition,
            span,
        })
    }

    fn parse_for(&mut self) -> AwkResult<Stmt> {
        let span = self.advance().span; // consume 'for'
        self.expect_kind(&TokenKind::LParen, "expected '(' after 'for'")?;

        // for (var in array)
        if let TokenKind::Ident(var) = self.peek_kind().clone() {
            if matches!(self.peek_ahead(1).kind, TokenKind::In) {
                self.advance();
                self.advance();
                let array = self.expect_ident("expected array name after 'in'")?;
                self.expect_kind(&TokenKind::RParen, "expected ')' after array name")?;
                self.skip_newlines();
                let body = Box::new(self.parse_statement()?);
                return Ok(Stmt::ForIn {
                    var,
                    array,
                    body,
                    span,
                });
            }
        }

        let init = if self.check_kind(&TokenKind::Semicolon) {
            None
        } else {
            let expr = self.paren_expression()?;
            let s = expr.span();
            Some(Box::new(Stmt::Expr { expr, span: s }))
        };
        self.expect_kind(&TokenKind::Semicolon, "expected ';' in 'for'")?;
        self.skip_newlines();

        let condition = if self.check_kind(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.paren_expression()?)
        };
        self.expect_kind(&TokenKind::Semicolon, "expected ';' in 'for'")?;
        self.skip_newlines();

        let update = if self.check_kind(&TokenKind::RParen) {
            None
        } else {
            let expr = self.paren_expression()?;
            let s = expr.span();
            Some(Box::new(Stmt::Expr { expr, span: s }))
        };
        self.expect_kind(&TokenKind::RParen, "expected ')' after 'for' clauses")?;
        self.skip_newlines();

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            condition,
            update,
            body,
            span,
        })
    }

    fn parse_delete(&mut self) -> AwkResult<Stmt> {
        let span = self.advance().span; // consume 'delete'
        let array = self.expect_ident("expected array name after 'delete'")?;
        let mut subscripts = Vec::new();
        if self.match_kind(&TokenKind::LBracket) {
            loop {
                subscripts.push(self.expression()?);
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.expect_kind(&TokenKind::RBracket, "expected ']' after subscripts")?;
        }
        self.expect_terminator()?;
        Ok(Stmt::Delete {
            array,
            subscripts,
            span,
        })
    }

    /// Parses `print` or `printf`, including the argument-position
    /// redirection forms `> >> | |&`.
    fn parse_print(&mut self, is_printf: bool) -> AwkResult<Stmt> {
        let span = self.advance().span;

        let mut args = Vec::new();
        if self.starts_expression() {
            let saved = self.in_print;
            self.in_print = true;
            let result: AwkResult<()> = (|| {
                loop {
                    args.push(self.expression()?);
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                Ok(())
            })();
            self.in_print = saved;
            result?;
        }

        // `print (a, b)` is a parenthesised argument list.
        if args.len() == 1 {
            if let Expr::Grouping { exprs, .. } = &args[0] {
                if exprs.len() > 1 {
                    args = exprs.clone();
                }
            }
        }

        if is_printf && args.is_empty() {
            return Err(AwkError::parser("printf requires a format string", span));
        }

        let redirect = match self.peek_kind() {
            TokenKind::Gt => {
                self.advance();
                Some((OutputRedirect::Truncate, Box::new(self.redirect_target()?)))
            }
            TokenKind::Append => {
                self.advance();
                Some((OutputRedirect::Append, Box::new(self.redirect_target()?)))
            }
            TokenKind::Pipe => {
                self.advance();
                Some((OutputRedirect::Pipe, Box::new(self.redirect_target()?)))
            }
            TokenKind::PipeAmp => {
                self.advance();
                Some((OutputRedirect::TwoWayPipe, Box::new(self.redirect_target()?)))
            }
            _ => None,
        };
        self.expect_terminator()?;

        if is_printf {
            Ok(Stmt::Printf {
                args,
                redirect,
                span,
            })
        } else {
            Ok(Stmt::Print {
                args,
                redirect,
                span,
            })
        }
    }

    /// The filename or command of a redirection, parsed at concatenation
    /// level so `> dir "/" name` works.
    fn redirect_target(&mut self) -> AwkResult<Expr> {
        let saved = self.in_print;
        self.in_print = false;
        let expr = self.parse_precedence(Precedence::Concat);
        self.in_print = saved;
        expr
    }

    // -------------------------------------------------------------------------
    // EXPRESSIONS
    // -------------------------------------------------------------------------

    fn expression(&mut self) -> AwkResult<Expr> {
        self.parse_precedence(Precedence::Assignment)
    }

    /// An expression inside parentheses, where `>` and `|` regain their
    /// operator meaning even within print arguments.
    fn paren_expression(&mut self) -> AwkResult<Expr> {
        let saved = self.in_print;
        self.in_print = false;
        let expr = self.expression();
        self.in_print = saved;
        expr
    }

    fn parse_precedence(&mut self, min_prec: Precedence) -> AwkResult<Expr> {
        let mut left = self.parse_prefix()?;

        loop {
            if self.is_at_end() {
                break;
            }

            let prec = self.get_infix_precedence();
            if prec < min_prec {
                break;
            }

            left = self.parse_infix(left, prec)?;
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> AwkResult<Expr> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_precedence(Precedence::Unary)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                    span: token.span,
                })
            }
            TokenKind::Plus => {
                self.advance();
                let operand = self.parse_precedence(Precedence::Unary)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Pos,
                    operand: Box::new(operand),
                    span: token.span,
                })
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_precedence(Precedence::Unary)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                    span: token.span,
                })
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if token.kind == TokenKind::PlusPlus {
                    IncDecOp::Inc
                } else {
                    IncDecOp::Dec
                };
                self.advance();
                let operand = self.parse_precedence(Precedence::Field)?;
                let target = self.expr_to_lvalue(operand)?;
                Ok(Expr::IncDec {
                    target,
                    op,
                    postfix: false,
                    span: token.span,
                })
            }
            TokenKind::Dollar => {
                self.advance();
                let index = self.parse_precedence(Precedence::Field)?;
                Ok(Expr::Field {
                    index: Box::new(index),
                    span: token.span,
                })
            }

            TokenKind::Int(value) => {
                let value = *value;
                self.advance();
                Ok(Expr::Int {
                    value,
                    span: token.span,
                })
            }
            TokenKind::Double(value) => {
                let value = *value;
                self.advance();
                Ok(Expr::Double {
                    value,
                    span: token.span,
                })
            }
            TokenKind::Str(value) => {
                let value = value.clone();
                self.advance();
                Ok(Expr::Str {
                    value,
                    span: token.span,
                })
            }
            TokenKind::Ere(pattern) => {
                let pattern = pattern.clone();
                self.advance();
                Ok(Expr::Ere {
                    pattern,
                    span: token.span,
                })
            }

            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                if self.check_kind(&TokenKind::LBracket) {
                    self.advance();
                    let mut subscripts = Vec::new();
                    loop {
                        subscripts.push(self.expression()?);
                        if !self.match_kind(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    self.expect_kind(&TokenKind::RBracket, "expected ']' after subscripts")?;
                    Ok(Expr::ArrayElem {
                        array: name,
                        subscripts,
                        span: token.span,
                    })
                } else {
                    Ok(Expr::Var {
                        name,
                        span: token.span,
                    })
                }
            }

            TokenKind::FuncName(name) => {
                let name = name.clone();
                self.advance();
                self.expect_kind(&TokenKind::LParen, "expected '(' after function name")?;
                let args = self.parse_arg_list()?;
                if let Some(&(min, max)) = self.ext_keywords.get(&name) {
                    if args.len() < min || args.len() > max {
                        return Err(AwkError::parser(
                            format!(
                                "extension '{}' expects {} to {} arguments, got {}",
                                name,
                                min,
                                max,
                                args.len()
                            ),
                            token.span,
                        ));
                    }
                    return Ok(Expr::ExtensionCall {
                        keyword: name,
                        args,
                        span: token.span,
                    });
                }
                Ok(Expr::Call {
                    name,
                    args,
                    resolved: None,
                    span: token.span,
                })
            }

            TokenKind::Builtin(builtin) => {
                let builtin = *builtin;
                self.advance();
                let args = if self.check_kind(&TokenKind::LParen) {
                    self.advance();
                    self.parse_arg_list()?
                } else {
                    // `length` and friends may appear without parens.
                    Vec::new()
                };
                let (min, max) = builtin.arity();
                if args.len() < min || args.len() > max {
                    return Err(AwkError::parser(
                        format!(
                            "{} expects {} to {} arguments, got {}",
                            builtin.name(),
                            min,
                            max,
                            args.len()
                        ),
                        token.span,
                    ));
                }
                Ok(Expr::BuiltinCall {
                    builtin,
                    args,
                    span: token.span,
                })
            }

            TokenKind::Getline => {
                self.advance();
                self.parse_getline(None, token.span)
            }

            TokenKind::LParen => {
                self.advance();
                let saved = self.in_print;
                self.in_print = false;
                let result: AwkResult<Vec<Expr>> = (|| {
                    let mut exprs = vec![self.expression()?];
                    while self.match_kind(&TokenKind::Comma) {
                        self.skip_newlines();
                        exprs.push(self.expression()?);
                    }
                    self.expect_kind(&TokenKind::RParen, "expected ')'")?;
                    Ok(exprs)
                })();
                self.in_print = saved;
                let mut exprs = result?;
                if exprs.len() == 1 {
                    Ok(exprs.pop().expect("non-empty group"))
                } else {
                    Ok(Expr::Grouping {
                        exprs,
                        span: token.span,
                    })
                }
            }

            _ => Err(AwkError::parser(
                format!("unexpected token: {:?}", token.kind),
                token.span,
            )),
        }
    }

    fn parse_infix(&mut self, left: Expr, prec: Precedence) -> AwkResult<Expr> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Eq => {
                self.advance();
                let target = self.expr_to_lvalue(left)?;
                let value = self.parse_precedence(Precedence::Assignment)?;
                Ok(Expr::Assign {
                    target,
                    value: Box::new(value),
                    span: token.span,
                })
            }

            TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::StarEq
            | TokenKind::SlashEq
            | TokenKind::PercentEq
            | TokenKind::CaretEq => {
                let op = match token.kind {
                    TokenKind::PlusEq => BinOp::Add,
                    TokenKind::MinusEq => BinOp::Sub,
                    TokenKind::StarEq => BinOp::Mul,
                    TokenKind::SlashEq => BinOp::Div,
                    TokenKind::PercentEq => BinOp::Mod,
                    TokenKind::CaretEq => BinOp::Pow,
                    _ => unreachable!(),
                };
                self.advance();
                let target = self.expr_to_lvalue(left)?;
                let value = self.parse_precedence(Precedence::Assignment)?;
                Ok(Expr::CompoundAssign {
                    target,
                    op,
                    value: Box::new(value),
                    span: token.span,
                })
            }

            TokenKind::Question => {
                self.advance();
                self.skip_newlines();
                let then_expr = self.parse_precedence(Precedence::Assignment)?;
                self.skip_newlines();
                self.expect_kind(&TokenKind::Colon, "expected ':' in conditional")?;
                self.skip_newlines();
                let else_expr = self.parse_precedence(Precedence::Ternary)?;
                Ok(Expr::Ternary {
                    condition: Box::new(left),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                    span: token.span,
                })
            }

            TokenKind::PipePipe => {
                self.advance();
                self.skip_newlines();
                let right = self.parse_precedence(Precedence::And)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op: BinOp::Or,
                    right: Box::new(right),
                    span: token.span,
                })
            }
            TokenKind::AmpAmp => {
                self.advance();
                self.skip_newlines();
                let right = self.parse_precedence(Precedence::In)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op: BinOp::And,
                    right: Box::new(right),
                    span: token.span,
                })
            }

            TokenKind::In => {
                self.advance();
                let array = self.expect_ident("expected array name after 'in'")?;
                let subscripts = match left {
                    Expr::Grouping { exprs, .. } => exprs,
                    other => vec![other],
                };
                Ok(Expr::In {
                    subscripts,
                    array,
                    span: token.span,
                })
            }

            TokenKind::Tilde | TokenKind::BangTilde => {
                let negate = token.kind == TokenKind::BangTilde;
                self.advance();
                let pattern = self.parse_precedence(Precedence::Comparison)?;
                Ok(Expr::Match {
                    left: Box::new(left),
                    pattern: Box::new(pattern),
                    negate,
                    span: token.span,
                })
            }

            TokenKind::Pipe | TokenKind::PipeAmp => {
                // `cmd | getline [lvalue]`
                self.advance();
                let getline_span = self.peek().span;
                self.expect_kind(&TokenKind::Getline, "expected 'getline' after '|'")?;
                self.parse_getline(Some(left), getline_span)
            }

            TokenKind::Lt
            | TokenKind::LtEq
            | TokenKind::Gt
            | TokenKind::GtEq
            | TokenKind::EqEq
            | TokenKind::BangEq => {
                let op = match token.kind {
                    TokenKind::Lt => BinOp::Lt,
                    TokenKind::LtEq => BinOp::Le,
                    TokenKind::Gt => BinOp::Gt,
                    TokenKind::GtEq => BinOp::Ge,
                    TokenKind::EqEq => BinOp::Eq,
                    TokenKind::BangEq => BinOp::Ne,
                    _ => unreachable!(),
                };
                self.advance();
                let right = self.parse_precedence(Precedence::Concat)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                    span: token.span,
                })
            }

            TokenKind::Plus | TokenKind::Minus => {
                let op = if token.kind == TokenKind::Plus {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                self.advance();
                let right = self.parse_precedence(Precedence::Factor)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                    span: token.span,
                })
            }

            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
                let op = match token.kind {
                    TokenKind::Star => BinOp::Mul,
                    TokenKind::Slash => BinOp::Div,
                    TokenKind::Percent => BinOp::Mod,
                    _ => unreachable!(),
                };
                self.advance();
                let right = self.parse_precedence(Precedence::Unary)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                    span: token.span,
                })
            }

            TokenKind::Caret => {
                self.advance();
                // right-associative
                let right = self.parse_precedence(Precedence::Power)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op: BinOp::Pow,
                    right: Box::new(right),
                    span: token.span,
                })
            }

            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if token.kind == TokenKind::PlusPlus {
                    IncDecOp::Inc
                } else {
                    IncDecOp::Dec
                };
                self.advance();
                let target = self.expr_to_lvalue(left)?;
                Ok(Expr::IncDec {
                    target,
                    op,
                    postfix: true,
                    span: token.span,
                })
            }

            _ => {
                debug_assert!(prec >= Precedence::Concat);
                // Juxtaposition: string concatenation.
                let right = self.parse_precedence(Precedence::Term)?;
                let span = left.span();
                Ok(Expr::Concat {
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                })
            }
        }
    }

    fn get_infix_precedence(&self) -> Precedence {
        match self.peek_kind() {
            TokenKind::Eq
            | TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::StarEq
            | TokenKind::SlashEq
            | TokenKind::PercentEq
            | TokenKind::CaretEq => Precedence::Assignment,
            TokenKind::Question => Precedence::Ternary,
            TokenKind::PipePipe => Precedence::Or,
            TokenKind::AmpAmp => Precedence::And,
            TokenKind::In => Precedence::In,
            TokenKind::Tilde | TokenKind::BangTilde => Precedence::Match,
            TokenKind::Pipe | TokenKind::PipeAmp => {
                // Only meaningful before `getline`; a redirection in print
                // context ends the expression instead.
                if self.in_print {
                    Precedence::None
                } else if matches!(self.peek_ahead(1).kind, TokenKind::Getline) {
                    Precedence::Match
                } else {
                    Precedence::None
                }
            }
            TokenKind::Gt => {
                if self.in_print {
                    Precedence::None
                } else {
                    Precedence::Comparison
                }
            }
            TokenKind::Append => Precedence::None,
            TokenKind::Lt
            | TokenKind::LtEq
            | TokenKind::GtEq
            | TokenKind::EqEq
            | TokenKind::BangEq => Precedence::Comparison,
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
            TokenKind::Caret => Precedence::Power,
            TokenKind::PlusPlus | TokenKind::MinusMinus => Precedence::IncDec,
            // Concatenation by juxtaposition: anything that can begin an
            // expression continues one.
            TokenKind::Int(_)
            | TokenKind::Double(_)
            | TokenKind::Str(_)
            | TokenKind::Ere(_)
            | TokenKind::Ident(_)
            | TokenKind::FuncName(_)
            | TokenKind::Builtin(_)
            | TokenKind::Dollar
            | TokenKind::Bang
            | TokenKind::LParen => Precedence::Concat,
            _ => Precedence::None,
        }
    }

    /// Parses the tail of a `getline` after the keyword: an optional
    /// lvalue target, then an optional `< file` source. `command` is the
    /// left side of a `cmd | getline` form.
    fn parse_getline(&mut self, command: Option<Expr>, span: Span) -> AwkResult<Expr> {
        let target = self.parse_optional_lvalue()?;

        let source = if let Some(cmd) = command {
            GetlineSrc::Command(Box::new(cmd))
        } else if self.check_kind(&TokenKind::Lt) {
            self.advance();
            let file = self.parse_precedence(Precedence::Concat)?;
            GetlineSrc::File(Box::new(file))
        } else {
            GetlineSrc::CurrentInput
        };

        Ok(Expr::Getline {
            source,
            target,
            span,
        })
    }

    /// Parses an lvalue if the next tokens form one, for getline targets.
    fn parse_optional_lvalue(&mut self) -> AwkResult<Option<LValue>> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                if self.check_kind(&TokenKind::LBracket) {
                    self.advance();
                    let mut subscripts = Vec::new();
                    loop {
                        subscripts.push(self.expression()?);
                        if !self.match_kind(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    self.expect_kind(&TokenKind::RBracket, "expected ']' after subscripts")?;
                    Ok(Some(LValue::ArrayElem {
                        array: name,
                        subscripts,
                        span,
                    }))
                } else {
                    Ok(Some(LValue::Var { name, span }))
                }
            }
            TokenKind::Dollar => {
                let span = self.advance().span;
                let index = self.parse_precedence(Precedence::Field)?;
                Ok(Some(LValue::Field {
                    index: Box::new(index),
                    span,
                }))
            }
            _ => Ok(None),
        }
    }

    fn parse_arg_list(&mut self) -> AwkResult<Vec<Expr>> {
        let saved = self.in_print;
        self.in_print = false;
        let result: AwkResult<Vec<Expr>> = (|| {
            let mut args = Vec::new();
            if !self.check_kind(&TokenKind::RParen) {
                loop {
                    args.push(self.expression()?);
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
            }
            self.expect_kind(&TokenKind::RParen, "expected ')' after arguments")?;
            Ok(args)
        })();
        self.in_print = saved;
        result
    }

    /// Reinterprets a parsed expression as an assignment target.
    fn expr_to_lvalue(&self, expr: Expr) -> AwkResult<LValue> {
        match expr {
            Expr::Var { name, span } => Ok(LValue::Var { name, span }),
            Expr::Field { index, span } => Ok(LValue::Field { index, span }),
            Expr::ArrayElem {
                array,
                subscripts,
                span,
            } => Ok(LValue::ArrayElem {
                array,
                subscripts,
                span,
            }),
            other => Err(AwkError::parser(
                "expected a variable, field, or array element",
                other.span(),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // TOKEN PLUMBING
    // -------------------------------------------------------------------------

    #[inline]
    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    #[inline]
    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.current].kind
    }

    /// The token `n` positions ahead, clamped to Eof.
    fn peek_ahead(&self, n: usize) -> &Token {
        let idx = (self.current + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    #[inline]
    fn advance(&mut self) -> Token {
        let token = self.tokens[self.current].clone();
        if !self.is_at_end() {
            self.current += 1;
        }
        token
    }

    #[inline]
    fn is_at_end(&self) -> bool {
        matches!(self.tokens[self.current].kind, TokenKind::Eof)
    }

    fn check_kind(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check_kind(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kind(&mut self, kind: &TokenKind, msg: &str) -> AwkResult<Token> {
        if self.check_kind(kind) {
            Ok(self.advance())
        } else {
            Err(AwkError::parser(
                format!("{}, got {:?}", msg, self.peek_kind()),
                self.peek().span,
            ))
        }
    }

    fn expect_ident(&mut self, msg: &str) -> AwkResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(AwkError::parser(
                format!("{}, got {:?}", msg, other),
                self.peek().span,
            )),
        }
    }

    /// Consumes newlines only.
    fn skip_newlines(&mut self) {
        while self.check_kind(&TokenKind::Newline) {
            self.advance();
        }
    }

    /// Consumes newlines and semicolons between statements and items.
    fn skip_terminators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// A statement terminator: newline, semicolon, or a closing brace /
    /// end of input left in place for the caller.
    fn expect_terminator(&mut self) -> AwkResult<()> {
        match self.peek_kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            other => Err(AwkError::parser(
                format!("expected end of statement, got {:?}", other),
                self.peek().span,
            )),
        }
    }

    /// Looks past newlines for an `else` belonging to the current `if`.
    fn check_else_ahead(&self) -> bool {
        let mut idx = self.current;
        while idx < self.tokens.len() {
            match &self.tokens[idx].kind {
                TokenKind::Newline | TokenKind::Semicolon => idx += 1,
                TokenKind::Else => return true,
                _ => return false,
            }
        }
        false
    }

    /// True when the current token can begin an expression.
    fn starts_expression(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Int(_)
                | TokenKind::Double(_)
                | TokenKind::Str(_)
                | TokenKind::Ere(_)
                | TokenKind::Ident(_)
                | TokenKind::FuncName(_)
                | TokenKind::Builtin(_)
                | TokenKind::Dollar
                | TokenKind::Bang
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::PlusPlus
                | TokenKind::MinusMinus
                | TokenKind::LParen
                | TokenKind::Getline
        )
    }
}
