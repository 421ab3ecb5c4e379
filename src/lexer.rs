//! # Lexer Module
//!
//! Hand-written tokenizer for AWK source text. Operates directly on bytes
//! and uses `memchr` to skip comments quickly. Produces a flat `Vec<Token>`
//! consumed by the parser.
//!
//! ## Key Features
//! - Newlines are tokens: they terminate statements unless the previous
//!   token is one of `|| && ? : , do else { ;` or an open paren/bracket,
//!   in which case the lexer swallows them.
//! - `/` starts an ERE literal iff the previous significant token cannot
//!   terminate an expression; otherwise it is division.
//! - String escapes follow the interpreter's exact rules: one to three
//!   octal digits, one to two hex digits after `\x` (a bare `\x` is a
//!   literal `x`), and unknown escapes keep their backslash.
//! - An identifier directly followed by `(` becomes a `FuncName` token so
//!   the parser can tell calls from concatenation.

use crate::error::{AwkError, AwkResult, Span};
use crate::token::{
    lookup_builtin, lookup_cast_builtin, lookup_extra_builtin, lookup_keyword, Token, TokenKind,
};

// -----------------------------------------------------------------------------
// LEXER STATE
// -----------------------------------------------------------------------------

/// The AWK lexer. Converts source bytes into a token stream.
pub struct Lexer<'src> {
    /// Source bytes being tokenized.
    source: &'src [u8],
    /// Current byte offset into `source`.
    pos: usize,
    /// Current 1-based line number.
    line: u32,
    /// Current 1-based column number.
    col: u32,
    /// Kind of the last emitted token, for `/` disambiguation and
    /// newline suppression. `None` at start of input.
    prev: Option<TokenKind>,
    /// Recognise `_sleep`, `_dump`, `exec` as builtins (-x).
    extra_keywords: bool,
    /// Recognise `_INTEGER`, `_DOUBLE`, `_STRING` as builtins (-y).
    cast_keywords: bool,
}

impl<'src> Lexer<'src> {
    /// Creates a new lexer for the given source string.
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            prev: None,
            extra_keywords: false,
            cast_keywords: false,
        }
    }

    /// Enables the `-x` / `-y` keyword groups.
    pub fn with_keyword_groups(mut self, extra: bool, cast: bool) -> Self {
        self.extra_keywords = extra;
        self.cast_keywords = cast;
        self
    }

    /// Tokenizes the entire source, returning all tokens including a
    /// trailing `Eof` token.
    ///
    /// # Errors
    /// Returns an `AwkError` of the Lexer kind on unterminated strings or
    /// regexes, truncated escapes, and stray characters.
    pub fn tokenize(&mut self) -> AwkResult<Vec<Token>> {
        let mut tokens = Vec::with_capacity(self.source.len() / 4);

        loop {
            self.skip_blanks_and_comments();

            if self.is_at_end() {
                tokens.push(Token::new(
                    TokenKind::Eof,
                    Span::new(self.line, self.col, 0),
                ));
                break;
            }

            let token = self.scan_token()?;

            // Statement-continuation rule: a newline is not significant
            // after tokens that cannot end a statement.
            if token.kind == TokenKind::Newline && self.newline_suppressed() {
                continue;
            }

            self.prev = Some(token.kind.clone());
            tokens.push(token);
        }

        Ok(tokens)
    }

    /// True when a newline token should be swallowed given the previous
    /// significant token.
    fn newline_suppressed(&self) -> bool {
        match &self.prev {
            None => true,
            Some(kind) => matches!(
                kind,
                TokenKind::PipePipe
                    | TokenKind::AmpAmp
                    | TokenKind::Question
                    | TokenKind::Colon
                    | TokenKind::Comma
                    | TokenKind::Do
                    | TokenKind::Else
                    | TokenKind::LBrace
                    | TokenKind::Semicolon
                    | TokenKind::LParen
                    | TokenKind::LBracket
                    | TokenKind::Newline
            ),
        }
    }

    /// True when the previous token can be the end of an expression, which
    /// makes a following `/` a division operator rather than an ERE.
    fn prev_ends_expression(&self) -> bool {
        match &self.prev {
            None => false,
            Some(kind) => matches!(
                kind,
                TokenKind::Int(_)
                    | TokenKind::Double(_)
                    | TokenKind::Str(_)
                    | TokenKind::Ere(_)
                    | TokenKind::Ident(_)
                    | TokenKind::Builtin(_)
                    | TokenKind::RParen
                    | TokenKind::RBracket
                    | TokenKind::PlusPlus
                    | TokenKind::MinusMinus
            ),
        }
    }

    // -------------------------------------------------------------------------
    // CORE SCANNING
    // -------------------------------------------------------------------------

    /// Scans and returns the next token from the source.
    fn scan_token(&mut self) -> AwkResult<Token> {
        let start_line = self.line;
        let start_col = self.col;
        let start_pos = self.pos;

        let byte = self.advance();

        let kind = match byte {
            b'\n' => {
                self.line += 1;
                self.col = 1;
                TokenKind::Newline
            }
            b'\r' => {
                // CRLF counts as one newline token
                self.match_byte(b'\n');
                self.line += 1;
                self.col = 1;
                TokenKind::Newline
            }

            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            b'$' => TokenKind::Dollar,

            b'+' => {
                if self.match_byte(b'=') {
                    TokenKind::PlusEq
                } else if self.match_byte(b'+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.match_byte(b'=') {
                    TokenKind::MinusEq
                } else if self.match_byte(b'-') {
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.match_byte(b'=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            b'%' => {
                if self.match_byte(b'=') {
                    TokenKind::PercentEq
                } else {
                    TokenKind::Percent
                }
            }
            b'^' => {
                if self.match_byte(b'=') {
                    TokenKind::CaretEq
                } else {
                    TokenKind::Caret
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'!' => {
                if self.match_byte(b'=') {
                    TokenKind::BangEq
                } else if self.match_byte(b'~') {
                    TokenKind::BangTilde
                } else {
                    TokenKind::Bang
                }
            }
            b'~' => TokenKind::Tilde,
            b'<' => {
                if self.match_byte(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.match_byte(b'>') {
                    TokenKind::Append
                } else if self.match_byte(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            b'&' => {
                if self.match_byte(b'&') {
                    TokenKind::AmpAmp
                } else {
                    return Err(AwkError::lexer(
                        "stray '&'",
                        Span::new(start_line, start_col, 1),
                    ));
                }
            }
            b'|' => {
                if self.match_byte(b'|') {
                    TokenKind::PipePipe
                } else if self.match_byte(b'&') {
                    TokenKind::PipeAmp
                } else {
                    TokenKind::Pipe
                }
            }
            b'?' => TokenKind::Question,
            b':' => TokenKind::Colon,

            b'/' => {
                if self.prev_ends_expression() {
                    if self.match_byte(b'=') {
                        TokenKind::SlashEq
                    } else {
                        TokenKind::Slash
                    }
                } else {
                    return self.scan_regex(start_line, start_col, start_pos);
                }
            }

            b'"' => return self.scan_string(start_line, start_col, start_pos),

            b'0'..=b'9' => self.scan_number(byte, start_line, start_col)?,
            b'.' => {
                if !self.is_at_end() && self.peek().is_ascii_digit() {
                    self.scan_number(byte, start_line, start_col)?
                } else {
                    return Err(AwkError::lexer(
                        "unexpected character: '.'",
                        Span::new(start_line, start_col, 1),
                    ));
                }
            }

            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.scan_identifier(start_pos)?,

            _ => {
                return Err(AwkError::lexer(
                    format!("unexpected character: '{}'", byte as char),
                    Span::new(start_line, start_col, 1),
                ));
            }
        };

        let len = (self.pos - start_pos) as u32;
        Ok(Token::new(kind, Span::new(start_line, start_col, len)))
    }

    // -------------------------------------------------------------------------
    // STRING SCANNING
    // -------------------------------------------------------------------------

    /// Scans a double-quoted string literal, decoding escape sequences.
    ///
    /// A raw newline or end-of-input inside the literal is an error, which
    /// also covers octal/hex escapes cut short by the end of the line.
    fn scan_string(
        &mut self,
        start_line: u32,
        start_col: u32,
        start_pos: usize,
    ) -> AwkResult<Token> {
        let mut buf = String::new();

        loop {
            if self.is_at_end() {
                return Err(AwkError::lexer(
                    "unterminated string literal",
                    Span::new(start_line, start_col, 1),
                ));
            }

            let byte = self.peek();

            if byte == b'"' {
                self.advance();
                break;
            }

            if byte == b'\n' || byte == b'\r' {
                return Err(AwkError::lexer(
                    "newline in string literal",
                    Span::new(start_line, start_col, 1),
                ));
            }

            if byte == b'\\' {
                self.advance();
                self.scan_escape(&mut buf, start_line, start_col)?;
                continue;
            }

            self.advance();
            buf.push(byte as char);
        }

        let total_len = (self.pos - start_pos) as u32;
        let span = Span::new(start_line, start_col, total_len);
        Ok(Token::new(TokenKind::Str(buf), span))
    }

    /// Decodes one escape sequence after the backslash has been consumed.
    fn scan_escape(&mut self, buf: &mut String, start_line: u32, start_col: u32) -> AwkResult<()> {
        if self.is_at_end() {
            return Err(AwkError::lexer(
                "unterminated string literal",
                Span::new(start_line, start_col, 1),
            ));
        }
        let esc = self.peek();
        match esc {
            b'\\' => {
                self.advance();
                buf.push('\\');
            }
            b'a' => {
                self.advance();
                buf.push('\u{07}');
            }
            b'b' => {
                self.advance();
                buf.push('\u{08}');
            }
            b'f' => {
                self.advance();
                buf.push('\u{0C}');
            }
            b'n' => {
                self.advance();
                buf.push('\n');
            }
            b'r' => {
                self.advance();
                buf.push('\r');
            }
            b't' => {
                self.advance();
                buf.push('\t');
            }
            b'v' => {
                self.advance();
                buf.push('\u{0B}');
            }
            b'"' => {
                self.advance();
                buf.push('"');
            }
            b'0'..=b'7' => {
                // One to three octal digits, stopping at the first non-octal.
                let mut code: u32 = 0;
                let mut digits = 0;
                while digits < 3
                    && !self.is_at_end()
                    && (b'0'..=b'7').contains(&self.peek())
                {
                    code = code * 8 + (self.advance() - b'0') as u32;
                    digits += 1;
                }
                buf.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
            }
            b'x' => {
                self.advance();
                // One to two hex digits; a bare \x yields a literal 'x'.
                let mut code: u32 = 0;
                let mut digits = 0;
                while digits < 2 && !self.is_at_end() && self.peek().is_ascii_hexdigit() {
                    code = code * 16 + (self.advance() as char).to_digit(16).unwrap();
                    digits += 1;
                }
                if digits == 0 {
                    buf.push('x');
                } else {
                    buf.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                }
            }
            b'\n' | b'\r' => {
                return Err(AwkError::lexer(
                    "newline in string literal",
                    Span::new(start_line, start_col, 1),
                ));
            }
            other => {
                // Unknown escape: keep backslash and character.
                self.advance();
                buf.push('\\');
                buf.push(other as char);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ERE SCANNING
    // -------------------------------------------------------------------------

    /// Scans an ERE literal after the opening `/`. The pattern text is kept
    /// raw for the regex engine; only `\/` collapses to `/`.
    fn scan_regex(
        &mut self,
        start_line: u32,
        start_col: u32,
        start_pos: usize,
    ) -> AwkResult<Token> {
        let mut pat = String::new();

        loop {
            if self.is_at_end() {
                return Err(AwkError::lexer(
                    "unterminated regular expression",
                    Span::new(start_line, start_col, 1),
                ));
            }
            let byte = self.peek();
            if byte == b'\n' || byte == b'\r' {
                return Err(AwkError::lexer(
                    "newline in regular expression",
                    Span::new(start_line, start_col, 1),
                ));
            }
            if byte == b'/' {
                self.advance();
                break;
            }
            if byte == b'\\' {
                self.advance();
                if self.is_at_end() {
                    return Err(AwkError::lexer(
                        "unterminated regular expression",
                        Span::new(start_line, start_col, 1),
                    ));
                }
                let next = self.advance();
                if next == b'/' {
                    pat.push('/');
                } else {
                    pat.push('\\');
                    pat.push(next as char);
                }
                continue;
            }
            self.advance();
            pat.push(byte as char);
        }

        let total_len = (self.pos - start_pos) as u32;
        let span = Span::new(start_line, start_col, total_len);
        Ok(Token::new(TokenKind::Ere(pat), span))
    }

    // -------------------------------------------------------------------------
    // NUMBER SCANNING
    // -------------------------------------------------------------------------

    /// Scans a numeric literal: decimal integer or float with optional
    /// fraction and exponent. Integer-valued literals become `Int` tokens.
    fn scan_number(&mut self, first: u8, start_line: u32, start_col: u32) -> AwkResult<TokenKind> {
        let mut num_str = String::new();
        let mut is_float = first == b'.';
        num_str.push(first as char);

        while !self.is_at_end() && self.peek().is_ascii_digit() {
            num_str.push(self.advance() as char);
        }

        if !is_float
            && !self.is_at_end()
            && self.peek() == b'.'
        {
            is_float = true;
            num_str.push(self.advance() as char);
            while !self.is_at_end() && self.peek().is_ascii_digit() {
                num_str.push(self.advance() as char);
            }
        }

        if !self.is_at_end() && (self.peek() == b'e' || self.peek() == b'E') {
            let next = self.peek_at(1);
            let next2 = self.peek_at(2);
            let exp_ok = matches!(next, Some(b'0'..=b'9'))
                || (matches!(next, Some(b'+') | Some(b'-'))
                    && matches!(next2, Some(b'0'..=b'9')));
            if exp_ok {
                is_float = true;
                num_str.push(self.advance() as char);
                if self.peek() == b'+' || self.peek() == b'-' {
                    num_str.push(self.advance() as char);
                }
                while !self.is_at_end() && self.peek().is_ascii_digit() {
                    num_str.push(self.advance() as char);
                }
            }
        }

        if !is_float {
            if let Ok(i) = num_str.parse::<i64>() {
                return Ok(TokenKind::Int(i));
            }
        }

        let value: f64 = num_str.parse().map_err(|_| {
            AwkError::lexer(
                format!("invalid number literal: {}", num_str),
                Span::new(start_line, start_col, num_str.len() as u32),
            )
        })?;

        Ok(TokenKind::Double(value))
    }

    // -------------------------------------------------------------------------
    // IDENTIFIER SCANNING
    // -------------------------------------------------------------------------

    /// Scans an identifier, keyword, or builtin token.
    fn scan_identifier(&mut self, start_pos: usize) -> AwkResult<TokenKind> {
        while !self.is_at_end() && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_') {
            self.advance();
        }

        let text = std::str::from_utf8(&self.source[start_pos..self.pos]).map_err(|_| {
            AwkError::lexer(
                "invalid UTF-8 in identifier",
                Span::new(self.line, self.col, (self.pos - start_pos) as u32),
            )
        })?;

        if let Some(keyword) = lookup_keyword(text) {
            return Ok(keyword);
        }
        if let Some(builtin) = lookup_builtin(text) {
            return Ok(TokenKind::Builtin(builtin));
        }
        if self.extra_keywords {
            if let Some(builtin) = lookup_extra_builtin(text) {
                return Ok(TokenKind::Builtin(builtin));
            }
        }
        if self.cast_keywords {
            if let Some(builtin) = lookup_cast_builtin(text) {
                return Ok(TokenKind::Builtin(builtin));
            }
        }

        // A call head is an identifier glued to its opening paren.
        if !self.is_at_end() && self.peek() == b'(' {
            return Ok(TokenKind::FuncName(text.to_string()));
        }

        Ok(TokenKind::Ident(text.to_string()))
    }

    // -------------------------------------------------------------------------
    // WHITESPACE & COMMENT SKIPPING
    // -------------------------------------------------------------------------

    /// Skips spaces, tabs, backslash-newline continuations, and `# ...`
    /// comments. Newlines themselves are tokens and are not skipped here.
    fn skip_blanks_and_comments(&mut self) {
        loop {
            while !self.is_at_end() {
                match self.peek() {
                    b' ' | b'\t' => {
                        self.advance();
                    }
                    b'\\' if matches!(self.peek_at(1), Some(b'\n')) => {
                        self.advance();
                        self.advance();
                        self.line += 1;
                        self.col = 1;
                    }
                    b'\\' if matches!(self.peek_at(1), Some(b'\r'))
                        && matches!(self.peek_at(2), Some(b'\n')) =>
                    {
                        self.advance();
                        self.advance();
                        self.advance();
                        self.line += 1;
                        self.col = 1;
                    }
                    _ => break,
                }
            }

            // Comments run to end of line; the newline stays significant.
            if !self.is_at_end() && self.peek() == b'#' {
                let remaining = &self.source[self.pos..];
                match memchr::memchr(b'\n', remaining) {
                    Some(offset) => {
                        self.pos += offset;
                        self.col += offset as u32;
                    }
                    None => {
                        let skip = self.source.len() - self.pos;
                        self.col += skip as u32;
                        self.pos = self.source.len();
                    }
                }
                continue;
            }

            break;
        }
    }

    // -------------------------------------------------------------------------
    // LOW-LEVEL BYTE OPERATIONS
    // -------------------------------------------------------------------------

    /// Returns the current byte without advancing.
    #[inline(always)]
    fn peek(&self) -> u8 {
        self.source[self.pos]
    }

    /// Returns the byte `n` positions ahead, if any.
    #[inline]
    fn peek_at(&self, n: usize) -> Option<u8> {
        self.source.get(self.pos + n).copied()
    }

    /// Advances the position by one byte and returns the consumed byte.
    #[inline(always)]
    fn advance(&mut self) -> u8 {
        let byte = self.source[self.pos];
        self.pos += 1;
        self.col += 1;
        byte
    }

    /// Advances if the current byte matches `expected`, returning `true`.
    #[inline]
    fn match_byte(&mut self, expected: u8) -> bool {
        if !self.is_at_end() && self.source[self.pos] == expected {
            self.pos += 1;
            self.col += 1;
            true
        } else {
            false
        }
    }

    /// Returns `true` if the lexer has consumed all source bytes.
    #[inline(always)]
    fn is_at_end(&self) -> bool {
        self.pos >= self.source.len()
    }
}
