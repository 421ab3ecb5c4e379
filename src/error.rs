//! # Error Module
//!
//! Unified error types for all stages of the hawk pipeline.
//! Compile-stage errors carry source location (line, column) for
//! precise diagnostics; runtime errors carry the failing tuple position
//! in their message instead.

use std::fmt;

// -----------------------------------------------------------------------------
// SPAN — Source Location
// -----------------------------------------------------------------------------

/// Represents a position in source code.
///
/// Compact 12-byte representation tracking line, column, and length
/// for precise error reporting and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// 1-based line number in the concatenated script sources.
    pub line: u32,
    /// 1-based column number in the source line.
    pub col: u32,
    /// Length of the spanned region in bytes.
    pub len: u32,
}

impl Span {
    /// Creates a new span at the given location.
    #[inline]
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Self { line, col, len }
    }
}

// -----------------------------------------------------------------------------
// ERROR KIND — Pipeline Stage Classification
// -----------------------------------------------------------------------------

/// Classifies which stage or subsystem produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed token: unterminated string, truncated escape.
    Lexer,
    /// Grammar violation during parsing.
    Parser,
    /// Unresolved identifier, duplicate function, keyword collision.
    Semantic,
    /// File not found, read or write failure.
    Io,
    /// Array/scalar conflict, division by zero, illegal regex.
    Runtime,
    /// printf/sprintf conversion mismatch (suppressible).
    Format,
    /// Malformed command-line arguments or settings.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Lexer => write!(f, "LexerError"),
            ErrorKind::Parser => write!(f, "ParseError"),
            ErrorKind::Semantic => write!(f, "SemanticError"),
            ErrorKind::Io => write!(f, "IoError"),
            ErrorKind::Runtime => write!(f, "RuntimeError"),
            ErrorKind::Format => write!(f, "FormatError"),
            ErrorKind::Config => write!(f, "ConfigError"),
        }
    }
}

// -----------------------------------------------------------------------------
// AWK ERROR — Unified Error Type
// -----------------------------------------------------------------------------

/// The unified error type for the entire interpreter.
///
/// Every error carries a classification (`kind`), a human-readable
/// `message`, and an optional `span` pointing to the source location.
#[derive(Debug, Clone)]
pub struct AwkError {
    /// Which stage produced this error.
    pub kind: ErrorKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the error occurred, if available.
    pub span: Option<Span>,
}

impl AwkError {
    /// Creates a new error with a source location.
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span: Some(span),
        }
    }

    /// Creates a new error without source location information.
    pub fn no_span(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
        }
    }

    /// Creates a lexer error at the given span.
    #[inline]
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Lexer, message, span)
    }

    /// Creates a parser error at the given span.
    #[inline]
    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Parser, message, span)
    }

    /// Creates a semantic-analysis error at the given span.
    #[inline]
    pub fn semantic(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Semantic, message, span)
    }

    /// Creates an IO error without source location.
    #[inline]
    pub fn io(message: impl Into<String>) -> Self {
        Self::no_span(ErrorKind::Io, message)
    }

    /// Creates a runtime error without source location.
    #[inline]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::no_span(ErrorKind::Runtime, message)
    }

    /// Creates a printf format error without source location.
    #[inline]
    pub fn format(message: impl Into<String>) -> Self {
        Self::no_span(ErrorKind::Format, message)
    }

    /// Creates a configuration error without source location.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::no_span(ErrorKind::Config, message)
    }
}

impl fmt::Display for AwkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{} [line {}:{}]: {}",
                self.kind, span.line, span.col, self.message
            ),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AwkError {}

impl From<std::io::Error> for AwkError {
    fn from(err: std::io::Error) -> Self {
        AwkError::io(err.to_string())
    }
}

/// Convenience type alias for Results throughout the interpreter.
pub type AwkResult<T> = std::result::Result<T, AwkError>;
