// Error types for kestrel-ir
//
// Every front-end failure carries a kind plus an optional source span; when
// the source line is attached the Display output points at the column:
//
//   [3:12] undefined name 'y'
//     |     return y + 1;
//     |            ^

use std::fmt;

use crate::token::Span;

/// Result type for the IR crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors raised while lexing, parsing, compiling or transforming graphs.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub source_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // Lexer errors
    UnexpectedChar(char),
    UnterminatedString,
    InvalidNumber(String),

    // Parser errors
    UnexpectedToken { expected: String, got: String },
    UnexpectedEof,

    // Semantic errors
    /// A name that is neither local, defined in the unit, builtin nor
    /// resolvable through the resolution callback.
    UndefinedName(String),
    /// Ill-typed program: mismatched branch types, bad assignment, etc.
    Type(String),
    /// No overload of an operator accepts the given arguments.
    SchemaMatch { op: String, candidates: Vec<String> },
    /// A construct the compiler does not handle.
    Unsupported(String),
    /// Two definitions with the same qualified name.
    Duplicate(String),

    // General
    Message(String),
}

impl Error {
    pub fn new(kind: ErrorKind, span: Span) -> Self {
        Self {
            kind,
            span: Some(span),
            source_line: None,
        }
    }

    pub fn without_span(kind: ErrorKind) -> Self {
        Self {
            kind,
            span: None,
            source_line: None,
        }
    }

    pub fn msg(s: impl Into<String>) -> Self {
        Self::without_span(ErrorKind::Message(s.into()))
    }

    pub fn type_error(s: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Type(s.into()), span)
    }

    pub fn with_source_line(mut self, line: String) -> Self {
        self.source_line = Some(line);
        self
    }

    /// Attach the offending line from `source` if a span is known.
    pub fn with_source(self, source: &str) -> Self {
        match self.span {
            Some(span) if self.source_line.is_none() => {
                let line = source
                    .lines()
                    .nth(span.line.saturating_sub(1))
                    .unwrap_or_default()
                    .to_string();
                self.with_source_line(line)
            }
            _ => self,
        }
    }

    /// Whether this is a lexing or parsing failure.
    pub fn is_syntax(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::UnexpectedChar(_)
                | ErrorKind::UnterminatedString
                | ErrorKind::InvalidNumber(_)
                | ErrorKind::UnexpectedToken { .. }
                | ErrorKind::UnexpectedEof
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(span) = &self.span {
            write!(f, "[{}:{}] ", span.line, span.col)?;
        }
        match &self.kind {
            ErrorKind::UnexpectedChar(c) => write!(f, "unexpected character '{c}'"),
            ErrorKind::UnterminatedString => write!(f, "unterminated string literal"),
            ErrorKind::InvalidNumber(s) => write!(f, "invalid number '{s}'"),
            ErrorKind::UnexpectedToken { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            ErrorKind::UnexpectedEof => write!(f, "unexpected end of file"),
            ErrorKind::UndefinedName(name) => write!(f, "undefined name '{name}'"),
            ErrorKind::Type(s) => write!(f, "{s}"),
            ErrorKind::SchemaMatch { op, candidates } => {
                write!(
                    f,
                    "Arguments for call to '{op}' are not valid.\nThe following operator variants are available:"
                )?;
                for c in candidates {
                    write!(f, "\n\n  {c}")?;
                }
                Ok(())
            }
            ErrorKind::Unsupported(s) => write!(f, "unsupported: {s}"),
            ErrorKind::Duplicate(name) => write!(f, "'{name}' is already defined"),
            ErrorKind::Message(s) => write!(f, "{s}"),
        }?;
        if let Some(line) = &self.source_line {
            write!(f, "\n  | {line}")?;
            if let Some(span) = &self.span {
                write!(f, "\n  | {}^", " ".repeat(span.col.saturating_sub(1)))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
