//! Parser error types

use crate::ast::Span;
use crate::lexer::{LexError, Token};
use thiserror::Error;

/// Parser error types with source location information
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("unexpected token: expected {expected}, found {found:?}")]
    UnexpectedToken {
        expected: String,
        found: Token,
        span: Span,
    },

    #[error("unexpected end of file, expected {expected}")]
    UnexpectedEof { expected: String, last_span: Span },

    #[error("invalid pattern")]
    InvalidPattern { span: Span },

    #[error("invalid assignment target")]
    InvalidAssignTarget { span: Span },

    #[error(transparent)]
    Lex(#[from] LexError),
}

impl ParseError {
    pub fn span(&self) -> &Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => span,
            ParseError::UnexpectedEof { last_span, .. } => last_span,
            ParseError::InvalidPattern { span } => span,
            ParseError::InvalidAssignTarget { span } => span,
            ParseError::Lex(err) => err.span(),
        }
    }

    /// Create an UnexpectedToken error, or UnexpectedEof when the stream is exhausted
    pub fn unexpected(expected: impl Into<String>, found: Token, span: Span) -> Self {
        if found == Token::Eof {
            return Self::eof(expected, span);
        }
        ParseError::UnexpectedToken {
            expected: expected.into(),
            found,
            span,
        }
    }

    pub fn eof(expected: impl Into<String>, last_span: Span) -> Self {
        ParseError::UnexpectedEof {
            expected: expected.into(),
            last_span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
