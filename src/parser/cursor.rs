//! Cursor over the lexer's output
//!
//! The token vector always ends in `Eof`; reading past the end keeps
//! returning that sentinel, so callers never bounds-check.

use crate::ast::Span;
use crate::lexer::{SpannedToken, Token};

use super::error::{ParseError, ParseResult};

pub struct TokenCursor {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl TokenCursor {
    pub fn new(mut tokens: Vec<SpannedToken>) -> Self {
        if tokens.last().map_or(true, |t| t.token != Token::Eof) {
            let end = tokens.last().map_or(0, |t| t.span.end);
            tokens.push(SpannedToken {
                token: Token::Eof,
                span: Span::new(end, end),
                newline_before: true,
            });
        }
        Self { tokens, pos: 0 }
    }

    fn at(&self, index: usize) -> &SpannedToken {
        let last = self.tokens.len() - 1;
        &self.tokens[index.min(last)]
    }

    pub fn peek(&self) -> &Token {
        &self.at(self.pos).token
    }

    /// `n` tokens ahead; `peek_nth(0)` is `peek()`
    pub fn peek_nth(&self, n: usize) -> &Token {
        &self.at(self.pos + n).token
    }

    pub fn current_span(&self) -> Span {
        self.at(self.pos).span.clone()
    }

    pub fn previous_span(&self) -> Span {
        match self.pos {
            0 => Span::default(),
            p => self.at(p - 1).span.clone(),
        }
    }

    /// A line break separates the current token from the previous one
    pub fn at_line_start(&self) -> bool {
        self.at(self.pos).newline_before
    }

    pub fn is_at_end(&self) -> bool {
        *self.peek() == Token::Eof
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Step over the current token, returning it. Stays put on `Eof`.
    pub fn advance(&mut self) -> &SpannedToken {
        let index = self.pos;
        if !self.is_at_end() {
            self.pos += 1;
        }
        self.at(index)
    }

    pub fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    pub fn match_token(&mut self, token: &Token) -> bool {
        let hit = self.check(token);
        if hit {
            self.advance();
        }
        hit
    }

    pub fn consume(&mut self, expected: Token) -> ParseResult<&SpannedToken> {
        if !self.check(&expected) {
            let wanted = match expected.operator_symbol() {
                Some(symbol) => format!("`{}`", symbol),
                None => format!("{:?}", expected),
            };
            return Err(self.unexpected(&wanted));
        }
        Ok(self.advance())
    }

    pub fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::unexpected(expected, self.peek().clone(), self.current_span())
    }

    /// `;` separators; line breaks are carried on the tokens themselves
    pub fn skip_separators(&mut self) {
        while self.match_token(&Token::Semicolon) {}
    }
}
