//! Pattern parsing for `let` and `match`

use crate::ast::{Literal, Pattern, PatternKind, Spanned};
use crate::lexer::Token;

use super::cursor::TokenCursor;
use super::error::{ParseError, ParseResult};

/// Extension trait for pattern parsing
pub trait PatternParser {
    /// Parse a pattern, including an optional `: Type` refinement suffix
    fn parse_pattern(&mut self) -> ParseResult<Pattern>;

    /// Parse a pattern without a refinement suffix
    fn parse_pattern_atom(&mut self) -> ParseResult<Pattern>;
}

impl PatternParser for TokenCursor {
    fn parse_pattern(&mut self) -> ParseResult<Pattern> {
        let start = self.current_span();
        let atom = self.parse_pattern_atom()?;

        if !self.match_token(&Token::Colon) {
            return Ok(atom);
        }

        let binder = match atom.node {
            PatternKind::Var(name) => Some(name),
            PatternKind::Wildcard => None,
            _ => return Err(ParseError::InvalidPattern { span: atom.span }),
        };
        let type_name = match self.peek().clone() {
            Token::UpperIdent(name) => {
                self.advance();
                name
            }
            _ => return Err(self.unexpected("refinement type name")),
        };
        let span = start.merge(&self.previous_span());
        Ok(Spanned::new(PatternKind::Refined { binder, type_name }, span))
    }

    fn parse_pattern_atom(&mut self) -> ParseResult<Pattern> {
        let start = self.current_span();

        match self.peek().clone() {
            Token::Underscore => {
                self.advance();
                Ok(Spanned::new(PatternKind::Wildcard, start))
            }
            Token::Ident(name) => {
                self.advance();
                if name.contains('.') {
                    return Err(ParseError::InvalidPattern { span: start });
                }
                Ok(Spanned::new(PatternKind::Var(name), start))
            }
            Token::Int(n) => {
                self.advance();
                Ok(Spanned::new(PatternKind::Lit(Literal::Int(n)), start))
            }
            Token::Minus => {
                self.advance();
                match self.peek().clone() {
                    Token::Int(n) => {
                        self.advance();
                        let span = start.merge(&self.previous_span());
                        Ok(Spanned::new(PatternKind::Lit(Literal::Int(-n)), span))
                    }
                    _ => Err(self.unexpected("integer literal")),
                }
            }
            Token::String(s) => {
                self.advance();
                Ok(Spanned::new(PatternKind::Lit(Literal::String(s)), start))
            }
            Token::True => {
                self.advance();
                Ok(Spanned::new(PatternKind::Lit(Literal::Bool(true)), start))
            }
            Token::False => {
                self.advance();
                Ok(Spanned::new(PatternKind::Lit(Literal::Bool(false)), start))
            }
            Token::LParen => {
                self.advance();
                if self.match_token(&Token::RParen) {
                    let span = start.merge(&self.previous_span());
                    return Ok(Spanned::new(PatternKind::Lit(Literal::Unit), span));
                }

                let first = self.parse_pattern()?;
                if self.match_token(&Token::RParen) {
                    // Parenthesized pattern, not a tuple
                    return Ok(first);
                }

                let mut parts = vec![first];
                while self.match_token(&Token::Comma) {
                    parts.push(self.parse_pattern()?);
                }
                self.consume(Token::RParen)?;
                let span = start.merge(&self.previous_span());
                Ok(Spanned::new(PatternKind::Tuple(parts), span))
            }
            _ => Err(self.unexpected("pattern")),
        }
    }
}
