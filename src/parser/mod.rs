//! Recursive descent parser for Parley
//!
//! Statements are recursive descent; binary operators use precedence
//! climbing over the [`OperatorTable`].
//!
//! # Module Structure
//!
//! - `cursor` - Token stream navigation and lookahead
//! - `error` - Error types with source location tracking
//! - `pattern` - Pattern parsing

pub mod cursor;
pub mod error;
pub mod pattern;

pub use cursor::TokenCursor;
pub use error::{ParseError, ParseResult};

use crate::ast::*;
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::operators::{Associativity, OperatorTable};
use pattern::PatternParser;
use std::sync::Arc;

/// Lex and parse a whole program
pub fn parse_program(source: &str) -> ParseResult<Program> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}

/// Lex and parse a single expression, rejecting trailing input
pub fn parse_expr(source: &str) -> ParseResult<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.cursor.skip_separators();
    if !parser.is_at_end() {
        return Err(parser.cursor.unexpected("end of input"));
    }
    Ok(expr)
}

pub struct Parser {
    cursor: TokenCursor,
    op_table: OperatorTable,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            cursor: TokenCursor::new(tokens),
            op_table: OperatorTable::new(),
        }
    }

    // ========================================================================
    // Cursor delegation
    // ========================================================================

    fn peek(&self) -> &Token {
        self.cursor.peek()
    }

    fn current_span(&self) -> Span {
        self.cursor.current_span()
    }

    fn previous_span(&self) -> Span {
        self.cursor.previous_span()
    }

    fn advance(&mut self) -> &SpannedToken {
        self.cursor.advance()
    }

    fn is_at_end(&self) -> bool {
        self.cursor.is_at_end()
    }

    fn check(&self, token: &Token) -> bool {
        self.cursor.check(token)
    }

    fn consume(&mut self, expected: Token) -> ParseResult<&SpannedToken> {
        self.cursor.consume(expected)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        self.cursor.match_token(token)
    }

    // ========================================================================
    // Program structure
    // ========================================================================

    pub fn parse_program(&mut self) -> ParseResult<Program> {
        let mut items = Vec::new();

        loop {
            self.cursor.skip_separators();
            if self.is_at_end() {
                break;
            }
            items.push(self.parse_item()?);
            self.expect_statement_end(None)?;
        }

        Ok(Program { items })
    }

    fn parse_item(&mut self) -> ParseResult<Item> {
        match self.peek() {
            Token::Type => Ok(Item::Type(self.parse_type_decl()?)),
            Token::Server => Ok(Item::Server(self.parse_server_decl()?)),
            _ => Ok(Item::Expr(self.parse_expr()?)),
        }
    }

    /// A statement ends at `;`, a line break, the enclosing closer, or end of input
    fn expect_statement_end(&mut self, closer: Option<&Token>) -> ParseResult<()> {
        if self.match_token(&Token::Semicolon) || self.is_at_end() || self.cursor.at_line_start()
        {
            return Ok(());
        }
        if closer.is_some_and(|c| self.check(c)) {
            return Ok(());
        }
        Err(self.cursor.unexpected("end of statement"))
    }

    /// `type Nat = x -> x >= 0`
    fn parse_type_decl(&mut self) -> ParseResult<TypeDecl> {
        let start = self.current_span();
        self.consume(Token::Type)?;
        let name = self.parse_upper_ident()?;
        self.consume(Token::Eq)?;
        let param = self.parse_plain_ident()?;
        self.consume(Token::Arrow)?;
        let predicate = self.parse_expr()?;
        let span = start.merge(&predicate.span);

        Ok(TypeDecl {
            name,
            param,
            predicate: Arc::new(predicate),
            span,
        })
    }

    /// `server Name { .selector params -> body ... }`
    fn parse_server_decl(&mut self) -> ParseResult<ServerDecl> {
        let start = self.current_span();
        self.consume(Token::Server)?;
        let name = self.parse_upper_ident()?;
        self.consume(Token::LBrace)?;

        let mut handlers = Vec::new();
        loop {
            self.cursor.skip_separators();
            if self.match_token(&Token::RBrace) {
                break;
            }
            handlers.push(self.parse_handler()?);
            self.expect_statement_end(Some(&Token::RBrace))?;
        }

        let span = start.merge(&self.previous_span());
        Ok(ServerDecl {
            name,
            handlers,
            span,
        })
    }

    fn parse_handler(&mut self) -> ParseResult<HandlerDecl> {
        let start = self.current_span();
        self.consume(Token::Dot)?;
        let selector = self.parse_plain_ident()?;

        let params = if self.match_token(&Token::LParen) {
            self.parse_param_names_until_rparen()?
        } else {
            // `.sel a b ->` and `.sel a, b ->` are both accepted
            let mut params = Vec::new();
            while let Token::Ident(_) = self.peek() {
                params.push(self.parse_plain_ident()?);
                if self.match_token(&Token::Comma) && !matches!(self.peek(), Token::Ident(_)) {
                    return Err(self.cursor.unexpected("parameter name"));
                }
            }
            params
        };

        self.consume(Token::Arrow)?;
        let body = self.parse_expr()?;
        let span = start.merge(&body.span);

        Ok(HandlerDecl {
            selector,
            params,
            body: Arc::new(body),
            span,
        })
    }

    /// Parameter names after an already-consumed `(`
    fn parse_param_names_until_rparen(&mut self) -> ParseResult<Vec<Ident>> {
        let mut params = Vec::new();
        if self.match_token(&Token::RParen) {
            return Ok(params);
        }
        loop {
            params.push(self.parse_plain_ident()?);
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.consume(Token::RParen)?;
        Ok(params)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        match self.peek() {
            Token::Let => return self.parse_let(),
            Token::Return => return self.parse_return(),
            Token::Throw => {
                let start = self.current_span();
                self.advance();
                let value = self.parse_expr()?;
                let span = start.merge(&value.span);
                return Ok(Spanned::new(ExprKind::Throw(Arc::new(value)), span));
            }
            _ => {}
        }

        if let Some(lambda) = self.try_parse_lambda()? {
            return Ok(lambda);
        }

        let start = self.current_span();
        let expr = self.parse_expr_binary(0)?;

        if self.check(&Token::Eq) {
            let target = match &expr.node {
                ExprKind::Var(name) if !name.contains('.') => AssignTarget::Var(name.clone()),
                ExprKind::SelfField(field) => AssignTarget::SelfField(field.clone()),
                _ => return Err(ParseError::InvalidAssignTarget { span: expr.span }),
            };
            self.advance();
            let value = self.parse_expr()?;
            let span = start.merge(&value.span);
            return Ok(Spanned::new(
                ExprKind::Assign {
                    target,
                    value: Arc::new(value),
                },
                span,
            ));
        }

        Ok(expr)
    }

    fn parse_let(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::Let)?;
        let pattern = self.cursor.parse_pattern()?;
        self.consume(Token::Eq)?;
        let value = self.parse_expr()?;
        let span = start.merge(&value.span);
        Ok(Spanned::new(
            ExprKind::Let {
                pattern,
                value: Arc::new(value),
            },
            span,
        ))
    }

    fn parse_return(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::Return)?;

        let bare = self.cursor.at_line_start()
            || matches!(
                self.peek(),
                Token::Semicolon | Token::RBrace | Token::RParen | Token::Else | Token::Eof
            );
        if bare {
            return Ok(Spanned::new(ExprKind::Return(None), start));
        }

        let value = self.parse_expr()?;
        let span = start.merge(&value.span);
        Ok(Spanned::new(ExprKind::Return(Some(Arc::new(value))), span))
    }

    /// `x -> body`, `(a, b) -> body` or `() -> body`; backtracks when the
    /// tokens turn out not to be a parameter list
    fn try_parse_lambda(&mut self) -> ParseResult<Option<Expr>> {
        let start = self.current_span();
        let saved = self.cursor.position();

        let params = match self.peek().clone() {
            Token::Ident(name) if !name.contains('.') && self.cursor.peek_nth(1) == &Token::Arrow => {
                self.advance();
                vec![name]
            }
            Token::LParen => {
                self.advance();
                match self.parse_param_names_until_rparen() {
                    Ok(params) if self.check(&Token::Arrow) => params,
                    _ => {
                        self.cursor.restore(saved);
                        return Ok(None);
                    }
                }
            }
            _ => return Ok(None),
        };

        self.consume(Token::Arrow)?;
        let body = self.parse_expr()?;
        let span = start.merge(&body.span);
        Ok(Some(Spanned::new(
            ExprKind::Lambda {
                params,
                body: Arc::new(body),
            },
            span,
        )))
    }

    fn parse_expr_binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let start = self.current_span();
        let mut left = self.parse_expr_unary()?;

        loop {
            let Some(symbol) = self.peek().operator_symbol() else {
                break;
            };
            let Some(info) = self.op_table.get(symbol).cloned() else {
                break;
            };
            if info.precedence < min_prec {
                break;
            }

            self.advance();

            let next_min = match info.assoc {
                Associativity::Left => info.precedence + 1,
                Associativity::Right => info.precedence,
                Associativity::None => info.precedence + 1,
            };

            let right = self.parse_expr_binary(next_min)?;
            let span = start.merge(&right.span);

            left = Spanned::new(
                ExprKind::BinOp {
                    op: info.op,
                    left: Arc::new(left),
                    right: Arc::new(right),
                },
                span,
            );
        }

        Ok(left)
    }

    fn parse_expr_unary(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();

        let op = match self.peek() {
            Token::Not | Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_expr_postfix(),
        };
        self.advance();

        let operand = self.parse_expr_unary()?;
        let span = start.merge(&operand.span);
        Ok(Spanned::new(
            ExprKind::UnaryOp {
                op,
                operand: Arc::new(operand),
            },
            span,
        ))
    }

    /// Calls `f(a, b)` and sends `target (.sel a, b)`. A `(` at the start of a
    /// line begins a new statement instead.
    fn parse_expr_postfix(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        let mut expr = self.parse_expr_atom()?;

        while self.check(&Token::LParen) && !self.cursor.at_line_start() {
            self.advance();

            if self.match_token(&Token::Dot) {
                let selector = self.parse_plain_ident()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.parse_comma_exprs()?
                };
                self.consume(Token::RParen)?;
                let span = start.merge(&self.previous_span());
                expr = Spanned::new(
                    ExprKind::Send {
                        target: Arc::new(expr),
                        selector,
                        args,
                    },
                    span,
                );
            } else {
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.parse_comma_exprs()?
                };
                self.consume(Token::RParen)?;
                let span = start.merge(&self.previous_span());
                expr = Spanned::new(
                    ExprKind::Call {
                        callee: Arc::new(expr),
                        args,
                    },
                    span,
                );
            }
        }

        Ok(expr)
    }

    fn parse_comma_exprs(&mut self) -> ParseResult<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.match_token(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_expr_atom(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();

        match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(Spanned::new(ExprKind::Lit(Literal::Int(n)), start))
            }
            Token::String(s) => {
                self.advance();
                Ok(Spanned::new(ExprKind::Lit(Literal::String(s)), start))
            }
            Token::True => {
                self.advance();
                Ok(Spanned::new(ExprKind::Lit(Literal::Bool(true)), start))
            }
            Token::False => {
                self.advance();
                Ok(Spanned::new(ExprKind::Lit(Literal::Bool(false)), start))
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Spanned::new(ExprKind::Var(name), start))
            }
            Token::SelfKw => {
                self.advance();
                if self.check(&Token::Dot) && matches!(self.cursor.peek_nth(1), Token::Ident(_)) {
                    self.advance();
                    let field = self.parse_plain_ident()?;
                    let span = start.merge(&self.previous_span());
                    return Ok(Spanned::new(ExprKind::SelfField(field), span));
                }
                Ok(Spanned::new(ExprKind::SelfRef, start))
            }
            Token::Spawn => {
                self.advance();
                let name = self.parse_upper_ident()?;
                let span = start.merge(&self.previous_span());
                Ok(Spanned::new(ExprKind::Spawn(name), span))
            }
            Token::LParen => self.parse_paren_expr(),
            Token::LBracket => {
                self.advance();
                let items = if self.check(&Token::RBracket) {
                    Vec::new()
                } else {
                    self.parse_comma_exprs()?
                };
                self.consume(Token::RBracket)?;
                let span = start.merge(&self.previous_span());
                Ok(Spanned::new(ExprKind::List(items), span))
            }
            Token::LBrace => self.parse_block(),
            Token::If => self.parse_if(),
            Token::Loop => {
                self.advance();
                let body = self.parse_expr()?;
                let span = start.merge(&body.span);
                Ok(Spanned::new(ExprKind::Loop(Arc::new(body)), span))
            }
            Token::Match => self.parse_match(),
            Token::Let | Token::Return | Token::Throw => self.parse_expr(),
            _ => Err(self.cursor.unexpected("expression")),
        }
    }

    /// `()`, `(e)` or `(a, b, ...)`
    fn parse_paren_expr(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::LParen)?;

        if self.match_token(&Token::RParen) {
            let span = start.merge(&self.previous_span());
            return Ok(Spanned::new(ExprKind::Lit(Literal::Unit), span));
        }

        let first = self.parse_expr()?;
        if self.match_token(&Token::RParen) {
            return Ok(first);
        }

        let mut items = vec![first];
        while self.match_token(&Token::Comma) {
            items.push(self.parse_expr()?);
        }
        self.consume(Token::RParen)?;
        let span = start.merge(&self.previous_span());
        Ok(Spanned::new(ExprKind::Tuple(items), span))
    }

    fn parse_block(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::LBrace)?;

        let mut stmts = Vec::new();
        loop {
            self.cursor.skip_separators();
            if self.match_token(&Token::RBrace) {
                break;
            }
            stmts.push(self.parse_expr()?);
            self.expect_statement_end(Some(&Token::RBrace))?;
        }

        let span = start.merge(&self.previous_span());
        Ok(Spanned::new(ExprKind::Block(stmts), span))
    }

    fn parse_if(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::If)?;
        let cond = self.parse_expr()?;
        self.consume(Token::Then)?;
        let then_branch = self.parse_expr()?;

        let else_branch = if self.match_token(&Token::Else) {
            Some(Arc::new(self.parse_expr()?))
        } else {
            None
        };

        let span = start.merge(&self.previous_span());
        Ok(Spanned::new(
            ExprKind::If {
                cond: Arc::new(cond),
                then_branch: Arc::new(then_branch),
                else_branch,
            },
            span,
        ))
    }

    fn parse_match(&mut self) -> ParseResult<Expr> {
        let start = self.current_span();
        self.consume(Token::Match)?;
        let scrutinee = self.parse_expr_binary(0)?;
        self.consume(Token::LBrace)?;

        let mut arms = Vec::new();
        loop {
            self.cursor.skip_separators();
            if self.match_token(&Token::RBrace) {
                break;
            }
            let pattern = self.cursor.parse_pattern()?;
            self.consume(Token::Arrow)?;
            let body = self.parse_expr()?;
            arms.push(MatchArm { pattern, body });
            self.expect_statement_end(Some(&Token::RBrace))?;
        }

        let span = start.merge(&self.previous_span());
        Ok(Spanned::new(
            ExprKind::Match {
                scrutinee: Arc::new(scrutinee),
                arms,
            },
            span,
        ))
    }

    // ========================================================================
    // Identifiers
    // ========================================================================

    /// A lowercase identifier that is not a dotted builtin path
    fn parse_plain_ident(&mut self) -> ParseResult<Ident> {
        match self.peek().clone() {
            Token::Ident(name) if !name.contains('.') => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.cursor.unexpected("identifier")),
        }
    }

    fn parse_upper_ident(&mut self) -> ParseResult<Ident> {
        match self.peek().clone() {
            Token::UpperIdent(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.cursor.unexpected("type name")),
        }
    }
}
