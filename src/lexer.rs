//! Handwritten lexer for Parley

use crate::ast::Span;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    String(String),
    True,
    False,

    // Identifiers
    Ident(String),      // lowercase start, may be dotted: hashmap.new
    UpperIdent(String), // uppercase start: server and refinement names

    // Keywords
    Let,
    If,
    Then,
    Else,
    Loop,
    Return,
    Match,
    Type,
    Server,
    Spawn,
    Throw,
    SelfKw,
    Not,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,

    // Operators
    Arrow,   // ->
    Eq,      // =
    EqEq,    // ==
    Neq,     // !=
    Lt,      // <
    Gt,      // >
    Lte,     // <=
    Gte,     // >=
    Plus,    // +
    Minus,   // -
    Star,    // *
    Slash,   // /
    Percent, // %
    AndAnd,  // &&
    OrOr,    // ||
    Concat,  // ++
    Bang,    // !
    Underscore,

    Eof,
}

impl Token {
    /// Symbol for binary operator tokens, used by the precedence table
    pub fn operator_symbol(&self) -> Option<&'static str> {
        Some(match self {
            Token::EqEq => "==",
            Token::Neq => "!=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Lte => "<=",
            Token::Gte => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Concat => "++",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
    /// A line break separates this token from the previous one
    pub newline_before: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character: {0}")]
    UnexpectedChar(char, Span),
    #[error("unterminated string")]
    UnterminatedString(Span),
    #[error("invalid escape sequence: \\{0}")]
    InvalidEscape(char, Span),
    #[error("invalid number: {0}")]
    InvalidNumber(String, Span),
}

impl LexError {
    pub fn span(&self) -> &Span {
        match self {
            LexError::UnexpectedChar(_, span)
            | LexError::UnterminatedString(span)
            | LexError::InvalidEscape(_, span)
            | LexError::InvalidNumber(_, span) => span,
        }
    }
}

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    pos: usize,
    saw_newline: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            pos: 0,
            saw_newline: true,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<SpannedToken>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.token == Token::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    /// Skip whitespace and `--` comments, remembering whether a newline was crossed
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some('\n') => {
                    self.saw_newline = true;
                    self.advance();
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_second() == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_trivia();
        let newline_before = std::mem::take(&mut self.saw_newline);
        let start = self.pos;

        let Some(c) = self.advance() else {
            return Ok(SpannedToken {
                token: Token::Eof,
                span: Span::new(start, start),
                newline_before: true,
            });
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            ':' => Token::Colon,
            '.' => Token::Dot,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '-' => self.pick('>', Token::Arrow, Token::Minus),
            '+' => self.pick('+', Token::Concat, Token::Plus),
            '=' => self.pick('=', Token::EqEq, Token::Eq),
            '!' => self.pick('=', Token::Neq, Token::Bang),
            '<' => self.pick('=', Token::Lte, Token::Lt),
            '>' => self.pick('=', Token::Gte, Token::Gt),
            '&' => {
                if self.peek() == Some('&') {
                    self.advance();
                    Token::AndAnd
                } else {
                    return Err(LexError::UnexpectedChar('&', Span::new(start, self.pos)));
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    Token::OrOr
                } else {
                    return Err(LexError::UnexpectedChar('|', Span::new(start, self.pos)));
                }
            }
            '"' => self.lex_string(start)?,
            c if c.is_ascii_digit() => self.lex_number(c, start)?,
            '_' if !self.peek().is_some_and(is_ident_continue) => Token::Underscore,
            c if c.is_alphabetic() || c == '_' => self.lex_ident(c),
            _ => return Err(LexError::UnexpectedChar(c, Span::new(start, self.pos))),
        };

        Ok(SpannedToken {
            token,
            span: Span::new(start, self.pos),
            newline_before,
        })
    }

    /// Two-character operator if the next char is `second`, else the single one
    fn pick(&mut self, second: char, double: Token, single: Token) -> Token {
        if self.peek() == Some(second) {
            self.advance();
            double
        } else {
            single
        }
    }

    fn lex_string(&mut self, start: usize) -> Result<Token, LexError> {
        let mut s = String::new();
        loop {
            match self.advance() {
                Some('"') => break,
                Some('\\') => {
                    let escaped = match self.advance() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some(c) => {
                            return Err(LexError::InvalidEscape(c, Span::new(start, self.pos)))
                        }
                        None => {
                            return Err(LexError::UnterminatedString(Span::new(start, self.pos)))
                        }
                    };
                    s.push(escaped);
                }
                Some(c) => s.push(c),
                None => return Err(LexError::UnterminatedString(Span::new(start, self.pos))),
            }
        }
        Ok(Token::String(s))
    }

    fn lex_number(&mut self, first: char, start: usize) -> Result<Token, LexError> {
        let mut s = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        s.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| LexError::InvalidNumber(s.clone(), Span::new(start, self.pos)))
    }

    fn lex_ident(&mut self, first: char) -> Token {
        let mut s = String::from(first);
        self.take_ident_tail(&mut s);

        match s.as_str() {
            "let" => return Token::Let,
            "if" => return Token::If,
            "then" => return Token::Then,
            "else" => return Token::Else,
            "loop" => return Token::Loop,
            "return" => return Token::Return,
            "match" => return Token::Match,
            "type" => return Token::Type,
            "server" => return Token::Server,
            "spawn" => return Token::Spawn,
            "throw" => return Token::Throw,
            "self" => return Token::SelfKw,
            "not" => return Token::Not,
            "true" => return Token::True,
            "false" => return Token::False,
            _ => {}
        }

        if first.is_uppercase() {
            return Token::UpperIdent(s);
        }

        // Qualified builtin names: `os.filesystem.create` is one identifier
        while self.peek() == Some('.') && self.peek_second().is_some_and(char::is_alphabetic) {
            self.advance();
            s.push('.');
            self.take_ident_tail(&mut s);
        }
        Token::Ident(s)
    }

    fn take_ident_tail(&mut self, s: &mut String) {
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_let_binding() {
        assert_eq!(
            tokens("let x = 42"),
            vec![
                Token::Let,
                Token::Ident("x".into()),
                Token::Eq,
                Token::Int(42),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lambda_arrow_and_minus() {
        assert_eq!(
            tokens("n -> n - 1"),
            vec![
                Token::Ident("n".into()),
                Token::Arrow,
                Token::Ident("n".into()),
                Token::Minus,
                Token::Int(1),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("x -- trailing note\ny"),
            vec![Token::Ident("x".into()), Token::Ident("y".into()), Token::Eof]
        );
    }

    #[test]
    fn test_dotted_builtin_is_one_ident() {
        assert_eq!(
            tokens("hashmap.new()"),
            vec![
                Token::Ident("hashmap.new".into()),
                Token::LParen,
                Token::RParen,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_self_field_is_not_joined() {
        assert_eq!(
            tokens("self.jobs"),
            vec![
                Token::SelfKw,
                Token::Dot,
                Token::Ident("jobs".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_send_selector() {
        assert_eq!(
            tokens("w (.collect id, r)"),
            vec![
                Token::Ident("w".into()),
                Token::LParen,
                Token::Dot,
                Token::Ident("collect".into()),
                Token::Ident("id".into()),
                Token::Comma,
                Token::Ident("r".into()),
                Token::RParen,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_newline_flag() {
        let toks = Lexer::new("f\n(x)").tokenize().unwrap();
        assert!(toks[0].newline_before);
        assert!(toks[1].newline_before);
        assert!(!toks[2].newline_before);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""a\n\"b\"""#),
            vec![Token::String("a\n\"b\"".into()), Token::Eof]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"open").tokenize().unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString(_)));
    }

    #[test]
    fn test_keywords_and_upper_idents() {
        assert_eq!(
            tokens("server Main type Nat spawn"),
            vec![
                Token::Server,
                Token::UpperIdent("Main".into()),
                Token::Type,
                Token::UpperIdent("Nat".into()),
                Token::Spawn,
                Token::Eof
            ]
        );
    }
}
