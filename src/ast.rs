//! Abstract syntax tree for Parley programs
//!
//! Nodes are reference counted with `Arc` so closures and handler bodies can
//! be shared between scheduler workers without copying the tree.

use std::fmt;
use std::sync::Arc;

pub type Ident = String;

/// Byte range in the source text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// 1-indexed line and column (columns count characters, not bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSpan {
    pub start: Position,
    pub end: Position,
}

impl fmt::Display for LocatedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(f, "{}:{}-{}", self.start.line, self.start.column, self.end.column)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Maps byte offsets back to line/column positions for diagnostics.
#[derive(Debug, Clone)]
pub struct SourceMap {
    source: String,
    /// Byte offset where each line begins; `line_starts[0]` is always 0.
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(
                source
                    .char_indices()
                    .filter(|&(_, c)| c == '\n')
                    .map(|(i, _)| i + 1),
            )
            .collect();
        Self {
            source: source.to_string(),
            line_starts,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    pub fn position(&self, byte_offset: usize) -> Position {
        let offset = byte_offset.min(self.source.len());
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column = self.source[line_start..offset].chars().count() + 1;
        Position::new(line_idx + 1, column)
    }

    pub fn locate(&self, span: &Span) -> LocatedSpan {
        LocatedSpan {
            start: self.position(span.start),
            end: self.position(span.end),
        }
    }

    /// Text of a 1-indexed line without its line terminator
    pub fn line(&self, line_num: usize) -> Option<&str> {
        let idx = line_num.checked_sub(1)?;
        let start = *self.line_starts.get(idx)?;
        let end = match self.line_starts.get(idx + 1) {
            Some(next) => next - 1,
            None => self.source.len(),
        };
        Some(self.source[start..end].trim_end_matches('\r'))
    }

    pub fn span_text(&self, span: &Span) -> &str {
        let end = span.end.min(self.source.len());
        &self.source[span.start.min(end)..end]
    }
}

/// A node paired with its source span
#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

// ============================================================================
// Expressions
// ============================================================================

pub type Expr = Spanned<ExprKind>;

#[derive(Debug, Clone)]
pub enum ExprKind {
    Lit(Literal),

    /// Variable reference; qualified builtins like `hashmap.new` are a single name
    Var(Ident),

    /// `self` inside a server handler
    SelfRef,

    /// `self.name`
    SelfField(Ident),

    /// `(a, b) -> body`
    Lambda {
        params: Vec<Ident>,
        body: Arc<Expr>,
    },

    /// `f(a, b)`
    Call {
        callee: Arc<Expr>,
        args: Vec<Expr>,
    },

    /// `let pattern = value`, binds in the current scope
    Let {
        pattern: Pattern,
        value: Arc<Expr>,
    },

    /// `x = value` or `self.x = value`
    Assign {
        target: AssignTarget,
        value: Arc<Expr>,
    },

    If {
        cond: Arc<Expr>,
        then_branch: Arc<Expr>,
        else_branch: Option<Arc<Expr>>,
    },

    /// `{ stmt* }`
    Block(Vec<Expr>),

    Return(Option<Arc<Expr>>),

    Loop(Arc<Expr>),

    Match {
        scrutinee: Arc<Expr>,
        arms: Vec<MatchArm>,
    },

    Throw(Arc<Expr>),

    BinOp {
        op: BinOp,
        left: Arc<Expr>,
        right: Arc<Expr>,
    },

    UnaryOp {
        op: UnaryOp,
        operand: Arc<Expr>,
    },

    Tuple(Vec<Expr>),

    List(Vec<Expr>),

    /// `spawn TypeName`
    Spawn(Ident),

    /// `target (.selector a, b)`
    Send {
        target: Arc<Expr>,
        selector: Ident,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignTarget {
    Var(Ident),
    SelfField(Ident),
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    String(String),
    Bool(bool),
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    Concat,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Lte => "<=",
            BinOp::Gte => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Concat => "++",
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
    None,
}

// ============================================================================
// Patterns
// ============================================================================

pub type Pattern = Spanned<PatternKind>;

#[derive(Debug, Clone)]
pub enum PatternKind {
    /// `_`
    Wildcard,

    /// `x` binds the scrutinee
    Var(Ident),

    /// `42`, `"done"`, `true`, `()`
    Lit(Literal),

    /// `(a, b)`
    Tuple(Vec<Pattern>),

    /// `n : Nat` or `_ : Nat`
    Refined {
        binder: Option<Ident>,
        type_name: Ident,
    },
}

impl PatternKind {
    /// Names this pattern binds, in source order
    pub fn binders(&self) -> Vec<&str> {
        match self {
            PatternKind::Var(name) => vec![name.as_str()],
            PatternKind::Refined {
                binder: Some(name), ..
            } => vec![name.as_str()],
            PatternKind::Tuple(parts) => parts.iter().flat_map(|p| p.node.binders()).collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Top-level items
// ============================================================================

/// `type Nat = x -> x >= 0`
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: Ident,
    pub param: Ident,
    pub predicate: Arc<Expr>,
    pub span: Span,
}

/// One `.selector params -> body` entry of a server block
#[derive(Debug, Clone)]
pub struct HandlerDecl {
    pub selector: Ident,
    pub params: Vec<Ident>,
    pub body: Arc<Expr>,
    pub span: Span,
}

/// `server Name { ... }`
#[derive(Debug, Clone)]
pub struct ServerDecl {
    pub name: Ident,
    pub handlers: Vec<HandlerDecl>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Item {
    Type(TypeDecl),
    Server(ServerDecl),
    Expr(Expr),
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn servers(&self) -> impl Iterator<Item = &ServerDecl> {
        self.items.iter().filter_map(|item| match item {
            Item::Server(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn server(&self, name: &str) -> Option<&ServerDecl> {
        self.servers().find(|decl| decl.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_map_positions() {
        let map = SourceMap::new("let c = 0\nc = 5\nf()");

        assert_eq!(map.line_count(), 3);
        assert_eq!(map.position(0), Position::new(1, 1));
        assert_eq!(map.position(4), Position::new(1, 5));
        assert_eq!(map.position(10), Position::new(2, 1));
        assert_eq!(map.position(16), Position::new(3, 1));
        assert_eq!(map.line(2), Some("c = 5"));
        assert_eq!(map.line(4), None);
        assert_eq!(map.line(0), None);
    }

    #[test]
    fn test_source_map_counts_chars_not_bytes() {
        let map = SourceMap::new("let ß = 1");
        // 'ß' is two bytes, so '=' sits at byte 7 but column 7
        assert_eq!(map.position(7), Position::new(1, 7));
    }

    #[test]
    fn test_source_map_span_text_and_locate() {
        let map = SourceMap::new("server Main {\n  .init args -> ()\n}");
        let span = Span::new(7, 11);
        assert_eq!(map.span_text(&span), "Main");

        let loc = map.locate(&Span::new(16, 21));
        assert_eq!(loc.start, Position::new(2, 3));
        assert_eq!(format!("{}", loc), "2:3-8");
    }

    #[test]
    fn test_located_span_multiline_display() {
        let loc = LocatedSpan {
            start: Position::new(3, 4),
            end: Position::new(6, 1),
        };
        assert_eq!(loc.to_string(), "3:4-6:1");
    }

    #[test]
    fn test_pattern_binders_in_order() {
        let pat = PatternKind::Tuple(vec![
            Spanned::new(PatternKind::Var("job".into()), Span::default()),
            Spanned::new(PatternKind::Wildcard, Span::default()),
            Spanned::new(
                PatternKind::Refined {
                    binder: Some("n".into()),
                    type_name: "Nat".into(),
                },
                Span::default(),
            ),
        ]);
        assert_eq!(pat.binders(), vec!["job", "n"]);
    }
}
