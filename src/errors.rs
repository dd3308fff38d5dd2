//! Runtime error taxonomy and diagnostic formatting.
//!
//! [`RuntimeError`] is what evaluation and actor turns fail with. The
//! rendering helpers below turn parse and runtime errors into the framed,
//! colored reports the CLI prints.

use std::fmt;

use thiserror::Error;

use crate::ast::{SourceMap, Span};
use crate::parser::ParseError;
use crate::value::Value;

// ============================================================================
// Runtime errors
// ============================================================================

/// Coarse classification of a [`RuntimeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Name,
    Arity,
    Type,
    Match,
    Selector,
    User,
    Offload,
    Declaration,
    Io,
    Depth,
}

impl ErrorKind {
    pub fn title(self) -> &'static str {
        match self {
            ErrorKind::Name => "NAME ERROR",
            ErrorKind::Arity => "ARITY ERROR",
            ErrorKind::Type => "TYPE ERROR",
            ErrorKind::Match => "MATCH ERROR",
            ErrorKind::Selector => "SELECTOR ERROR",
            ErrorKind::User => "UNCAUGHT THROW",
            ErrorKind::Offload => "OFFLOAD ERROR",
            ErrorKind::Declaration => "DECLARATION ERROR",
            ErrorKind::Io => "IO ERROR",
            ErrorKind::Depth => "RECURSION ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("unbound name `{name}`")]
    Name { name: String, suggestions: Vec<String> },

    #[error("`{callee}` expects {expected} argument(s), got {found}")]
    Arity {
        callee: String,
        expected: usize,
        found: usize,
    },

    #[error("{0}")]
    Type(String),

    #[error("{message}")]
    Match {
        message: String,
        cause: Option<Box<RuntimeError>>,
    },

    #[error("server {actor_type} has no handler for .{selector}")]
    Selector { actor_type: String, selector: String },

    #[error("{0}")]
    User(Value),

    #[error("{0}")]
    Offload(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{what} `{name}` is already declared")]
    DuplicateDeclaration { what: &'static str, name: String },

    #[error("unknown server type `{0}`")]
    UnknownServer(String),

    #[error("{0}")]
    Io(String),

    #[error("calls nested deeper than {limit}")]
    CallDepth { limit: usize },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Name { .. } | RuntimeError::UnknownServer(_) => ErrorKind::Name,
            RuntimeError::Arity { .. } => ErrorKind::Arity,
            RuntimeError::Type(_) | RuntimeError::DivisionByZero => ErrorKind::Type,
            RuntimeError::Match { .. } => ErrorKind::Match,
            RuntimeError::Selector { .. } => ErrorKind::Selector,
            RuntimeError::User(_) => ErrorKind::User,
            RuntimeError::Offload(_) => ErrorKind::Offload,
            RuntimeError::DuplicateDeclaration { .. } => ErrorKind::Declaration,
            RuntimeError::Io(_) => ErrorKind::Io,
            RuntimeError::CallDepth { .. } => ErrorKind::Depth,
        }
    }

    /// Program values carried by the error
    pub fn values(&self) -> Vec<&Value> {
        match self {
            RuntimeError::User(value) => vec![value],
            RuntimeError::Match {
                cause: Some(cause), ..
            } => cause.values(),
            _ => Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        RuntimeError::Type(message.into())
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        RuntimeError::Name {
            name: name.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn no_match(value: &Value) -> Self {
        RuntimeError::Match {
            message: format!("no pattern matched {}", value.repr()),
            cause: None,
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

/// Anything that can stop a program before or while it runs
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

// ============================================================================
// Terminal colors
// ============================================================================

/// ANSI color codes, empty when disabled
#[derive(Debug, Clone, Default)]
pub struct Colors {
    pub enabled: bool,
}

impl Colors {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn code(&self, code: &'static str) -> &'static str {
        if self.enabled {
            code
        } else {
            ""
        }
    }

    pub fn red(&self) -> &'static str {
        self.code("\x1b[31m")
    }

    pub fn cyan(&self) -> &'static str {
        self.code("\x1b[36m")
    }

    pub fn yellow(&self) -> &'static str {
        self.code("\x1b[33m")
    }

    pub fn bold(&self) -> &'static str {
        self.code("\x1b[1m")
    }

    pub fn reset(&self) -> &'static str {
        self.code("\x1b[0m")
    }
}

// ============================================================================
// "Did you mean?" suggestions
// ============================================================================

/// Levenshtein edit distance, computed with a single rolling row
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            let cost = usize::from(ca != *cb);
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }

    row[b.len()]
}

/// Up to three candidates within `max_distance` edits, closest first
pub fn find_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max_distance: usize,
) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|c| (levenshtein_distance(name, c), c))
        .filter(|&(dist, _)| dist > 0 && dist <= max_distance)
        .collect();

    scored.sort();
    scored.dedup();
    scored.into_iter().take(3).map(|(_, s)| s.to_string()).collect()
}

// ============================================================================
// Report formatting
// ============================================================================

/// One source line with a gutter and a caret underline beneath the span
///
/// ```text
/// 3 | let y = x +
///               ^
/// ```
pub fn format_snippet(source_map: &SourceMap, span: &Span, colors: &Colors) -> String {
    let loc = source_map.locate(span);
    let line_text = source_map.line(loc.start.line).unwrap_or("");
    let gutter = loc.start.line.to_string();

    let width = if loc.start.line == loc.end.line {
        loc.end.column.saturating_sub(loc.start.column).max(1)
    } else {
        1
    };
    let padding = " ".repeat(gutter.len() + 3 + loc.start.column - 1);

    format!(
        "{cyan}{gutter} |{reset} {line_text}\n{padding}{red}{carets}{reset}",
        cyan = colors.cyan(),
        red = colors.red(),
        reset = colors.reset(),
        carets = "^".repeat(width),
    )
}

pub fn format_suggestions(suggestions: &[String], colors: &Colors) -> String {
    let bolded: Vec<String> = suggestions
        .iter()
        .map(|s| format!("{}{}{}", colors.bold(), s, colors.reset()))
        .collect();

    match bolded.as_slice() {
        [] => String::new(),
        [one] => format!("\n\nDid you mean {}?", one),
        many => format!("\n\nDid you mean one of: {}?", many.join(", ")),
    }
}

/// `-- PARSE ERROR ------------------------------------------------`
pub fn format_header(title: &str, colors: &Colors) -> String {
    let dashes = "-".repeat(56usize.saturating_sub(title.len()).max(4));
    format!("{}-- {} {}{}", colors.cyan(), title, dashes, colors.reset())
}

/// `main.par:12:5`
pub fn format_location(
    filename: Option<&str>,
    span: &Span,
    source_map: &SourceMap,
    colors: &Colors,
) -> String {
    let pos = source_map.position(span.start);
    format!(
        "{}{}:{}{}",
        colors.bold(),
        filename.unwrap_or("<input>"),
        pos,
        colors.reset()
    )
}

pub fn render_parse_error(
    err: &ParseError,
    source_map: &SourceMap,
    filename: Option<&str>,
    colors: &Colors,
) -> String {
    let title = match err {
        ParseError::Lex(_) => "SYNTAX ERROR",
        _ => "PARSE ERROR",
    };
    format!(
        "{}\n{}\n\n{}\n\n{}",
        format_header(title, colors),
        format_location(filename, err.span(), source_map, colors),
        format_snippet(source_map, err.span(), colors),
        err
    )
}

/// Runtime errors have no source span; the report is the header, the
/// message and any suggestions or nested cause
pub fn render_runtime_error(err: &RuntimeError, colors: &Colors) -> String {
    let mut out = format!("{}\n\n{}", format_header(err.kind().title(), colors), err);
    match err {
        RuntimeError::Name { suggestions, .. } => {
            out.push_str(&format_suggestions(suggestions, colors));
        }
        RuntimeError::Match {
            cause: Some(cause), ..
        } => {
            out.push_str(&format!(
                "\n\n{}caused by:{} {}",
                colors.yellow(),
                colors.reset(),
                cause
            ));
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
        assert_eq!(levenshtein_distance("print", "prnt"), 1);
        assert_eq!(levenshtein_distance("print", "priint"), 1);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
    }

    #[test]
    fn test_find_similar_orders_by_distance() {
        let suggestions = find_similar("prnt", ["print", "printf", "map", "range"], 2);
        assert_eq!(suggestions[0], "print");
        assert!(!suggestions.contains(&"map".to_string()));
    }

    #[test]
    fn test_find_similar_excludes_identical() {
        let suggestions = find_similar("len", ["len", "lens"], 2);
        assert_eq!(suggestions, vec!["lens".to_string()]);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(RuntimeError::unbound("x").kind(), ErrorKind::Name);
        assert_eq!(RuntimeError::DivisionByZero.kind(), ErrorKind::Type);
        assert_eq!(RuntimeError::User(Value::Int(1)).kind(), ErrorKind::User);
        assert_eq!(
            RuntimeError::Selector {
                actor_type: "W".into(),
                selector: "nope".into()
            }
            .kind(),
            ErrorKind::Selector
        );
    }

    #[test]
    fn test_render_name_error_with_suggestion() {
        let err = RuntimeError::Name {
            name: "lne".into(),
            suggestions: vec!["len".into()],
        };
        let report = render_runtime_error(&err, &Colors::new(false));
        assert!(report.contains("NAME ERROR"));
        assert!(report.contains("unbound name `lne`"));
        assert!(report.contains("Did you mean len?"));
    }

    #[test]
    fn test_render_match_error_with_cause() {
        let err = RuntimeError::Match {
            message: "refinement Nat failed".into(),
            cause: Some(Box::new(RuntimeError::type_error("bad"))),
        };
        let report = render_runtime_error(&err, &Colors::new(false));
        assert!(report.contains("caused by: bad"));
    }

    #[test]
    fn test_snippet_underlines_span() {
        let map = SourceMap::new("let x = 1\nlet y = oops");
        let snippet = format_snippet(&map, &Span::new(18, 22), &Colors::new(false));
        assert_eq!(snippet, "2 | let y = oops\n            ^^^^");
    }

    #[test]
    fn test_header_has_title() {
        let header = format_header("PARSE ERROR", &Colors::new(false));
        assert!(header.starts_with("-- PARSE ERROR -"));
    }
}
