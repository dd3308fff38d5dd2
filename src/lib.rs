//! Parley - an interpreted, expression-oriented language with server actors

pub mod ast;
pub mod blocking_pool;
pub mod builtins;
pub mod config;
pub mod env;
pub mod errors;
pub mod eval;
pub mod lexer;
pub mod operators;
pub mod parser;
pub mod reclaim;
pub mod refinement;
pub mod runtime;
pub mod server;
pub mod test_support;
pub mod value;

pub use ast::{LocatedSpan, Position, Program, SourceMap, Span};
pub use config::{RedeclarePolicy, RuntimeConfig};
pub use errors::{
    find_similar, format_header, format_location, format_snippet, format_suggestions,
    levenshtein_distance, render_parse_error, render_runtime_error, Colors, Error, ErrorKind,
    RuntimeError,
};
pub use eval::{Evaluator, Interpreter};
pub use lexer::Lexer;
pub use parser::{parse_expr, parse_program, ParseError};
pub use runtime::{Failure, InstanceState, RunReport, Runtime};
pub use value::{ActorRef, Value};
