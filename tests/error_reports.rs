//! Rendering of parse and runtime errors

use parley::errors::{render_parse_error, render_runtime_error, Colors};
use parley::parser::parse_program;
use parley::test_support::eval_err;
use parley::{Error, ErrorKind, SourceMap};

fn plain() -> Colors {
    Colors::new(false)
}

#[test]
fn parse_error_points_at_token() {
    let src = "let x = 1\nlet y = )";
    let err = parse_program(src).unwrap_err();
    let report = render_parse_error(&err, &SourceMap::new(src), Some("input.par"), &plain());

    assert!(report.contains("PARSE ERROR"), "{report}");
    assert!(report.contains("input.par:2:9"), "{report}");
    assert!(report.contains("2 | let y = )"), "{report}");
    assert!(report.contains('^'), "{report}");
}

#[test]
fn lex_error_is_a_syntax_error() {
    let src = "let s = \"open";
    let err = parse_program(src).unwrap_err();
    let report = render_parse_error(&err, &SourceMap::new(src), None, &plain());
    assert!(report.contains("SYNTAX ERROR"), "{report}");
    assert!(report.contains("<input>:1:"), "{report}");
}

#[test]
fn name_error_lists_suggestions() {
    let Error::Runtime(err) = eval_err("let counter = 1\ncountr") else {
        panic!("expected a runtime error");
    };
    assert_eq!(err.kind(), ErrorKind::Name);
    let report = render_runtime_error(&err, &plain());
    assert!(report.contains("NAME ERROR"), "{report}");
    assert!(report.contains("Did you mean counter?"), "{report}");
}

#[test]
fn match_error_shows_cause() {
    let Error::Runtime(err) =
        eval_err("type Nat = x -> x >= 0\nmatch \"s\" { _ : Nat -> 1; _ -> 2 }")
    else {
        panic!("expected a runtime error");
    };
    let report = render_runtime_error(&err, &plain());
    assert!(report.contains("MATCH ERROR"), "{report}");
    assert!(report.contains("caused by:"), "{report}");
}

#[test]
fn uncaught_throw_shows_value() {
    let Error::Runtime(err) = eval_err("throw \"gave up\"") else {
        panic!("expected a runtime error");
    };
    assert_eq!(err.kind(), ErrorKind::User);
    let report = render_runtime_error(&err, &plain());
    assert!(report.contains("UNCAUGHT THROW"), "{report}");
    assert!(report.contains("gave up"), "{report}");
}
