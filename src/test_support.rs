//! Helpers shared by unit and integration tests
//!
//! - [`eval_ok`] / [`eval_err`]: evaluate source with no actor runtime
//! - [`run_actors`]: load a program into a fresh runtime, optionally run
//!   `Main`, and collect printed lines and failures once quiescent

use std::sync::Arc;
use std::time::Duration;

use crate::builtins::CaptureSink;
use crate::config::RuntimeConfig;
use crate::errors::Error;
use crate::eval::Interpreter;
use crate::parser::parse_program;
use crate::runtime::{Failure, Runtime};
use crate::value::Value;

/// How long [`run_actors`] waits for quiescence before giving up
pub const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Evaluate `source` top-level; panics with the error on failure
pub fn eval_ok(source: &str) -> Value {
    match Interpreter::new().eval_source(source) {
        Ok(value) => value,
        Err(err) => panic!("evaluation of {:?} failed: {}", source, err),
    }
}

/// Evaluate `source` expecting an error; panics if it succeeds
pub fn eval_err(source: &str) -> Error {
    match Interpreter::new().eval_source(source) {
        Ok(value) => panic!("expected {:?} to fail, got {}", source, value.repr()),
        Err(err) => err,
    }
}

/// Result of driving a program through the runtime
#[derive(Debug)]
pub struct ActorRun {
    /// Lines passed to `print`, in the order they were printed
    pub output: Vec<String>,
    pub failures: Vec<Failure>,
    /// Value of the last top-level statement
    pub last: Value,
}

/// Load `source` into a runtime, spawn `Main` with `args` if the program
/// defines one, and wait for quiescence
pub fn run_actors(source: &str, args: Vec<Value>) -> ActorRun {
    run_actors_with(RuntimeConfig::default().with_workers(4), source, args)
}

pub fn run_actors_with(config: RuntimeConfig, source: &str, args: Vec<Value>) -> ActorRun {
    let program = match parse_program(source) {
        Ok(program) => program,
        Err(err) => panic!("parse failed: {}", err),
    };
    let sink = Arc::new(CaptureSink::new());
    let runtime = Runtime::with_output(config, sink.clone());

    let last = match runtime.load(&program) {
        Ok(value) => value,
        Err(err) => panic!("load failed: {}", err),
    };
    if program.server("Main").is_some() {
        if let Err(err) = runtime.start_main(args) {
            panic!("starting Main failed: {}", err);
        }
    }
    assert!(
        runtime.wait_idle_timeout(QUIESCENCE_TIMEOUT),
        "runtime did not become idle within {:?}",
        QUIESCENCE_TIMEOUT
    );

    ActorRun {
        output: sink.take(),
        failures: runtime.take_failures(),
        last,
    }
}
