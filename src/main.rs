//! Parley CLI - file execution and REPL

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use parley::errors::{render_parse_error, render_runtime_error, Colors};
use parley::parser::{parse_program, ParseError};
use parley::{Failure, RedeclarePolicy, Runtime, RuntimeConfig, SourceMap, Value};

#[derive(Parser, Debug)]
#[command(name = "parley", version)]
#[command(about = "Run a Parley program, or start a REPL when no file is given")]
struct Args {
    /// Program to run
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Arguments delivered to `Main`'s `.init`. Options go before the first
    /// argument; everything from it on is passed through unchanged.
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    args: Vec<String>,

    /// Scheduler threads running actor turns
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Threads running wget/sleep/file writes
    #[arg(long, value_name = "N")]
    offload_workers: Option<usize>,

    /// Deadline for a single offloaded call
    #[arg(long, value_name = "MS")]
    offload_timeout_ms: Option<u64>,

    /// Nesting limit for function calls in one turn
    #[arg(long, value_name = "N")]
    max_call_depth: Option<usize>,

    /// Let a later `type`/`server` declaration replace an earlier one
    #[arg(long)]
    allow_redeclare: bool,

    /// Disable colored error output
    #[arg(long)]
    no_color: bool,
}

impl Args {
    fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::from_env();
        if let Some(n) = self.workers {
            config = config.with_workers(n);
        }
        if let Some(n) = self.offload_workers {
            config = config.with_offload_workers(n);
        }
        if let Some(ms) = self.offload_timeout_ms {
            config = config.with_offload_timeout(Duration::from_millis(ms));
        }
        if let Some(depth) = self.max_call_depth {
            config = config.with_max_call_depth(depth);
        }
        if self.allow_redeclare {
            config = config.with_redeclare(RedeclarePolicy::Overwrite);
        }
        config
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let colors = Colors::new(!args.no_color && io::stderr().is_terminal());
    let config = args.config();

    match &args.file {
        Some(path) => run_file(path, &args.args, config, &colors),
        None => {
            repl(config, &colors);
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &Path, argv: &[String], config: RuntimeConfig, colors: &Colors) -> ExitCode {
    let filename = path.display().to_string();
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {}: {}", filename, err);
            return ExitCode::FAILURE;
        }
    };

    let program = match parse_program(&source) {
        Ok(program) => program,
        Err(err) => {
            report_parse_error(&err, &source, Some(&filename), colors);
            return ExitCode::FAILURE;
        }
    };

    let runtime = Runtime::new(config);
    if program.server("Main").is_none() {
        let result = runtime.load(&program);
        runtime.wait_idle();
        let failed = report_failures(&runtime, colors);
        return match result {
            Ok(value) => {
                if value != Value::Unit {
                    println!("{}", value);
                }
                if failed {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(err) => {
                eprintln!("{}", render_runtime_error(&err, colors));
                ExitCode::FAILURE
            }
        };
    }

    let argv = argv.iter().map(Value::string).collect();
    match runtime.run_main(&program, argv) {
        Ok(report) => {
            for failure in &report.failures {
                print_failure(failure, colors);
            }
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("{}", render_runtime_error(&err, colors));
            ExitCode::FAILURE
        }
    }
}

/// Print accumulated handler failures; `true` if there were any
fn report_failures(runtime: &Runtime, colors: &Colors) -> bool {
    let failures = runtime.take_failures();
    for failure in &failures {
        print_failure(failure, colors);
    }
    !failures.is_empty()
}

fn print_failure(failure: &Failure, colors: &Colors) {
    eprintln!(
        "{}\n  in {} handling .{}",
        render_runtime_error(&failure.error, colors),
        failure.actor,
        failure.selector
    );
}

fn report_parse_error(err: &ParseError, source: &str, filename: Option<&str>, colors: &Colors) {
    let source_map = SourceMap::new(source);
    eprintln!("{}", render_parse_error(err, &source_map, filename, colors));
}

fn repl(config: RuntimeConfig, colors: &Colors) {
    println!("Parley v{} - :help for help, :quit to exit", env!("CARGO_PKG_VERSION"));
    println!();

    // Redeclaring while experimenting is the norm
    let runtime = Runtime::new(config.with_redeclare(RedeclarePolicy::Overwrite));
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("parley> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            ":quit" | ":q" => break,
            ":help" | ":h" => {
                println!("Commands:");
                println!("  :quit, :q      Exit the REPL");
                println!("  :help, :h      Show this help");
                println!("  :servers       List declared servers");
                println!("  :wait          Wait for running actors to go idle");
                println!();
                continue;
            }
            ":servers" => {
                for name in runtime.interpreter().servers().names() {
                    println!("{}", name);
                }
                continue;
            }
            ":wait" => {
                runtime.wait_idle();
                report_failures(&runtime, colors);
                continue;
            }
            cmd if cmd.starts_with(':') => {
                eprintln!("Unknown command: {}", cmd);
                continue;
            }
            _ => {}
        }

        let program = match parse_program(line) {
            Ok(program) => program,
            Err(err) => {
                report_parse_error(&err, line, None, colors);
                continue;
            }
        };
        match runtime.load(&program) {
            Ok(Value::Unit) => {}
            Ok(value) => println!("{}", value.repr()),
            Err(err) => eprintln!("{}", render_runtime_error(&err, colors)),
        }
        // Surface failures from turns that finished quickly
        let _ = runtime.wait_idle_timeout(Duration::from_millis(50));
        report_failures(&runtime, colors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_before_program_arguments() {
        let args = Args::try_parse_from(["parley", "--workers", "2", "job.par", "a", "b"]).unwrap();
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.file, Some(PathBuf::from("job.par")));
        assert_eq!(args.args, vec!["a", "b"]);
    }

    #[test]
    fn test_flags_after_first_argument_are_passed_through() {
        let args = Args::try_parse_from(["parley", "job.par", "a", "--workers", "2"]).unwrap();
        assert_eq!(args.workers, None);
        assert_eq!(args.args, vec!["a", "--workers", "2"]);
    }
}
