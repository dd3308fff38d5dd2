//! Builtin functions bound in the global scope
//!
//! Collection helpers never mutate their arguments; they return new values.
//! Inside a handler, `wget`, `sleep` and `os.filesystem.create` hand their
//! work to the offload pool. Given a selector (the third argument of
//! `os.filesystem.create`, the second of the others) they report back with a
//! message to the calling actor. `os.filesystem.create(path, contents)`
//! reports only failures, through the failure log; at top level it writes
//! directly.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blocking_pool::OffloadOp;
use crate::env::Env;
use crate::errors::RuntimeError;
use crate::eval::Evaluator;
use crate::value::{Arity, NativeFn, Token, Value, ValueMap};

// ============================================================================
// Output
// ============================================================================

/// Where `print` writes
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        // A closed stdout is not worth failing a turn over
        let _ = writeln!(out, "{}", line);
    }
}

/// Collects printed lines in memory
#[derive(Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl OutputSink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

// ============================================================================
// Registration
// ============================================================================

const BUILTINS: &[NativeFn] = &[
    NativeFn { name: "print", arity: Arity::AtLeast(0), func: print },
    NativeFn { name: "str", arity: Arity::Exactly(1), func: to_str },
    NativeFn { name: "len", arity: Arity::Exactly(1), func: len },
    NativeFn { name: "head", arity: Arity::Exactly(1), func: head },
    NativeFn { name: "tail", arity: Arity::Exactly(1), func: tail },
    NativeFn { name: "add", arity: Arity::Exactly(2), func: add },
    NativeFn { name: "remove", arity: Arity::Exactly(2), func: remove },
    NativeFn { name: "get", arity: Arity::Exactly(2), func: get },
    NativeFn { name: "put", arity: Arity::Exactly(3), func: put },
    NativeFn { name: "contains", arity: Arity::Exactly(2), func: contains },
    NativeFn { name: "keys", arity: Arity::Exactly(1), func: keys },
    NativeFn { name: "values", arity: Arity::Exactly(1), func: values },
    NativeFn { name: "range", arity: Arity::Exactly(2), func: range },
    NativeFn { name: "hashmap.new", arity: Arity::Exactly(0), func: hashmap_new },
    NativeFn { name: "genToken", arity: Arity::Exactly(0), func: gen_token },
    NativeFn { name: "os.filesystem.create", arity: Arity::AtLeast(2), func: fs_create },
    NativeFn { name: "wget", arity: Arity::AtLeast(2), func: wget },
    NativeFn { name: "sleep", arity: Arity::AtLeast(2), func: sleep },
];

pub fn install(global: &Env) {
    for native in BUILTINS {
        global.bind(native.name, Value::Native(*native));
    }
}

pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|n| n.name)
}

// ============================================================================
// Helpers
// ============================================================================

type NativeResult = Result<Value, RuntimeError>;

fn expected(what: &str, fname: &str, got: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "`{}` expects {}, got {}",
        fname,
        what,
        got.type_name()
    ))
}

fn index(fname: &str, len: usize, idx: &Value) -> Result<usize, RuntimeError> {
    let i = idx.as_int()?;
    usize::try_from(i)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| {
            RuntimeError::type_error(format!(
                "`{}`: index {} out of range for length {}",
                fname, i, len
            ))
        })
}

// ============================================================================
// Core
// ============================================================================

fn print(ev: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let line = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    ev.interpreter().output().write_line(&line);
    Ok(Value::Unit)
}

fn to_str(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    Ok(Value::string(args[0].to_string()))
}

fn gen_token(_: &mut Evaluator<'_>, _: Vec<Value>) -> NativeResult {
    Ok(Value::Token(Token::fresh()))
}

// ============================================================================
// Collections
// ============================================================================

fn len(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let n = match &args[0] {
        Value::List(items) | Value::Tuple(items) => items.len(),
        Value::Map(entries) => entries.len(),
        Value::String(s) => s.chars().count(),
        other => return Err(expected("a collection or String", "len", other)),
    };
    Ok(Value::Int(n as i64))
}

fn head(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::List(items) => items
            .first()
            .cloned()
            .ok_or_else(|| RuntimeError::type_error("`head` of an empty list")),
        other => Err(expected("a List", "head", other)),
    }
}

fn tail(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::List(items) if items.is_empty() => {
            Err(RuntimeError::type_error("`tail` of an empty list"))
        }
        Value::List(items) => Ok(Value::list(items[1..].to_vec())),
        other => Err(expected("a List", "tail", other)),
    }
}

fn add(_: &mut Evaluator<'_>, mut args: Vec<Value>) -> NativeResult {
    let item = args.pop().unwrap_or(Value::Unit);
    match &args[0] {
        Value::List(items) => {
            let mut items = items.to_vec();
            items.push(item);
            Ok(Value::list(items))
        }
        other => Err(expected("a List", "add", other)),
    }
}

fn remove(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::List(items) => {
            let at = index("remove", items.len(), &args[1])?;
            let mut items = items.to_vec();
            items.remove(at);
            Ok(Value::list(items))
        }
        Value::Map(entries) => {
            let mut entries = (**entries).clone();
            entries.shift_remove(&args[1]);
            Ok(Value::map(entries))
        }
        other => Err(expected("a List or Map", "remove", other)),
    }
}

/// Missing map keys read as `()`; list indices must be in range
fn get(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::List(items) | Value::Tuple(items) => {
            let at = index("get", items.len(), &args[1])?;
            Ok(items[at].clone())
        }
        Value::Map(entries) => Ok(entries.get(&args[1]).cloned().unwrap_or(Value::Unit)),
        other => Err(expected("a List, Tuple or Map", "get", other)),
    }
}

fn put(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let [map, key, value]: [Value; 3] = args
        .try_into()
        .map_err(|_| RuntimeError::type_error("`put` expects 3 arguments"))?;
    match map {
        Value::Map(entries) => {
            let mut entries = Arc::try_unwrap(entries).unwrap_or_else(|shared| (*shared).clone());
            entries.insert(key, value);
            Ok(Value::map(entries))
        }
        other => Err(expected("a Map", "put", &other)),
    }
}

fn contains(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let found = match (&args[0], &args[1]) {
        (Value::List(items), needle) => items.contains(needle),
        (Value::Map(entries), key) => entries.contains_key(key),
        (Value::String(s), Value::String(sub)) => s.contains(&**sub),
        (other, _) => return Err(expected("a List, Map or String", "contains", other)),
    };
    Ok(Value::Bool(found))
}

fn keys(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::Map(entries) => Ok(Value::list(entries.keys().cloned().collect())),
        other => Err(expected("a Map", "keys", other)),
    }
}

fn values(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::Map(entries) => Ok(Value::list(entries.values().cloned().collect())),
        other => Err(expected("a Map", "values", other)),
    }
}

/// Longest list `range` will build
const MAX_RANGE_LEN: i128 = 1 << 24;

/// `range(a, b)` is `[a, a+1, ..., b-1]`
fn range(_: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let (lo, hi) = (args[0].as_int()?, args[1].as_int()?);
    let len = i128::from(hi) - i128::from(lo);
    if len > MAX_RANGE_LEN {
        return Err(RuntimeError::type_error(format!(
            "`range` of {} elements exceeds the limit of {}",
            len, MAX_RANGE_LEN
        )));
    }
    Ok(Value::list((lo..hi).map(Value::Int).collect()))
}

fn hashmap_new(_: &mut Evaluator<'_>, _: Vec<Value>) -> NativeResult {
    Ok(Value::map(ValueMap::new()))
}

// ============================================================================
// I/O and offloaded calls
// ============================================================================

fn fs_create(ev: &mut Evaluator<'_>, args: Vec<Value>) -> NativeResult {
    let path = PathBuf::from(args[0].as_str()?);
    let contents = args[1].to_string();

    if args.len() > 2 {
        let rest = args.into_iter().skip(2).collect();
        let op = OffloadOp::WriteFile { path, contents };
        return offload(ev, "os.filesystem.create", op, rest);
    }
    if ev.current_actor().is_some() {
        let op = OffloadOp::WriteFile { path, contents };
        return dispatch(ev, "os.filesystem.create", op, None, Vec::new());
    }
    std::fs::write(&path, contents)?;
    Ok(Value::Unit)
}

fn wget(ev: &mut Evaluator<'_>, mut args: Vec<Value>) -> NativeResult {
    let url = args.remove(0).as_str()?.to_string();
    offload(ev, "wget", OffloadOp::Fetch { url }, args)
}

fn sleep(ev: &mut Evaluator<'_>, mut args: Vec<Value>) -> NativeResult {
    let ms = args.remove(0).as_int()?;
    let ms = u64::try_from(ms)
        .map_err(|_| RuntimeError::type_error("`sleep` expects a non-negative duration"))?;
    offload(ev, "sleep", OffloadOp::Sleep { ms }, args)
}

/// `rest` is `["selector", extra...]`
fn offload(ev: &mut Evaluator<'_>, fname: &str, op: OffloadOp, mut rest: Vec<Value>) -> NativeResult {
    if rest.is_empty() {
        return Err(RuntimeError::Arity {
            callee: fname.to_string(),
            expected: 2,
            found: 1,
        });
    }
    let selector = match rest.remove(0) {
        Value::String(s) => s.trim_start_matches('.').to_string(),
        other => return Err(expected("a selector String", fname, &other)),
    };
    dispatch(ev, fname, op, Some(selector), rest)
}

fn dispatch(
    ev: &mut Evaluator<'_>,
    fname: &str,
    op: OffloadOp,
    selector: Option<String>,
    extra: Vec<Value>,
) -> NativeResult {
    let requester = ev.current_actor().cloned().ok_or_else(|| {
        RuntimeError::Offload(format!("`{}` can only be called inside a handler", fname))
    })?;
    let host = ev
        .host()
        .ok_or_else(|| RuntimeError::Offload(format!("`{}` needs the actor runtime", fname)))?;

    for value in &extra {
        ev.note_escaped(value);
    }
    host.offload(&requester, op, selector, extra)?;
    Ok(Value::Unit)
}
