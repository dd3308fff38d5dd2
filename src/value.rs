//! Runtime values
//!
//! Data values (`Int` through `Map`) compare structurally. Closures, builtins,
//! actor references and tokens compare by identity. Collections are shared
//! immutably; the list and map helpers build new values instead of mutating.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::{Expr, Ident};
use crate::env::Env;
use crate::errors::RuntimeError;
use crate::eval::Evaluator;

pub type ValueMap = IndexMap<Value, Value>;

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(Arc<str>),
    Unit,
    List(Arc<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    Map(Arc<ValueMap>),
    Closure(Arc<Closure>),
    Native(NativeFn),
    Actor(ActorRef),
    Token(Token),
}

/// A lambda together with the scope it was created in
pub struct Closure {
    pub params: Vec<Ident>,
    pub body: Arc<Expr>,
    pub env: Env,
    /// Set when the lambda was bound by `let name = ...`; the name is rebound
    /// to the closure in every call scope so the body can recurse
    pub name: Option<Ident>,
}

pub type NativeImpl = fn(&mut Evaluator<'_>, Vec<Value>) -> Result<Value, RuntimeError>;

/// How many arguments a builtin accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }

    pub fn minimum(self) -> usize {
        match self {
            Arity::Exactly(k) | Arity::AtLeast(k) => k,
        }
    }
}

#[derive(Clone, Copy)]
pub struct NativeFn {
    pub name: &'static str,
    pub arity: Arity,
    pub func: NativeImpl,
}

/// Identity of a spawned instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to an actor instance; equal only to handles of the same instance
#[derive(Debug, Clone)]
pub struct ActorRef {
    pub id: ActorId,
    pub type_name: Arc<str>,
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActorRef {}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}{}>", self.type_name, self.id)
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Unforgeable correlation key. Only [`Token::fresh`] creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn fresh() -> Self {
        Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn map(entries: ValueMap) -> Self {
        Value::Map(Arc::new(entries))
    }

    /// Name of the value's tag, as used by builtin refinements
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Int",
            Value::Bool(_) => "Bool",
            Value::String(_) => "String",
            Value::Unit => "Unit",
            Value::List(_) => "List",
            Value::Tuple(_) => "Tuple",
            Value::Map(_) => "Map",
            Value::Closure(_) | Value::Native(_) => "Fn",
            Value::Actor(_) => "Actor",
            Value::Token(_) => "Token",
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(RuntimeError::type_error(format!(
                "expected Int, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(RuntimeError::type_error(format!(
                "expected Bool, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(RuntimeError::type_error(format!(
                "expected String, got {}",
                other.type_name()
            ))),
        }
    }

    /// Rendering used inside collections and error messages: strings quoted
    pub fn repr(&self) -> String {
        match self {
            Value::String(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(items: &[Value]) -> String {
            items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
        }

        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => f.write_str(s),
            Value::Unit => f.write_str("()"),
            Value::List(items) => write!(f, "[{}]", join(items)),
            Value::Tuple(items) => write!(f, "({})", join(items)),
            Value::Map(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Closure(c) => match &c.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => f.write_str("<fn>"),
            },
            Value::Native(n) => write!(f, "<builtin {}>", n.name),
            Value::Actor(r) => write!(f, "{}", r),
            Value::Token(t) => write!(f, "<token {}>", t.0),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Unit, Value::Unit) => true,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.name == b.name,
            (Value::Actor(a), Value::Actor(b)) => a == b,
            (Value::Token(a), Value::Token(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(n) => n.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::String(s) => s.hash(state),
            Value::Unit => {}
            Value::List(items) | Value::Tuple(items) => items.hash(state),
            Value::Map(entries) => {
                // Order-insensitive so equal maps hash equally
                let mut acc: u64 = 0;
                for (k, v) in entries.iter() {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    k.hash(&mut h);
                    v.hash(&mut h);
                    acc = acc.wrapping_add(h.finish());
                }
                acc.hash(state);
            }
            Value::Closure(c) => (Arc::as_ptr(c) as usize).hash(state),
            Value::Native(n) => n.name.hash(state),
            Value::Actor(r) => r.id.hash(state),
            Value::Token(t) => t.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}
