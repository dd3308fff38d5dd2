//! Lexical environments
//!
//! A scope is a shared, lockable table of cells with a link to its parent.
//! Closures hold an [`Env`] handle, so assignments made after a closure was
//! created are visible through it.
//!
//! Every scope remembers the [`Origin`] that created it. Only the owner of a
//! scope may reassign its cells: top-level code owns the global scope, and an
//! instance owns the scopes its turns create.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::ast::Ident;
use crate::errors::{find_similar, RuntimeError};
use crate::value::Value;

/// Owner id of scopes created by top-level code
pub const TOP_LEVEL: u64 = 0;

static NEXT_PASS: AtomicU64 = AtomicU64::new(1);

/// The evaluation pass that created a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Origin {
    /// Instance id, or [`TOP_LEVEL`]
    pub owner: u64,
    /// One per handler turn or top-level load; 0 for root scopes
    pub pass: u64,
}

impl Origin {
    /// A new pass on behalf of `owner`
    pub fn fresh(owner: u64) -> Self {
        Origin {
            owner,
            pass: NEXT_PASS.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct Env(Arc<Scope>);

/// Non-owning handle to a scope
#[derive(Clone)]
pub struct WeakEnv(Weak<Scope>);

impl WeakEnv {
    pub fn upgrade(&self) -> Option<Env> {
        self.0.upgrade().map(Env)
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

struct Scope {
    vars: RwLock<HashMap<Ident, Value>>,
    parent: Option<Env>,
    origin: Origin,
}

impl Env {
    /// A root scope with no parent, owned by top-level code
    pub fn new() -> Self {
        Env(Arc::new(Scope {
            vars: RwLock::new(HashMap::new()),
            parent: None,
            origin: Origin::default(),
        }))
    }

    /// Child scope for a call, a block, a loop iteration or a match arm
    pub fn extend(&self, origin: Origin) -> Env {
        Env(Arc::new(Scope {
            vars: RwLock::new(HashMap::new()),
            parent: Some(self.clone()),
            origin,
        }))
    }

    pub fn origin(&self) -> Origin {
        self.0.origin
    }

    pub fn parent(&self) -> Option<&Env> {
        self.0.parent.as_ref()
    }

    pub fn downgrade(&self) -> WeakEnv {
        WeakEnv(Arc::downgrade(&self.0))
    }

    /// Address of the scope, stable while any handle is alive
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Values bound directly in this scope
    pub fn local_values(&self) -> Vec<Value> {
        self.0.vars.read().values().cloned().collect()
    }

    /// Drop every binding in this scope, returning them
    pub fn clear(&self) -> HashMap<Ident, Value> {
        std::mem::take(&mut *self.0.vars.write())
    }

    /// Introduce a binding in this scope, shadowing any outer one
    pub fn bind(&self, name: impl Into<Ident>, value: Value) {
        self.0.vars.write().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.0.vars.read().get(name) {
                return Some(value.clone());
            }
            scope = scope.0.parent.as_ref()?;
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Value, RuntimeError> {
        self.get(name).ok_or_else(|| self.unbound(name))
    }

    /// Overwrite the nearest existing binding of `name` on behalf of
    /// `writer`. Returns the origin of the scope holding the cell.
    pub fn assign(&self, name: &str, value: Value, writer: u64) -> Result<Origin, RuntimeError> {
        let mut scope = self;
        loop {
            {
                let mut vars = scope.0.vars.write();
                if let Some(cell) = vars.get_mut(name) {
                    let origin = scope.0.origin;
                    if origin.owner != writer {
                        return Err(RuntimeError::type_error(format!(
                            "`{}` belongs to {} and is read-only here",
                            name,
                            describe_owner(origin.owner)
                        )));
                    }
                    *cell = value;
                    return Ok(origin);
                }
            }
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => return Err(self.unbound(name)),
            }
        }
    }

    /// Every name visible from this scope
    pub fn names(&self) -> Vec<Ident> {
        let mut names = Vec::new();
        let mut scope = Some(self);
        while let Some(env) = scope {
            names.extend(env.0.vars.read().keys().cloned());
            scope = env.0.parent.as_ref();
        }
        names.sort();
        names.dedup();
        names
    }

    fn unbound(&self, name: &str) -> RuntimeError {
        let names = self.names();
        RuntimeError::Name {
            name: name.to_string(),
            suggestions: find_similar(name, names.iter().map(String::as_str), 2),
        }
    }
}

fn describe_owner(owner: u64) -> String {
    match owner {
        TOP_LEVEL => "top-level code".to_string(),
        id => format!("instance #{}", id),
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}
