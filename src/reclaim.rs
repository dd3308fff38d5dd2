//! Breaking scope cycles when an evaluation pass ends
//!
//! `let f = x -> ...` stores a closure in the scope the closure captured, and
//! the two keep each other alive. A [`PassLog`] remembers which scopes of the
//! current pass were captured by closures. When the pass ends, every such
//! scope (and its ancestors from the same pass) that no surviving value can
//! reach is emptied, which frees the cycle.
//!
//! A scope created during a pass can only become visible outside it through
//! a value that leaves the pass: a message argument, an offload reply
//! argument, an instance field, a binding or assignment into an older scope,
//! or the pass result. Those values are the roots.

use std::collections::{HashMap, HashSet};

use crate::env::{Env, Origin, WeakEnv};
use crate::value::Value;

const PRUNE_FLOOR: usize = 64;

pub struct PassLog {
    origin: Origin,
    captured: Vec<WeakEnv>,
    prune_at: usize,
    escaped: Vec<Value>,
}

impl PassLog {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            captured: Vec::new(),
            prune_at: PRUNE_FLOOR,
            escaped: Vec::new(),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// A closure of this pass closed over `env`
    pub fn captured(&mut self, env: &Env) {
        if env.origin().pass != self.origin.pass {
            return;
        }
        self.captured.push(env.downgrade());
        if self.captured.len() >= self.prune_at {
            self.captured.retain(WeakEnv::is_live);
            self.prune_at = (self.captured.len() * 2).max(PRUNE_FLOOR);
        }
    }

    /// `value` outlives the pass
    pub fn escaped(&mut self, value: &Value) {
        // Nothing can refer to this pass's scopes before a closure exists
        if !self.captured.is_empty() {
            self.escaped.push(value.clone());
        }
    }

    /// Empty the captured scopes of this pass that `roots` and the escaped
    /// values cannot reach. Returns how many scopes were emptied.
    pub fn sweep<'v>(self, roots: impl IntoIterator<Item = &'v Value>) -> usize {
        let pass = self.origin.pass;

        let mut candidates: HashMap<usize, Env> = HashMap::new();
        for weak in &self.captured {
            let mut scope = weak.upgrade();
            while let Some(env) = scope {
                if env.origin().pass != pass || candidates.contains_key(&env.id()) {
                    break;
                }
                scope = env.parent().cloned();
                candidates.insert(env.id(), env);
            }
        }
        if candidates.is_empty() {
            return 0;
        }

        let mut reached: HashSet<usize> = HashSet::new();
        let mut pending: Vec<Value> = roots.into_iter().cloned().collect();
        pending.extend(self.escaped);
        while let Some(value) = pending.pop() {
            match value {
                Value::Closure(closure) => {
                    // Older scopes never point back into this pass, so the
                    // walk stops at the first one
                    let mut scope = Some(closure.env.clone());
                    while let Some(env) = scope {
                        if env.origin().pass != pass || !reached.insert(env.id()) {
                            break;
                        }
                        pending.extend(env.local_values());
                        scope = env.parent().cloned();
                    }
                }
                Value::List(items) | Value::Tuple(items) => pending.extend(items.iter().cloned()),
                Value::Map(entries) => {
                    for (k, v) in entries.iter() {
                        pending.push(k.clone());
                        pending.push(v.clone());
                    }
                }
                _ => {}
            }
        }

        let mut emptied = 0;
        for (id, env) in candidates {
            if !reached.contains(&id) {
                drop(env.clear());
                emptied += 1;
            }
        }
        if emptied > 0 {
            tracing::trace!(pass, emptied, "reclaimed scopes");
        }
        emptied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::TOP_LEVEL;
    use crate::value::Closure;
    use std::sync::Arc;

    fn closure_over(env: &Env) -> Value {
        Value::Closure(Arc::new(Closure {
            params: vec!["x".into()],
            body: Arc::new(crate::parser::parse_expr("x").unwrap()),
            env: env.clone(),
            name: None,
        }))
    }

    #[test]
    fn test_self_cycle_is_emptied() {
        let global = Env::new();
        let origin = Origin::fresh(TOP_LEVEL);
        let mut log = PassLog::new(origin);
        let scope = global.extend(origin);
        let payload = Arc::new(vec![Value::Int(1), Value::Int(2)]);
        scope.bind("data", Value::List(payload.clone()));
        scope.bind("f", closure_over(&scope));
        log.captured(&scope);
        drop(scope);

        assert_eq!(log.sweep([]), 1);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_escaped_closure_keeps_its_scope() {
        let global = Env::new();
        let origin = Origin::fresh(TOP_LEVEL);
        let mut log = PassLog::new(origin);
        let scope = global.extend(origin);
        scope.bind("n", Value::Int(3));
        let f = closure_over(&scope);
        scope.bind("f", f.clone());
        log.captured(&scope);
        log.escaped(&Value::tuple(vec![f]));

        assert_eq!(log.sweep([]), 0);
        assert_eq!(scope.lookup("n").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_rooted_field_keeps_parent_chain() {
        let global = Env::new();
        let origin = Origin::fresh(7);
        let mut log = PassLog::new(origin);
        let outer = global.extend(origin);
        outer.bind("n", Value::Int(1));
        let inner = outer.extend(origin);
        let f = closure_over(&inner);
        inner.bind("f", f.clone());
        log.captured(&inner);

        assert_eq!(log.sweep([&f]), 0);
        assert_eq!(inner.lookup("n").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_older_scopes_are_left_alone() {
        let global = Env::new();
        let earlier = global.extend(Origin::fresh(7));
        earlier.bind("f", closure_over(&earlier));

        let mut log = PassLog::new(Origin::fresh(7));
        log.captured(&earlier);
        assert_eq!(log.sweep([]), 0);
        assert!(earlier.lookup("f").is_ok());
    }
}
