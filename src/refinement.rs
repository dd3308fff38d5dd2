//! Predicate-defined refinement types
//!
//! `type Nat = x -> x >= 0` registers `Nat`; a pattern `n : Nat` matches
//! when the predicate returns `true` for the scrutinee. Predicates run in a
//! fresh scope whose parent is the global scope, so they see globals and
//! their parameter but nothing from the match site.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ast::{Expr, Ident, TypeDecl};
use crate::config::RedeclarePolicy;
use crate::errors::RuntimeError;
use crate::eval::Evaluator;
use crate::value::Value;

/// Tag names that refine to "has this runtime tag" without a declaration
pub const BUILTIN_TYPES: &[&str] = &[
    "Int", "Bool", "String", "Unit", "List", "Tuple", "Map", "Fn", "Actor", "Token",
];

#[derive(Debug, Clone)]
pub struct Refinement {
    pub name: Ident,
    pub param: Ident,
    pub predicate: Arc<Expr>,
}

pub struct RefinementRegistry {
    table: RwLock<HashMap<Ident, Arc<Refinement>>>,
    policy: RedeclarePolicy,
}

impl RefinementRegistry {
    pub fn new(policy: RedeclarePolicy) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn declare(&self, decl: &TypeDecl) -> Result<(), RuntimeError> {
        if BUILTIN_TYPES.contains(&decl.name.as_str()) {
            return Err(RuntimeError::DuplicateDeclaration {
                what: "builtin type",
                name: decl.name.clone(),
            });
        }

        let mut table = self.table.write();
        if table.contains_key(&decl.name) && self.policy == RedeclarePolicy::Reject {
            return Err(RuntimeError::DuplicateDeclaration {
                what: "type",
                name: decl.name.clone(),
            });
        }

        table.insert(
            decl.name.clone(),
            Arc::new(Refinement {
                name: decl.name.clone(),
                param: decl.param.clone(),
                predicate: decl.predicate.clone(),
            }),
        );
        tracing::debug!(refinement = %decl.name, "declared refinement");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Refinement>> {
        self.table.read().get(name).cloned()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        BUILTIN_TYPES.contains(&name) || self.table.read().contains_key(name)
    }

    /// Whether `value` belongs to the refinement `name`. Any failure while
    /// deciding, including a non-Bool predicate result, is a match error
    /// carrying the cause.
    pub fn test(
        &self,
        ev: &mut Evaluator<'_>,
        name: &str,
        value: &Value,
    ) -> Result<bool, RuntimeError> {
        if BUILTIN_TYPES.contains(&name) {
            return Ok(value.type_name() == name);
        }

        let failed = |cause: RuntimeError| RuntimeError::Match {
            message: format!("refinement {} could not be decided for {}", name, value.repr()),
            cause: Some(Box::new(cause)),
        };

        // The lock is released before the predicate runs; predicates may
        // themselves match on refinements
        let refinement = self
            .get(name)
            .ok_or_else(|| failed(RuntimeError::unbound(name)))?;

        let scope = ev.child_scope(ev.interpreter().global());
        scope.bind(refinement.param.clone(), value.clone());

        match ev.eval_body(&refinement.predicate, &scope) {
            Ok(Value::Bool(holds)) => Ok(holds),
            Ok(other) => Err(failed(RuntimeError::type_error(format!(
                "predicate returned {}, expected Bool",
                other.type_name()
            )))),
            Err(err) => Err(failed(err)),
        }
    }
}
