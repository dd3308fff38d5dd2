//! Server (actor type) definitions
//!
//! A [`ServerType`] is the handler table built from a `server` block.
//! Selectors are resolved to handler indices once, when the block is
//! registered; a send resolves its selector against the target's table at
//! enqueue time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ast::{Expr, ExprKind, Ident, ServerDecl};
use crate::config::RedeclarePolicy;
use crate::errors::RuntimeError;

pub type HandlerId = usize;

pub const INIT_SELECTOR: &str = "init";
pub const FAILURE_SELECTOR: &str = "failure";

#[derive(Debug, Clone)]
pub struct Handler {
    pub selector: Ident,
    pub params: Vec<Ident>,
    pub body: Arc<Expr>,
}

/// A selector after lookup in a server's handler table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Known(HandlerId),
    /// Still delivered; fails in the receiver's turn
    Unknown(Ident),
}

#[derive(Debug)]
pub struct ServerType {
    pub name: Arc<str>,
    handlers: Vec<Handler>,
    selectors: HashMap<Ident, HandlerId>,
    /// Selectors sent to `self` that this server has no handler for
    unknown_self_sends: Vec<Ident>,
}

impl ServerType {
    pub fn from_decl(decl: &ServerDecl) -> Result<Self, RuntimeError> {
        let mut handlers = Vec::with_capacity(decl.handlers.len());
        let mut selectors = HashMap::new();

        for h in &decl.handlers {
            if selectors.insert(h.selector.clone(), handlers.len()).is_some() {
                return Err(RuntimeError::DuplicateDeclaration {
                    what: "handler",
                    name: format!("{}.{}", decl.name, h.selector),
                });
            }
            handlers.push(Handler {
                selector: h.selector.clone(),
                params: h.params.clone(),
                body: h.body.clone(),
            });
        }

        let mut self_sends = Vec::new();
        for h in &handlers {
            collect_self_sends(&h.body, &mut self_sends);
        }
        let mut unknown_self_sends: Vec<Ident> = self_sends
            .into_iter()
            .filter(|sel| !selectors.contains_key(sel))
            .collect();
        unknown_self_sends.sort();
        unknown_self_sends.dedup();

        Ok(Self {
            name: Arc::from(decl.name.as_str()),
            handlers,
            selectors,
            unknown_self_sends,
        })
    }

    pub fn resolve(&self, selector: &str) -> Selector {
        match self.selectors.get(selector) {
            Some(&id) => Selector::Known(id),
            None => Selector::Unknown(selector.to_string()),
        }
    }

    pub fn handler(&self, id: HandlerId) -> &Handler {
        &self.handlers[id]
    }

    pub fn init(&self) -> Option<HandlerId> {
        self.selectors.get(INIT_SELECTOR).copied()
    }

    pub fn failure(&self) -> Option<HandlerId> {
        self.selectors.get(FAILURE_SELECTOR).copied()
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.selector.as_str())
    }

    pub fn unknown_self_sends(&self) -> &[Ident] {
        &self.unknown_self_sends
    }
}

/// Selectors of every `self (.sel ...)` inside `expr`
fn collect_self_sends(expr: &Expr, out: &mut Vec<Ident>) {
    match &expr.node {
        ExprKind::Send {
            target,
            selector,
            args,
        } => {
            if matches!(target.node, ExprKind::SelfRef) {
                out.push(selector.clone());
            }
            collect_self_sends(target, out);
            args.iter().for_each(|a| collect_self_sends(a, out));
        }
        ExprKind::Lambda { body, .. } | ExprKind::Loop(body) | ExprKind::Throw(body) => {
            collect_self_sends(body, out)
        }
        ExprKind::Call { callee, args } => {
            collect_self_sends(callee, out);
            args.iter().for_each(|a| collect_self_sends(a, out));
        }
        ExprKind::Let { value, .. } | ExprKind::Assign { value, .. } => {
            collect_self_sends(value, out)
        }
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_self_sends(cond, out);
            collect_self_sends(then_branch, out);
            if let Some(e) = else_branch {
                collect_self_sends(e, out);
            }
        }
        ExprKind::Block(items) | ExprKind::Tuple(items) | ExprKind::List(items) => {
            items.iter().for_each(|e| collect_self_sends(e, out))
        }
        ExprKind::Return(value) => {
            if let Some(e) = value {
                collect_self_sends(e, out);
            }
        }
        ExprKind::Match { scrutinee, arms } => {
            collect_self_sends(scrutinee, out);
            arms.iter().for_each(|arm| collect_self_sends(&arm.body, out));
        }
        ExprKind::BinOp { left, right, .. } => {
            collect_self_sends(left, out);
            collect_self_sends(right, out);
        }
        ExprKind::UnaryOp { operand, .. } => collect_self_sends(operand, out),
        ExprKind::Lit(_)
        | ExprKind::Var(_)
        | ExprKind::SelfRef
        | ExprKind::SelfField(_)
        | ExprKind::Spawn(_) => {}
    }
}

/// All registered server types
pub struct ServerTable {
    types: RwLock<HashMap<Ident, Arc<ServerType>>>,
    policy: RedeclarePolicy,
}

impl ServerTable {
    pub fn new(policy: RedeclarePolicy) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn define(&self, decl: &ServerDecl) -> Result<Arc<ServerType>, RuntimeError> {
        let server = Arc::new(ServerType::from_decl(decl)?);

        for selector in server.unknown_self_sends() {
            tracing::warn!(
                server = %server.name,
                selector = %selector,
                "server sends .{} to itself but has no such handler",
                selector
            );
        }

        let mut types = self.types.write();
        if types.contains_key(&decl.name) && self.policy == RedeclarePolicy::Reject {
            return Err(RuntimeError::DuplicateDeclaration {
                what: "server",
                name: decl.name.clone(),
            });
        }
        types.insert(decl.name.clone(), server.clone());
        tracing::debug!(server = %server.name, handlers = server.handlers.len(), "defined server");
        Ok(server)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerType>> {
        self.types.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<Ident> {
        let mut names: Vec<Ident> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn server(src: &str) -> Result<ServerType, RuntimeError> {
        let program = parse_program(src).unwrap();
        let decl = program.servers().next().unwrap();
        ServerType::from_decl(decl)
    }

    #[test]
    fn test_selector_resolution() {
        let ty = server("server W { .init -> 1; .work n -> n }").unwrap();
        assert_eq!(ty.init(), Some(0));
        assert_eq!(ty.resolve("work"), Selector::Known(1));
        assert_eq!(ty.resolve("nope"), Selector::Unknown("nope".into()));
        assert_eq!(ty.failure(), None);
        assert_eq!(ty.selectors().collect::<Vec<_>>(), vec!["init", "work"]);
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        assert!(matches!(
            server("server W { .a -> 1; .a -> 2 }"),
            Err(RuntimeError::DuplicateDeclaration { what: "handler", .. })
        ));
    }

    #[test]
    fn test_unknown_self_sends_detected() {
        let ty = server(
            "server W {\n  .start -> { self (.tick); self (.tock 1) }\n  .tick -> ()\n}",
        )
        .unwrap();
        assert_eq!(ty.unknown_self_sends(), &["tock".to_string()]);
    }

    #[test]
    fn test_table_redeclare_policy() {
        let program = parse_program("server A { .x -> 1 }").unwrap();
        let decl = program.server("A").unwrap();

        let strict = ServerTable::new(RedeclarePolicy::Reject);
        strict.define(decl).unwrap();
        assert!(strict.define(decl).is_err());

        let lenient = ServerTable::new(RedeclarePolicy::Overwrite);
        lenient.define(decl).unwrap();
        assert!(lenient.define(decl).is_ok());
        assert_eq!(lenient.names(), vec!["A".to_string()]);
    }
}
