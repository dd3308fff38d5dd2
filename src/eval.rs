//! Tree-walking evaluator for Parley
//!
//! [`Interpreter`] owns everything shared by all evaluations: the global
//! scope, the refinement registry, the server table and the output sink.
//! An [`Evaluator`] is a short-lived view over it for one evaluation, carrying
//! the actor context when it runs inside a handler turn.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::*;
use crate::blocking_pool::OffloadOp;
use crate::builtins::{self, OutputSink, StdoutSink};
use crate::config::{RedeclarePolicy, DEFAULT_MAX_CALL_DEPTH};
use crate::env::{Env, Origin, TOP_LEVEL};
use crate::errors::{Error, RuntimeError};
use crate::parser;
use crate::reclaim::PassLog;
use crate::refinement::RefinementRegistry;
use crate::server::ServerTable;
use crate::value::{ActorRef, Closure, Value};

/// Non-local exit out of an expression
#[derive(Debug, Clone)]
pub enum Unwind {
    /// `return` travelling to the nearest call boundary
    Return(Value),
    Error(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(err: RuntimeError) -> Self {
        Unwind::Error(err)
    }
}

pub type EvalResult = Result<Value, Unwind>;

/// Native stack left before a call switches to a fresh segment
const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Close a call boundary: a pending `return` becomes the result
fn settle(result: EvalResult) -> Result<Value, RuntimeError> {
    match result {
        Ok(value) | Err(Unwind::Return(value)) => Ok(value),
        Err(Unwind::Error(err)) => Err(err),
    }
}

/// Operations the evaluator needs from the actor runtime
pub trait ActorHost: Send + Sync {
    fn spawn(&self, type_name: &str) -> Result<ActorRef, RuntimeError>;

    fn send(
        &self,
        target: &ActorRef,
        selector: &str,
        args: Vec<Value>,
        sender: Option<ActorRef>,
    ) -> Result<(), RuntimeError>;

    /// Run `op` off the scheduler and deliver `.selector(extra..., outcome)`
    /// to `requester` once it finishes or times out. Without a selector only
    /// a failure is reported, through the failure path.
    fn offload(
        &self,
        requester: &ActorRef,
        op: OffloadOp,
        selector: Option<String>,
        extra: Vec<Value>,
    ) -> Result<(), RuntimeError>;
}

/// The running handler's view of its own instance
pub struct ActorTurn<'a> {
    pub me: ActorRef,
    pub sender: Option<ActorRef>,
    pub fields: &'a mut HashMap<Ident, Value>,
}

pub struct Interpreter {
    global: Env,
    refinements: RefinementRegistry,
    servers: ServerTable,
    output: Arc<dyn OutputSink>,
    max_call_depth: usize,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(RedeclarePolicy::Reject, Arc::new(StdoutSink))
    }

    pub fn with_options(policy: RedeclarePolicy, output: Arc<dyn OutputSink>) -> Self {
        let global = Env::new();
        builtins::install(&global);
        Self {
            global,
            refinements: RefinementRegistry::new(policy),
            servers: ServerTable::new(policy),
            output,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    /// Calls nested deeper than `depth` fail instead of recursing further
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth.max(1);
        self
    }

    pub fn global(&self) -> &Env {
        &self.global
    }

    pub fn refinements(&self) -> &RefinementRegistry {
        &self.refinements
    }

    pub fn servers(&self) -> &ServerTable {
        &self.servers
    }

    pub fn output(&self) -> &dyn OutputSink {
        self.output.as_ref()
    }

    /// Register every declaration, then run the top-level statements in
    /// order. Returns the value of the last statement.
    pub fn load(
        &self,
        program: &Program,
        host: Option<&dyn ActorHost>,
    ) -> Result<Value, RuntimeError> {
        for item in &program.items {
            match item {
                Item::Type(decl) => self.refinements.declare(decl)?,
                Item::Server(decl) => {
                    self.servers.define(decl)?;
                }
                Item::Expr(_) => {}
            }
        }

        let mut evaluator = Evaluator::new(self, host);
        let result = program.items.iter().try_fold(Value::Unit, |last, item| match item {
            Item::Expr(expr) => settle(evaluator.eval(expr, &self.global)),
            _ => Ok(last),
        });
        evaluator.finish(&result);
        result
    }

    /// Parse and evaluate source without an actor runtime
    pub fn eval_source(&self, source: &str) -> Result<Value, Error> {
        let program = parser::parse_program(source)?;
        Ok(self.load(&program, None)?)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Evaluator<'a> {
    interp: &'a Interpreter,
    host: Option<&'a dyn ActorHost>,
    turn: Option<ActorTurn<'a>>,
    log: PassLog,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    /// Evaluation on behalf of top-level code
    pub fn new(interp: &'a Interpreter, host: Option<&'a dyn ActorHost>) -> Self {
        Self {
            interp,
            host,
            turn: None,
            log: PassLog::new(Origin::fresh(TOP_LEVEL)),
            depth: 0,
        }
    }

    pub fn for_turn(
        interp: &'a Interpreter,
        host: &'a dyn ActorHost,
        turn: ActorTurn<'a>,
    ) -> Self {
        let origin = Origin::fresh(turn.me.id.0);
        Self {
            interp,
            host: Some(host),
            turn: Some(turn),
            log: PassLog::new(origin),
            depth: 0,
        }
    }

    pub fn interpreter(&self) -> &'a Interpreter {
        self.interp
    }

    /// A scope below `parent` owned by this evaluation
    pub fn child_scope(&self, parent: &Env) -> Env {
        parent.extend(self.log.origin())
    }

    /// `value` is handed to something that outlives this evaluation
    pub fn note_escaped(&mut self, value: &Value) {
        self.log.escaped(value);
    }

    /// End the evaluation, releasing scopes nothing can reach any more.
    /// `result` and the instance fields stay reachable.
    pub fn finish(self, result: &Result<Value, RuntimeError>) {
        let mut roots: Vec<&Value> = Vec::new();
        match result {
            Ok(value) => roots.push(value),
            Err(err) => roots.extend(err.values()),
        }
        if let Some(turn) = &self.turn {
            roots.extend(turn.fields.values());
        }
        self.log.sweep(roots);
    }

    pub fn host(&self) -> Option<&'a dyn ActorHost> {
        self.host
    }

    /// The instance whose handler is running, if any
    pub fn current_actor(&self) -> Option<&ActorRef> {
        self.turn.as_ref().map(|t| &t.me)
    }

    /// Evaluate a function or handler body, absorbing `return`
    pub fn eval_body(&mut self, body: &Expr, env: &Env) -> Result<Value, RuntimeError> {
        settle(self.eval(body, env))
    }

    pub fn eval(&mut self, expr: &Expr, env: &Env) -> EvalResult {
        match &expr.node {
            ExprKind::Lit(lit) => Ok(literal_value(lit)),

            ExprKind::Var(name) => Ok(env.lookup(name)?),

            ExprKind::SelfRef => match &self.turn {
                Some(turn) => Ok(Value::Actor(turn.me.clone())),
                None => Err(RuntimeError::unbound("self").into()),
            },

            ExprKind::SelfField(field) => {
                let turn = self.turn_or_unbound(field)?;
                turn.fields
                    .get(field)
                    .cloned()
                    .ok_or_else(|| RuntimeError::unbound(format!("self.{}", field)).into())
            }

            ExprKind::Lambda { params, body } => {
                self.log.captured(env);
                Ok(Value::Closure(Arc::new(Closure {
                    params: params.clone(),
                    body: body.clone(),
                    env: env.clone(),
                    name: None,
                })))
            }

            ExprKind::Call { callee, args } => {
                let callee = self.eval(callee, env)?;
                let args = self.eval_all(args, env)?;
                Ok(self.call_value(&callee, args)?)
            }

            ExprKind::Let { pattern, value } => {
                let value = match (&pattern.node, &value.node) {
                    // A named lambda can call itself by name
                    (PatternKind::Var(name), ExprKind::Lambda { params, body }) => {
                        self.log.captured(env);
                        Value::Closure(Arc::new(Closure {
                            params: params.clone(),
                            body: body.clone(),
                            env: env.clone(),
                            name: Some(name.clone()),
                        }))
                    }
                    _ => self.eval(value, env)?,
                };

                let mut bindings = Vec::new();
                if !self.match_pattern(pattern, &value, &mut bindings)? {
                    return Err(RuntimeError::no_match(&value).into());
                }
                if env.origin().pass != self.log.origin().pass {
                    self.log.escaped(&value);
                }
                for (name, bound) in bindings {
                    env.bind(name, bound);
                }
                Ok(Value::Unit)
            }

            ExprKind::Assign { target, value } => {
                let value = self.eval(value, env)?;
                match target {
                    AssignTarget::Var(name) => {
                        let origin = self.log.origin();
                        if env.assign(name, value.clone(), origin.owner)?.pass != origin.pass {
                            self.log.escaped(&value);
                        }
                    }
                    AssignTarget::SelfField(field) => {
                        let turn = self.turn_or_unbound(field)?;
                        turn.fields.insert(field.clone(), value);
                    }
                }
                Ok(Value::Unit)
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.eval(cond, env)?;
                let taken = match cond {
                    Value::Bool(true) => Some(then_branch),
                    Value::Bool(false) => else_branch.as_ref(),
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "if condition must be Bool, got {}",
                            other.type_name()
                        ))
                        .into())
                    }
                };
                match taken {
                    Some(branch) => {
                        let scope = self.child_scope(env);
                        self.eval(branch, &scope)
                    }
                    None => Ok(Value::Unit),
                }
            }

            ExprKind::Block(stmts) => {
                let scope = self.child_scope(env);
                let mut last = Value::Unit;
                for stmt in stmts {
                    last = self.eval(stmt, &scope)?;
                }
                Ok(last)
            }

            ExprKind::Return(value) => {
                let value = match value {
                    Some(v) => self.eval(v, env)?,
                    None => Value::Unit,
                };
                Err(Unwind::Return(value))
            }

            ExprKind::Loop(body) => loop {
                let scope = self.child_scope(env);
                self.eval(body, &scope)?;
            },

            ExprKind::Match { scrutinee, arms } => {
                let value = self.eval(scrutinee, env)?;
                for arm in arms {
                    let mut bindings = Vec::new();
                    if self.match_pattern(&arm.pattern, &value, &mut bindings)? {
                        let scope = self.child_scope(env);
                        for (name, bound) in bindings {
                            scope.bind(name, bound);
                        }
                        return self.eval(&arm.body, &scope);
                    }
                }
                Err(RuntimeError::no_match(&value).into())
            }

            ExprKind::Throw(value) => {
                let value = self.eval(value, env)?;
                Err(RuntimeError::User(value).into())
            }

            ExprKind::BinOp { op, left, right } => self.eval_binop(*op, left, right, env),

            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval(operand, env)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Int(n)) => n
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| overflow("-").into()),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, other) => Err(RuntimeError::type_error(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))
                    .into()),
                    (UnaryOp::Not, other) => Err(RuntimeError::type_error(format!(
                        "`not` expects Bool, got {}",
                        other.type_name()
                    ))
                    .into()),
                }
            }

            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, env)?)),

            ExprKind::List(items) => Ok(Value::list(self.eval_all(items, env)?)),

            ExprKind::Spawn(type_name) => {
                let host = self.require_host("spawn")?;
                Ok(Value::Actor(host.spawn(type_name)?))
            }

            ExprKind::Send {
                target,
                selector,
                args,
            } => {
                let target = match self.eval(target, env)? {
                    Value::Actor(actor) => actor,
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "cannot send .{} to {}",
                            selector,
                            other.type_name()
                        ))
                        .into())
                    }
                };
                let args = self.eval_all(args, env)?;
                for arg in &args {
                    self.log.escaped(arg);
                }
                let sender = self.current_actor().cloned();
                self.require_host("send")?
                    .send(&target, selector, args, sender)?;
                Ok(Value::Unit)
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr], env: &Env) -> Result<Vec<Value>, Unwind> {
        exprs.iter().map(|e| self.eval(e, env)).collect()
    }

    /// Apply a closure or builtin to already-evaluated arguments
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let limit = self.interp.max_call_depth;
        if self.depth >= limit {
            return Err(RuntimeError::CallDepth { limit });
        }
        self.depth += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.apply(callee, args)
        });
        self.depth -= 1;
        result
    }

    fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Closure(closure) => {
                if closure.params.len() != args.len() {
                    return Err(RuntimeError::Arity {
                        callee: closure.name.clone().unwrap_or_else(|| "<fn>".into()),
                        expected: closure.params.len(),
                        found: args.len(),
                    });
                }
                let scope = self.child_scope(&closure.env);
                if let Some(name) = &closure.name {
                    scope.bind(name.clone(), callee.clone());
                }
                for (param, arg) in closure.params.iter().zip(args) {
                    scope.bind(param.clone(), arg);
                }
                self.eval_body(&closure.body, &scope)
            }
            Value::Native(native) => {
                if !native.arity.accepts(args.len()) {
                    return Err(RuntimeError::Arity {
                        callee: native.name.to_string(),
                        expected: native.arity.minimum(),
                        found: args.len(),
                    });
                }
                (native.func)(self, args)
            }
            other => Err(RuntimeError::type_error(format!(
                "cannot call a value of type {}",
                other.type_name()
            ))),
        }
    }

    fn eval_binop(&mut self, op: BinOp, left: &Expr, right: &Expr, env: &Env) -> EvalResult {
        // Short-circuit forms evaluate the right side only when needed
        if matches!(op, BinOp::And | BinOp::Or) {
            let lhs = self.eval(left, env)?.as_bool()?;
            if (op == BinOp::And && !lhs) || (op == BinOp::Or && lhs) {
                return Ok(Value::Bool(lhs));
            }
            return Ok(Value::Bool(self.eval(right, env)?.as_bool()?));
        }

        let lhs = self.eval(left, env)?;
        let rhs = self.eval(right, env)?;
        Ok(apply_binop(op, &lhs, &rhs)?)
    }

    /// Try to match `value` against `pattern`, collecting bindings
    pub fn match_pattern(
        &mut self,
        pattern: &Pattern,
        value: &Value,
        bindings: &mut Vec<(Ident, Value)>,
    ) -> Result<bool, RuntimeError> {
        match &pattern.node {
            PatternKind::Wildcard => Ok(true),
            PatternKind::Var(name) => {
                bindings.push((name.clone(), value.clone()));
                Ok(true)
            }
            PatternKind::Lit(lit) => Ok(&literal_value(lit) == value),
            PatternKind::Tuple(parts) => match value {
                Value::Tuple(items) if items.len() == parts.len() => {
                    for (part, item) in parts.iter().zip(items.iter()) {
                        if !self.match_pattern(part, item, bindings)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                _ => Ok(false),
            },
            PatternKind::Refined { binder, type_name } => {
                let interp = self.interp;
                if !interp.refinements.test(self, type_name, value)? {
                    return Ok(false);
                }
                if let Some(name) = binder {
                    bindings.push((name.clone(), value.clone()));
                }
                Ok(true)
            }
        }
    }

    fn require_host(&self, what: &str) -> Result<&'a dyn ActorHost, RuntimeError> {
        self.host.ok_or_else(|| {
            RuntimeError::type_error(format!("`{}` needs the actor runtime", what))
        })
    }

    fn turn_or_unbound(&mut self, field: &str) -> Result<&mut ActorTurn<'a>, RuntimeError> {
        self.turn
            .as_mut()
            .ok_or_else(|| RuntimeError::unbound(format!("self.{}", field)))
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::String(s) => Value::string(s),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Unit => Value::Unit,
    }
}

fn overflow(op: &str) -> RuntimeError {
    RuntimeError::type_error(format!("integer overflow in `{}`", op))
}

/// Strict binary operators; `&&` and `||` are handled by the evaluator
pub fn apply_binop(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    use Value::*;

    let checked = |result: Option<i64>| result.map(Int).ok_or_else(|| overflow(op.symbol()));

    match (op, lhs, rhs) {
        (BinOp::Add, Int(a), Int(b)) => checked(a.checked_add(*b)),
        (BinOp::Sub, Int(a), Int(b)) => checked(a.checked_sub(*b)),
        (BinOp::Mul, Int(a), Int(b)) => checked(a.checked_mul(*b)),
        (BinOp::Div | BinOp::Mod, Int(_), Int(0)) => Err(RuntimeError::DivisionByZero),
        (BinOp::Div, Int(a), Int(b)) => checked(a.checked_div(*b)),
        (BinOp::Mod, Int(a), Int(b)) => checked(a.checked_rem(*b)),

        (BinOp::Eq, a, b) => Ok(Bool(a == b)),
        (BinOp::Neq, a, b) => Ok(Bool(a != b)),

        (BinOp::Lt, Int(a), Int(b)) => Ok(Bool(a < b)),
        (BinOp::Gt, Int(a), Int(b)) => Ok(Bool(a > b)),
        (BinOp::Lte, Int(a), Int(b)) => Ok(Bool(a <= b)),
        (BinOp::Gte, Int(a), Int(b)) => Ok(Bool(a >= b)),
        (BinOp::Lt, String(a), String(b)) => Ok(Bool(a < b)),
        (BinOp::Gt, String(a), String(b)) => Ok(Bool(a > b)),
        (BinOp::Lte, String(a), String(b)) => Ok(Bool(a <= b)),
        (BinOp::Gte, String(a), String(b)) => Ok(Bool(a >= b)),

        (BinOp::Concat, String(a), String(b)) => Ok(Value::string(format!("{}{}", a, b))),
        (BinOp::Concat, List(a), List(b)) => {
            let mut items = Vec::with_capacity(a.len() + b.len());
            items.extend(a.iter().cloned());
            items.extend(b.iter().cloned());
            Ok(Value::list(items))
        }

        (op, a, b) => Err(RuntimeError::type_error(format!(
            "cannot apply `{}` to {} and {}",
            op,
            a.type_name(),
            b.type_name()
        ))),
    }
}
