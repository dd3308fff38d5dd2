//! Runtime: server instances, mailboxes, and the turn scheduler
//!
//! Every spawned instance owns a FIFO mailbox and its private fields. A fixed
//! pool of scheduler threads runs turns: one message, one handler, start to
//! finish. An instance is in the run queue at most once at a time, so two
//! turns of the same instance never overlap while distinct instances run in
//! parallel.
//!
//! Quiescence is tracked with a single in-flight counter: it counts queued or
//! running messages plus outstanding offloads. A message is counted before it
//! is queued and released only after its turn (and anything the turn sent)
//! has been accounted for, so the counter reaching zero means nothing is left
//! to run.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::ast::{Ident, Program};
use crate::blocking_pool::{BlockingPool, Mailer, OffloadOp, OffloadOutcome, PendingOffload};
use crate::builtins::{OutputSink, StdoutSink};
use crate::config::RuntimeConfig;
use crate::errors::RuntimeError;
use crate::eval::{ActorHost, ActorTurn, Evaluator, Interpreter};
use crate::server::{Selector, ServerType, FAILURE_SELECTOR};
use crate::value::{ActorId, ActorRef, Value};

/// Handlers recurse on the native stack
const SCHEDULER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Lifecycle of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Spawned; `.init` has not finished yet
    Initializing,
    Idle,
    Processing,
    Stopped,
}

/// A turn that ended in an error
#[derive(Debug, Clone)]
pub struct Failure {
    pub actor: ActorRef,
    pub selector: Ident,
    pub error: RuntimeError,
}

/// Outcome of [`Runtime::run_main`]
#[derive(Debug)]
pub struct RunReport {
    pub main: ActorRef,
    pub failures: Vec<Failure>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
struct Envelope {
    selector: Selector,
    args: Vec<Value>,
    sender: Option<ActorRef>,
}

struct Mailbox {
    queue: VecDeque<Envelope>,
    state: InstanceState,
    /// Queued in the run queue or running a turn
    scheduled: bool,
}

struct Instance {
    me: ActorRef,
    ty: Arc<ServerType>,
    mailbox: Mutex<Mailbox>,
    fields: Mutex<HashMap<Ident, Value>>,
}

impl Instance {
    fn selector_name(&self, selector: &Selector) -> Ident {
        match selector {
            Selector::Known(id) => self.ty.handler(*id).selector.clone(),
            Selector::Unknown(name) => name.clone(),
        }
    }
}

enum RunItem {
    Turn(Arc<Instance>),
    Shutdown,
}

struct Shared {
    interp: Interpreter,
    instances: RwLock<HashMap<ActorId, Arc<Instance>>>,
    next_id: AtomicU64,
    run_tx: Sender<RunItem>,
    in_flight: Mutex<usize>,
    quiescent: Condvar,
    failures: Mutex<Vec<Failure>>,
    pool: BlockingPool,
}

impl Shared {
    fn begin_one(&self) {
        *self.in_flight.lock() += 1;
    }

    fn finish_one(&self) {
        self.finish_many(1);
    }

    fn finish_many(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(n);
        if *in_flight == 0 {
            self.quiescent.notify_all();
        }
    }

    fn instance(&self, id: ActorId) -> Option<Arc<Instance>> {
        self.instances.read().get(&id).cloned()
    }

    fn schedule(&self, instance: Arc<Instance>) {
        if self.run_tx.send(RunItem::Turn(instance)).is_err() {
            tracing::debug!("scheduler gone; turn dropped");
        }
    }

    fn enqueue(&self, instance: &Arc<Instance>, envelope: Envelope) {
        self.begin_one();
        let mut mailbox = instance.mailbox.lock();
        if mailbox.state == InstanceState::Stopped {
            drop(mailbox);
            tracing::debug!(actor = %instance.me, "message to stopped instance dropped");
            self.finish_one();
            return;
        }
        mailbox.queue.push_back(envelope);
        if !mailbox.scheduled {
            mailbox.scheduled = true;
            self.schedule(Arc::clone(instance));
        }
    }

    fn spawn_instance(&self, ty: Arc<ServerType>, init_args: Vec<Value>) -> ActorRef {
        let id = ActorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let me = ActorRef {
            id,
            type_name: Arc::clone(&ty.name),
        };
        let init = ty.init();
        let instance = Arc::new(Instance {
            me: me.clone(),
            ty,
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                state: if init.is_some() {
                    InstanceState::Initializing
                } else {
                    InstanceState::Idle
                },
                scheduled: false,
            }),
            fields: Mutex::new(HashMap::new()),
        });
        self.instances.write().insert(id, Arc::clone(&instance));
        tracing::debug!(actor = %me, "spawned");

        if let Some(init) = init {
            self.enqueue(
                &instance,
                Envelope {
                    selector: Selector::Known(init),
                    args: init_args,
                    sender: None,
                },
            );
        }
        me
    }

    /// Run one message of `instance`
    fn run_turn(&self, instance: &Arc<Instance>) {
        let envelope = {
            let mut mailbox = instance.mailbox.lock();
            match mailbox.queue.pop_front() {
                Some(envelope) => {
                    if mailbox.state != InstanceState::Initializing {
                        mailbox.state = InstanceState::Processing;
                    }
                    envelope
                }
                None => {
                    mailbox.scheduled = false;
                    return;
                }
            }
        };

        let selector = instance.selector_name(&envelope.selector);
        tracing::debug!(actor = %instance.me, selector = %selector, "turn");
        if let Err(error) = self.execute(instance, envelope) {
            self.record_failure(instance, selector, error);
        }

        {
            let mut mailbox = instance.mailbox.lock();
            if mailbox.state != InstanceState::Stopped {
                mailbox.state = InstanceState::Idle;
            }
            if mailbox.queue.is_empty() {
                mailbox.scheduled = false;
            } else {
                self.schedule(Arc::clone(instance));
            }
        }
        self.finish_one();
    }

    fn execute(&self, instance: &Instance, envelope: Envelope) -> Result<Value, RuntimeError> {
        let handler_id = match envelope.selector {
            Selector::Known(id) => id,
            Selector::Unknown(selector) => {
                return Err(RuntimeError::Selector {
                    actor_type: instance.ty.name.to_string(),
                    selector,
                })
            }
        };
        let handler = instance.ty.handler(handler_id);
        if handler.params.len() != envelope.args.len() {
            return Err(RuntimeError::Arity {
                callee: format!("{}.{}", instance.ty.name, handler.selector),
                expected: handler.params.len(),
                found: envelope.args.len(),
            });
        }

        let sender = envelope
            .sender
            .clone()
            .map(Value::Actor)
            .unwrap_or(Value::Unit);

        let mut fields = instance.fields.lock();
        let turn = ActorTurn {
            me: instance.me.clone(),
            sender: envelope.sender,
            fields: &mut fields,
        };
        let mut evaluator = Evaluator::for_turn(&self.interp, self, turn);

        let scope = evaluator.child_scope(self.interp.global());
        scope.bind("sender", sender);
        for (param, arg) in handler.params.iter().zip(envelope.args) {
            scope.bind(param.clone(), arg);
        }

        let result = evaluator.eval_body(&handler.body, &scope);
        evaluator.finish(&result);
        result
    }

    fn record_failure(&self, instance: &Arc<Instance>, selector: Ident, error: RuntimeError) {
        tracing::warn!(
            actor = %instance.me,
            selector = %selector,
            error = %error,
            "handler failed"
        );
        let message = error.to_string();
        self.failures.lock().push(Failure {
            actor: instance.me.clone(),
            selector: selector.clone(),
            error,
        });

        if selector == FAILURE_SELECTOR {
            return;
        }
        if let Some(failure) = instance.ty.failure() {
            self.enqueue(
                instance,
                Envelope {
                    selector: Selector::Known(failure),
                    args: vec![Value::string(&selector), Value::string(message)],
                    sender: None,
                },
            );
        }
    }

    fn stop(&self, instance: &Instance) {
        let drained = {
            let mut mailbox = instance.mailbox.lock();
            mailbox.state = InstanceState::Stopped;
            let drained = mailbox.queue.len();
            mailbox.queue.clear();
            drained
        };
        tracing::debug!(actor = %instance.me, drained, "stopped");
        self.finish_many(drained);
    }
}

impl ActorHost for Shared {
    fn spawn(&self, type_name: &str) -> Result<ActorRef, RuntimeError> {
        let ty = self
            .interp
            .servers()
            .get(type_name)
            .ok_or_else(|| RuntimeError::UnknownServer(type_name.to_string()))?;
        Ok(self.spawn_instance(ty, Vec::new()))
    }

    fn send(
        &self,
        target: &ActorRef,
        selector: &str,
        args: Vec<Value>,
        sender: Option<ActorRef>,
    ) -> Result<(), RuntimeError> {
        let instance = self.instance(target.id).ok_or_else(|| {
            RuntimeError::type_error(format!("{} is not a live actor", target))
        })?;
        let selector = instance.ty.resolve(selector);
        tracing::debug!(to = %target, selector = ?selector, "send");
        self.enqueue(
            &instance,
            Envelope {
                selector,
                args,
                sender,
            },
        );
        Ok(())
    }

    fn offload(
        &self,
        requester: &ActorRef,
        op: OffloadOp,
        selector: Option<String>,
        extra: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let pending = PendingOffload {
            requester: requester.clone(),
            selector,
            extra,
            op_name: op.name(),
        };
        tracing::debug!(actor = %requester, op = op.name(), "offload");
        self.begin_one();
        match self.pool.submit(op, pending) {
            Ok(_) => Ok(()),
            Err(pending) => {
                self.finish_one();
                Err(RuntimeError::Offload(format!(
                    "{}: offload pool is shut down",
                    pending.op_name
                )))
            }
        }
    }
}

impl Mailer for Shared {
    fn complete(&self, pending: PendingOffload, outcome: OffloadOutcome) {
        match &pending.selector {
            Some(selector) => {
                let args = pending.reply_args(outcome);
                if let Err(err) = self.send(&pending.requester, selector, args, None) {
                    tracing::warn!(actor = %pending.requester, error = %err, "offload result undeliverable");
                }
            }
            None => {
                if let (Err(message), Some(instance)) =
                    (outcome, self.instance(pending.requester.id))
                {
                    self.record_failure(
                        &instance,
                        pending.op_name.into(),
                        RuntimeError::Offload(message),
                    );
                }
            }
        }
        self.finish_one();
    }
}

/// Handle to a running actor system
pub struct Runtime {
    shared: Arc<Shared>,
    run_tx: Sender<RunItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_output(config, Arc::new(StdoutSink))
    }

    pub fn with_output(config: RuntimeConfig, output: Arc<dyn OutputSink>) -> Self {
        let (run_tx, run_rx) = channel::unbounded();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let mailer: Weak<dyn Mailer> = weak.clone();
            Shared {
                interp: Interpreter::with_options(config.redeclare, output)
                    .with_max_call_depth(config.max_call_depth),
                instances: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                run_tx: run_tx.clone(),
                in_flight: Mutex::new(0),
                quiescent: Condvar::new(),
                failures: Mutex::new(Vec::new()),
                pool: BlockingPool::new(config.offload_workers, config.offload_timeout, mailer),
            }
        });

        let mut workers = Vec::with_capacity(config.workers);
        for n in 0..config.workers.max(1) {
            let shared = Arc::clone(&shared);
            let run_rx: Receiver<RunItem> = run_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("parley-worker-{}", n))
                .stack_size(SCHEDULER_STACK_SIZE)
                .spawn(move || worker_loop(shared, run_rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => tracing::error!(error = %err, "failed to spawn scheduler worker"),
            }
        }
        tracing::debug!(
            workers = workers.len(),
            offload_workers = shared.pool.worker_count(),
            offload_timeout = ?shared.pool.timeout(),
            "runtime started"
        );

        Self {
            shared,
            run_tx,
            workers: Mutex::new(workers),
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.shared.interp
    }

    /// Register declarations and run top-level statements with this
    /// runtime as the actor host
    pub fn load(&self, program: &Program) -> Result<Value, RuntimeError> {
        self.shared.interp.load(program, Some(&*self.shared))
    }

    pub fn spawn(&self, type_name: &str) -> Result<ActorRef, RuntimeError> {
        self.shared.spawn(type_name)
    }

    /// Send from outside any actor; the handler sees `sender` as `()`
    pub fn send(
        &self,
        target: &ActorRef,
        selector: &str,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        self.shared.send(target, selector, args, None)
    }

    /// Load `program`, spawn `Main` with `.init(args)` and wait until
    /// nothing is left to run
    pub fn run_main(&self, program: &Program, args: Vec<Value>) -> Result<RunReport, RuntimeError> {
        self.load(program)?;
        let main = self.start_main(args)?;
        self.wait_idle();
        Ok(RunReport {
            main,
            failures: self.take_failures(),
        })
    }

    /// Spawn `Main`. Its `.init` gets the argument list when it takes a
    /// parameter.
    pub fn start_main(&self, args: Vec<Value>) -> Result<ActorRef, RuntimeError> {
        let ty = self
            .shared
            .interp
            .servers()
            .get("Main")
            .ok_or_else(|| RuntimeError::UnknownServer("Main".into()))?;
        let init_args = match ty.init().map(|id| ty.handler(id).params.len()) {
            Some(1) => vec![Value::list(args)],
            _ => Vec::new(),
        };
        Ok(self.shared.spawn_instance(ty, init_args))
    }

    /// Block until no message is queued or running and no offload is
    /// outstanding
    pub fn wait_idle(&self) {
        let mut in_flight = self.shared.in_flight.lock();
        while *in_flight > 0 {
            self.shared.quiescent.wait(&mut in_flight);
        }
    }

    /// [`Runtime::wait_idle`] with a bound; `false` if work remains
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight.lock();
        while *in_flight > 0 {
            if self
                .shared
                .quiescent
                .wait_until(&mut in_flight, deadline)
                .timed_out()
            {
                return *in_flight == 0;
            }
        }
        true
    }

    pub fn state_of(&self, actor: &ActorRef) -> Option<InstanceState> {
        self.shared
            .instance(actor.id)
            .map(|instance| instance.mailbox.lock().state)
    }

    /// Snapshot of a private field, for inspection between turns
    pub fn field_of(&self, actor: &ActorRef, field: &str) -> Option<Value> {
        let instance = self.shared.instance(actor.id)?;
        let fields = instance.fields.lock();
        fields.get(field).cloned()
    }

    pub fn actor_count(&self) -> usize {
        self.shared.instances.read().len()
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.shared.failures.lock().clone()
    }

    pub fn take_failures(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.shared.failures.lock())
    }

    /// Move `actor` to `Stopped`, discarding its queued messages
    pub fn stop(&self, actor: &ActorRef) -> bool {
        match self.shared.instance(actor.id) {
            Some(instance) => {
                self.shared.stop(&instance);
                true
            }
            None => false,
        }
    }

    /// Stop every instance and the scheduler. Turns already running finish
    /// first.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }

        let instances: Vec<Arc<Instance>> =
            self.shared.instances.read().values().cloned().collect();
        for instance in &instances {
            self.shared.stop(instance);
        }

        for _ in 0..workers.len() {
            let _ = self.run_tx.send(RunItem::Shutdown);
        }
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        }
        self.shared.pool.shutdown();
        tracing::debug!("runtime shut down");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, run_rx: Receiver<RunItem>) {
    while let Ok(item) = run_rx.recv() {
        match item {
            RunItem::Turn(instance) => shared.run_turn(&instance),
            RunItem::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::CaptureSink;
    use crate::parser::parse_program;

    fn runtime(src: &str) -> (Runtime, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::new());
        let rt = Runtime::with_output(RuntimeConfig::default().with_workers(4), sink.clone());
        rt.load(&parse_program(src).unwrap()).unwrap();
        (rt, sink)
    }

    #[test]
    fn test_init_runs_first_and_fields_persist() {
        let (rt, _) = runtime(
            "server Counter {\n  .init -> self.n = 0\n  .bump -> self.n = self.n + 1\n}",
        );
        let c = rt.spawn("Counter").unwrap();
        for _ in 0..10 {
            rt.send(&c, "bump", vec![]).unwrap();
        }
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert_eq!(rt.field_of(&c, "n"), Some(Value::Int(10)));
        assert_eq!(rt.state_of(&c), Some(InstanceState::Idle));
        assert!(rt.failures().is_empty());
    }

    #[test]
    fn test_instance_without_init_starts_idle() {
        let (rt, _) = runtime("server Plain { .go -> 1 }\nserver Boot { .init -> 1 }");
        let p = rt.spawn("Plain").unwrap();
        assert_eq!(rt.state_of(&p), Some(InstanceState::Idle));

        let b = rt.spawn("Boot").unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert_eq!(rt.state_of(&b), Some(InstanceState::Idle));
        assert_eq!(rt.actor_count(), 2);
    }

    #[test]
    fn test_unknown_selector_fails_only_that_turn() {
        let (rt, _) = runtime(
            "server S {\n  .init -> self.ok = 0\n  .fine -> self.ok = self.ok + 1\n}",
        );
        let s = rt.spawn("S").unwrap();
        rt.send(&s, "missing", vec![]).unwrap();
        rt.send(&s, "fine", vec![]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));

        let failures = rt.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].selector, "missing");
        assert!(matches!(failures[0].error, RuntimeError::Selector { .. }));
        assert_eq!(rt.field_of(&s, "ok"), Some(Value::Int(1)));
    }

    #[test]
    fn test_failure_handler_receives_report() {
        let (rt, sink) = runtime(
            "server S {\n  .boom -> throw \"bad\"\n  .failure sel msg -> print(sel)\n}",
        );
        let s = rt.spawn("S").unwrap();
        rt.send(&s, "boom", vec![]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert_eq!(sink.lines(), vec!["boom".to_string()]);
        assert_eq!(rt.failures().len(), 1);
    }

    #[test]
    fn test_failing_failure_handler_does_not_loop() {
        let (rt, _) = runtime(
            "server S {\n  .boom -> throw 1\n  .failure sel msg -> throw 2\n}",
        );
        let s = rt.spawn("S").unwrap();
        rt.send(&s, "boom", vec![]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        let selectors: Vec<_> = rt.failures().into_iter().map(|f| f.selector).collect();
        assert_eq!(selectors, vec!["boom".to_string(), "failure".to_string()]);
    }

    #[test]
    fn test_arity_mismatch_is_a_failure() {
        let (rt, _) = runtime("server S { .two a b -> a + b }");
        let s = rt.spawn("S").unwrap();
        rt.send(&s, "two", vec![Value::Int(1)]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert!(matches!(
            rt.failures()[0].error,
            RuntimeError::Arity { expected: 2, found: 1, .. }
        ));
    }

    #[test]
    fn test_spawn_unknown_server() {
        let (rt, _) = runtime("");
        assert!(matches!(
            rt.spawn("Ghost"),
            Err(RuntimeError::UnknownServer(_))
        ));
    }

    #[test]
    fn test_stop_discards_queue() {
        let (rt, _) = runtime("server S { .x -> 1 }");
        let s = rt.spawn("S").unwrap();
        assert!(rt.stop(&s));
        rt.send(&s, "x", vec![]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert_eq!(rt.state_of(&s), Some(InstanceState::Stopped));
    }

    #[test]
    fn test_sender_is_bound() {
        let (rt, sink) = runtime(
            "server Pong { .ping -> sender (.pong) }\n\
             server Ping {\n  .start p -> p (.ping)\n  .pong -> print(\"pong\")\n}",
        );
        let pong = rt.spawn("Pong").unwrap();
        let ping = rt.spawn("Ping").unwrap();
        rt.send(&ping, "start", vec![Value::Actor(pong)]).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_secs(5)));
        assert_eq!(sink.lines(), vec!["pong".to_string()]);
    }
}
