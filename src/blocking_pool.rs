//! Blocking thread pool for offloaded calls
//!
//! HTTP fetches, timers and file writes run here instead of on the actor
//! scheduler's workers. Each submitted task is settled exactly once: by the
//! worker that finishes it, or by the watchdog when its deadline passes.
//! Whichever removes the pending entry first reports the outcome; a result
//! that arrives after its deadline is dropped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ast::Ident;
use crate::value::{ActorRef, Value};

/// A blocking operation to run off the scheduler
#[derive(Debug, Clone)]
pub enum OffloadOp {
    Fetch { url: String },
    Sleep { ms: u64 },
    WriteFile { path: PathBuf, contents: String },
}

impl OffloadOp {
    pub fn name(&self) -> &'static str {
        match self {
            OffloadOp::Fetch { .. } => "wget",
            OffloadOp::Sleep { .. } => "sleep",
            OffloadOp::WriteFile { .. } => "os.filesystem.create",
        }
    }
}

pub type OffloadId = u64;

/// `Ok(result)` or `Err(message)`
pub type OffloadOutcome = Result<Value, String>;

/// Where and how to report an offload's outcome
#[derive(Debug, Clone)]
pub struct PendingOffload {
    pub requester: ActorRef,
    /// `None` when only a failure is worth reporting
    pub selector: Option<Ident>,
    pub extra: Vec<Value>,
    pub op_name: &'static str,
}

impl PendingOffload {
    /// Message arguments: the caller's extra values followed by
    /// `("ok", result)` or `("err", message)`
    pub fn reply_args(&self, outcome: OffloadOutcome) -> Vec<Value> {
        let tagged = match outcome {
            Ok(value) => Value::tuple(vec![Value::string("ok"), value]),
            Err(message) => Value::tuple(vec![Value::string("err"), Value::string(message)]),
        };
        let mut args = self.extra.clone();
        args.push(tagged);
        args
    }
}

/// Receives settled offloads
pub trait Mailer: Send + Sync {
    fn complete(&self, pending: PendingOffload, outcome: OffloadOutcome);
}

enum WorkerMessage {
    Task { id: OffloadId, op: OffloadOp },
    Shutdown,
}

type PendingTable = Arc<Mutex<HashMap<OffloadId, PendingOffload>>>;

pub struct BlockingPool {
    task_sender: Mutex<Option<Sender<WorkerMessage>>>,
    deadline_sender: Mutex<Option<Sender<(Instant, OffloadId)>>>,
    pending: PendingTable,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    timeout: Duration,
    next_id: AtomicU64,
}

impl BlockingPool {
    pub fn new(count: usize, timeout: Duration, mailer: Weak<dyn Mailer>) -> Self {
        let count = count.max(1);

        let (task_sender, task_receiver) = mpsc::channel::<WorkerMessage>();
        let task_receiver = Arc::new(Mutex::new(task_receiver));
        let (deadline_sender, deadline_receiver) = mpsc::channel();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let client = http_client(timeout);

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let receiver = Arc::clone(&task_receiver);
            let pending = Arc::clone(&pending);
            let mailer = mailer.clone();
            let client = client.clone();
            let spawned = thread::Builder::new()
                .name(format!("offload-{}", id))
                .spawn(move || worker_loop(receiver, pending, mailer, client));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => tracing::error!(error = %err, "failed to spawn offload worker"),
            }
        }

        {
            let pending = Arc::clone(&pending);
            let spawned = thread::Builder::new()
                .name("offload-watchdog".into())
                .spawn(move || watchdog_loop(deadline_receiver, pending, mailer));
            if let Err(err) = spawned {
                tracing::error!(error = %err, "failed to spawn offload watchdog");
            }
        }

        Self {
            task_sender: Mutex::new(Some(task_sender)),
            deadline_sender: Mutex::new(Some(deadline_sender)),
            pending,
            worker_count: workers.len(),
            workers: Mutex::new(workers),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue `op`; the outcome reaches the mailer exactly once.
    /// Hands the request back if the pool is shut down.
    pub fn submit(
        &self,
        op: OffloadOp,
        pending: PendingOffload,
    ) -> Result<OffloadId, PendingOffload> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;

        let task_sender = self.task_sender.lock();
        let Some(sender) = task_sender.as_ref() else {
            return Err(pending);
        };

        // Held across the send so a fast worker cannot settle before the
        // entry exists
        let mut table = self.pending.lock();
        if sender.send(WorkerMessage::Task { id, op }).is_err() {
            return Err(pending);
        }
        table.insert(id, pending);
        drop(table);

        if let Some(deadlines) = self.deadline_sender.lock().as_ref() {
            let _ = deadlines.send((deadline, id));
        }
        Ok(id)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop accepting work. Idle workers exit and are joined; workers still
    /// inside a blocking call are left to finish on their own.
    pub fn shutdown(&self) {
        if let Some(sender) = self.task_sender.lock().take() {
            for _ in 0..self.worker_count {
                let _ = sender.send(WorkerMessage::Shutdown);
            }
        }
        self.deadline_sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("worker_count", &self.worker_count)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn http_client(timeout: Duration) -> Option<reqwest::blocking::Client> {
    match reqwest::blocking::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
    {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::error!(error = %err, "failed to build HTTP client; wget will fail");
            None
        }
    }
}

/// Deliver `outcome` unless the watchdog got there first
fn settle(pending: &PendingTable, mailer: &Weak<dyn Mailer>, id: OffloadId, outcome: OffloadOutcome) {
    let Some(entry) = pending.lock().remove(&id) else {
        tracing::debug!(offload = id, "dropping result of an offload that already timed out");
        return;
    };
    match mailer.upgrade() {
        Some(mailer) => mailer.complete(entry, outcome),
        None => tracing::debug!(offload = id, "runtime gone; dropping offload result"),
    }
}

fn worker_loop(
    receiver: Arc<Mutex<Receiver<WorkerMessage>>>,
    pending: PendingTable,
    mailer: Weak<dyn Mailer>,
    client: Option<reqwest::blocking::Client>,
) {
    loop {
        let message = receiver.lock().recv();
        match message {
            Ok(WorkerMessage::Task { id, op }) => {
                tracing::debug!(offload = id, op = op.name(), "running offload");
                let outcome = execute(&op, client.as_ref());
                settle(&pending, &mailer, id, outcome);
            }
            Ok(WorkerMessage::Shutdown) | Err(_) => break,
        }
    }
}

fn watchdog_loop(
    deadlines: Receiver<(Instant, OffloadId)>,
    pending: PendingTable,
    mailer: Weak<dyn Mailer>,
) {
    let mut heap: BinaryHeap<Reverse<(Instant, OffloadId)>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            let op_name = pending.lock().get(&id).map(|p| p.op_name);
            if let Some(op_name) = op_name {
                tracing::warn!(offload = id, op = op_name, "offload timed out");
                settle(
                    &pending,
                    &mailer,
                    id,
                    Err(format!("{} timed out", op_name)),
                );
            }
        }

        let next = match heap.peek() {
            Some(Reverse((deadline, _))) => {
                deadlines.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => deadlines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(entry) => heap.push(Reverse(entry)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) if heap.is_empty() => break,
            Err(RecvTimeoutError::Disconnected) => {
                // Keep honoring deadlines already registered
                if let Some(Reverse((deadline, _))) = heap.peek() {
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                }
            }
        }
    }
}

fn execute(op: &OffloadOp, client: Option<&reqwest::blocking::Client>) -> OffloadOutcome {
    match op {
        OffloadOp::Sleep { ms } => {
            thread::sleep(Duration::from_millis(*ms));
            Ok(Value::Int(*ms as i64))
        }
        OffloadOp::WriteFile { path, contents } => std::fs::write(path, contents)
            .map(|_| Value::Unit)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e)),
        OffloadOp::Fetch { url } => {
            let client = client.ok_or_else(|| "HTTP client unavailable".to_string())?;
            let response = client.get(url).send().map_err(|e| e.to_string())?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("HTTP {}", status));
            }
            response.text().map(Value::from).map_err(|e| e.to_string())
        }
    }
}
