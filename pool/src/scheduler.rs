//! The scheduler actor.
//!
//! One tokio task owns the pending queue, the running set, every worker
//! reference and the shared cache. Handles talk to it through [`Request`]s;
//! worker threads through [`WorkerEvent`]s. Nothing here is shared, so
//! nothing here is locked.
//!
//! Task state is expressed by location: a pending task sits in `pending`, a
//! running or canceling task in `running`, and a completed task is gone.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tessera_cache::{CacheCommand, CacheReply, Completion, SharedCache};
use tessera_globals::SharedGlobals;
use tessera_types::{EvalError, GlobalsMap, LockId, MessageId, TaskFailure, TaskId, WorkerId};

use crate::config::PoolConfig;
use crate::host::{FetchProxy, KernelEvaluator};
use crate::protocol::{RunKind, RunRequest, WorkerCommand, WorkerEvent, WorkerMessage};
use crate::runner::RunnerFactory;
use crate::worker::WorkerHandle;

pub(crate) type TaskResult = Result<Value, EvalError>;

pub(crate) struct NewTask {
    pub id: TaskId,
    pub group: String,
    pub kind: RunKind,
    pub text: String,
    pub globals: GlobalsMap,
    pub reply: oneshot::Sender<TaskResult>,
}

pub(crate) enum Request {
    Enqueue(NewTask),
    Cancel { group: String },
    Stats { reply: oneshot::Sender<PoolStats> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Point-in-time counters, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Live workers, busy or idle.
    pub workers: usize,
    pub busy: usize,
    /// Tasks waiting for a free worker.
    pub pending: usize,
    /// Tasks running or being canceled.
    pub running: usize,
}

impl PoolStats {
    #[must_use]
    pub fn idle(&self) -> usize {
        self.workers - self.busy
    }
}

/// Everything the scheduler needs besides its inbox.
pub(crate) struct SchedulerParts {
    pub config: PoolConfig,
    pub factory: Arc<dyn RunnerFactory>,
    pub globals: SharedGlobals,
    pub kernel: Option<Arc<dyn KernelEvaluator>>,
    pub fetch: Option<Arc<dyn FetchProxy>>,
}

enum Internal {
    CancelTimeout(TaskId),
    HostReply {
        worker: WorkerId,
        task: TaskId,
        reply: WorkerCommand,
    },
}

/// Identifies the round-trip a cache completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    task: TaskId,
    message: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Canceling,
}

struct RunningTask {
    group: String,
    worker: WorkerId,
    globals: GlobalsMap,
    state: RunState,
    reply: oneshot::Sender<TaskResult>,
    cancel_timer: Option<AbortHandle>,
}

impl RunningTask {
    fn finish(self, result: TaskResult) {
        if let Some(timer) = self.cancel_timer {
            timer.abort();
        }
        // The caller may have dropped its future.
        let _ = self.reply.send(result);
    }
}

/// Work owed to the rest of the pool when a worker dies.
#[derive(Debug)]
enum Cleanup {
    ReleaseLock { key: String, lock_id: LockId },
}

impl Cleanup {
    fn releases(&self, key: &str, lock_id: LockId) -> bool {
        match self {
            Cleanup::ReleaseLock { key: k, lock_id: id } => k == key && *id == lock_id,
        }
    }
}

struct WorkerRef {
    handle: WorkerHandle,
    task: Option<TaskId>,
    last_used: Instant,
    pending_cleanup: Vec<Cleanup>,
}

pub(crate) struct Scheduler {
    config: PoolConfig,
    factory: Arc<dyn RunnerFactory>,
    globals: SharedGlobals,
    kernel: Option<Arc<dyn KernelEvaluator>>,
    fetch: Option<Arc<dyn FetchProxy>>,
    cache: SharedCache<WorkerId, Ticket>,
    workers: BTreeMap<WorkerId, WorkerRef>,
    pending: VecDeque<NewTask>,
    running: HashMap<TaskId, RunningTask>,
    next_worker_id: u64,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl Scheduler {
    /// Run the actor until every handle is dropped or shutdown is requested.
    pub(crate) async fn run(parts: SchedulerParts, mut requests: mpsc::UnboundedReceiver<Request>) {
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let SchedulerParts {
            config,
            factory,
            globals,
            kernel,
            fetch,
        } = parts;

        let interval = config.cleanup_interval();
        let mut sweep = tokio::time::interval_at(Instant::now() + interval, interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut scheduler = Scheduler {
            config,
            factory,
            globals,
            kernel,
            fetch,
            cache: SharedCache::new(),
            workers: BTreeMap::new(),
            pending: VecDeque::new(),
            running: HashMap::new(),
            next_worker_id: 1,
            worker_tx,
            internal_tx,
        };
        tracing::info!(
            max_workers = scheduler.config.max_worker_count(),
            soft_idle = scheduler.config.soft_idle_count(),
            "worker pool started"
        );

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        if !scheduler.handle_request(request) {
                            return;
                        }
                    }
                    None => {
                        scheduler.shutdown();
                        return;
                    }
                },
                Some(event) = worker_rx.recv() => scheduler.handle_worker_event(event),
                Some(internal) = internal_rx.recv() => scheduler.handle_internal(internal),
                _ = sweep.tick() => scheduler.sweep(),
            }
        }
    }

    /// Returns `false` once the scheduler has stopped.
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Enqueue(task) => self.enqueue(task),
            Request::Cancel { group } => {
                self.cancel_group(&group);
                self.schedule();
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Request::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::CancelTimeout(task_id) => self.on_cancel_timeout(task_id),
            Internal::HostReply {
                worker,
                task,
                reply,
            } => {
                if self.is_current(worker, task) {
                    self.send_to(worker, reply);
                } else {
                    tracing::debug!(worker = %worker, task = %task, "dropping host reply for finished task");
                }
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Died { worker, reason } => {
                if self.workers.contains_key(&worker) {
                    tracing::warn!(worker = %worker, reason = %reason, "worker died");
                    self.kill_worker(worker, "died");
                    self.schedule();
                }
            }
            WorkerEvent::Message { worker, message } => {
                let task_id = message.task_id();
                if !self.workers.contains_key(&worker) {
                    tracing::debug!(worker = %worker, "ignoring message from detached worker");
                    return;
                }
                if !self.is_current(worker, task_id) {
                    tracing::debug!(worker = %worker, task = %task_id, "ignoring stale worker message");
                    return;
                }
                match message {
                    WorkerMessage::RunResult {
                        id,
                        result,
                        is_canceled,
                    } => self.complete(worker, id, result, is_canceled),
                    WorkerMessage::KernelEvalRequest { id, task_id, code } => {
                        self.forward_kernel(worker, task_id, id, &code);
                    }
                    WorkerMessage::FetchRequest { id, task_id, url } => {
                        self.forward_fetch(worker, task_id, id, &url);
                    }
                    WorkerMessage::CacheCmd { id, task_id, data } => {
                        self.cache_command(worker, task_id, id, &data);
                    }
                    WorkerMessage::GlobalsRequest { id, names, .. } => {
                        let globals = self.globals.read().snapshot(names.as_slice());
                        self.send_to(worker, WorkerCommand::GlobalsResult { id, globals });
                    }
                }
            }
        }
    }

    fn is_current(&self, worker: WorkerId, task: TaskId) -> bool {
        self.workers
            .get(&worker)
            .is_some_and(|w| w.task == Some(task))
    }

    // ---- task lifecycle ----

    fn enqueue(&mut self, task: NewTask) {
        self.cancel_group(&task.group);
        tracing::debug!(
            task = %task.id,
            group = %task.group,
            kind = task.kind.as_str(),
            "task queued"
        );
        self.pending.push_back(task);
        self.schedule();
    }

    /// Cancel every live task of `group`.
    fn cancel_group(&mut self, group: &str) {
        let queued = std::mem::take(&mut self.pending);
        for task in queued {
            if task.group == group {
                tracing::debug!(task = %task.id, group, "pending task canceled");
                let _ = task.reply.send(Err(EvalError::Canceled));
            } else {
                self.pending.push_back(task);
            }
        }

        let running: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, t)| t.group == group && t.state == RunState::Running)
            .map(|(id, _)| *id)
            .collect();
        for task_id in running {
            self.begin_cancel(task_id);
        }
    }

    /// Ask the task's worker to stop, and arm the forced-kill timer.
    fn begin_cancel(&mut self, task_id: TaskId) {
        let Some(task) = self.running.get_mut(&task_id) else {
            return;
        };
        if task.state == RunState::Canceling {
            return;
        }
        task.state = RunState::Canceling;
        let worker = task.worker;

        let timeout = self.config.cancel_timeout();
        let internal_tx = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::CancelTimeout(task_id));
        });
        task.cancel_timer = Some(timer.abort_handle());
        tracing::debug!(task = %task_id, worker = %worker, "canceling running task");

        let delivered = self
            .workers
            .get(&worker)
            .is_some_and(|w| w.handle.send(WorkerCommand::Cancel).is_ok());
        if !delivered {
            tracing::warn!(worker = %worker, "worker unreachable while canceling");
            self.kill_worker(worker, "unreachable");
        }
    }

    fn on_cancel_timeout(&mut self, task_id: TaskId) {
        let Some(task) = self.running.get(&task_id) else {
            return;
        };
        if task.state != RunState::Canceling {
            return;
        }
        let worker = task.worker;
        tracing::warn!(
            task = %task_id,
            worker = %worker,
            timeout_ms = self.config.cancel_timeout().as_millis(),
            "worker ignored cancel request, killing it"
        );
        self.kill_worker(worker, "cancel timeout");
        self.schedule();
    }

    fn complete(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
        result: Result<Value, TaskFailure>,
        is_canceled: bool,
    ) {
        if let Some(w) = self.workers.get_mut(&worker) {
            w.task = None;
            w.last_used = Instant::now();
        }
        // Lock requests the task left queued can never be answered now.
        let withdrawn = self.cache.withdraw_waiters(worker);
        self.deliver(withdrawn);

        if let Some(task) = self.running.remove(&task_id) {
            let outcome = if task.state == RunState::Canceling || is_canceled {
                Err(EvalError::Canceled)
            } else {
                result.map_err(EvalError::Task)
            };
            tracing::debug!(
                task = %task_id,
                worker = %worker,
                ok = outcome.is_ok(),
                "task completed"
            );
            task.finish(outcome);
        }
        self.schedule();
    }

    // ---- workers ----

    /// Grow toward the target size, then hand pending tasks to free workers.
    fn schedule(&mut self) {
        self.grow();
        self.dispatch();
    }

    /// Growth stops at `pending + soft_idle`. Busy workers do not raise the
    /// bound, so queued work waits for a free worker once it is reached.
    fn target_size(&self) -> usize {
        (self.pending.len() + self.config.soft_idle_count()).min(self.config.max_worker_count())
    }

    fn grow(&mut self) {
        while self.workers.len() < self.target_size() {
            let id = WorkerId::new(self.next_worker_id);
            self.next_worker_id += 1;
            match WorkerHandle::spawn(id, Arc::clone(&self.factory), self.worker_tx.clone()) {
                Ok(handle) => {
                    tracing::info!(worker = %id, "worker spawned");
                    self.workers.insert(
                        id,
                        WorkerRef {
                            handle,
                            task: None,
                            last_used: Instant::now(),
                            pending_cleanup: Vec::new(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(worker = %id, "failed to spawn worker: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            // Most recently used first, so surplus workers age out together.
            let Some(worker) = self
                .workers
                .iter()
                .filter(|(_, w)| w.task.is_none())
                .max_by_key(|(_, w)| w.last_used)
                .map(|(id, _)| *id)
            else {
                break;
            };
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            self.start(worker, task);
        }
    }

    fn start(&mut self, worker_id: WorkerId, task: NewTask) {
        let NewTask {
            id,
            group,
            kind,
            text,
            globals,
            reply,
        } = task;
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            let _ = reply.send(Err(EvalError::task(format!(
                "{worker_id} vanished before dispatch"
            ))));
            return;
        };

        let request = RunRequest {
            id,
            text,
            serialized_globals: globals.clone(),
        };
        match worker.handle.send(WorkerCommand::run(kind, request)) {
            Ok(()) => {
                worker.task = Some(id);
                worker.last_used = Instant::now();
                tracing::debug!(task = %id, worker = %worker_id, "task dispatched");
                self.running.insert(
                    id,
                    RunningTask {
                        group,
                        worker: worker_id,
                        globals,
                        state: RunState::Running,
                        reply,
                        cancel_timer: None,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(task = %id, "dispatch failed: {e}");
                let _ = reply.send(Err(EvalError::task(format!("dispatch failed: {e}"))));
                self.kill_worker(worker_id, "dispatch failed");
                self.grow();
            }
        }
    }

    /// Discard a worker and settle everything it owed.
    ///
    /// Its task resolves as canceled, its queued cache requests are withdrawn
    /// and every lock it still holds passes to the next waiter.
    fn kill_worker(&mut self, worker_id: WorkerId, reason: &str) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            return;
        };
        tracing::info!(worker = %worker_id, reason, "worker killed");

        if let Some(task) = worker.task.and_then(|id| self.running.remove(&id)) {
            task.finish(Err(EvalError::Canceled));
        }

        let mut completions = self.cache.withdraw_waiters(worker_id);
        for cleanup in worker.pending_cleanup {
            match cleanup {
                Cleanup::ReleaseLock { key, lock_id } => {
                    let (released, granted) = self.cache.force_release(&key, lock_id);
                    if released {
                        tracing::debug!(worker = %worker_id, key = %key, lock_id = %lock_id, "released lock of dead worker");
                    }
                    completions.extend(granted);
                }
            }
        }
        self.deliver(completions);
    }

    /// Reclaim workers unused for longer than `kill_after`.
    fn sweep(&mut self) {
        let now = Instant::now();
        let kill_after = self.config.kill_after();
        let mut candidates: Vec<(Instant, WorkerId)> = self
            .workers
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_used) >= kill_after)
            .map(|(id, w)| (w.last_used, *id))
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.sort();

        let soft_idle = self.config.soft_idle_count();
        let mut idle = self.workers.values().filter(|w| w.task.is_none()).count();
        let mut reclaimed = false;
        for (_, worker_id) in candidates {
            let Some(task) = self.workers.get(&worker_id).map(|w| w.task) else {
                continue;
            };
            match task {
                None if idle > soft_idle => {
                    self.kill_worker(worker_id, "idle");
                    idle -= 1;
                }
                None => {}
                Some(task_id) => {
                    if self
                        .running
                        .get(&task_id)
                        .is_some_and(|t| t.state == RunState::Running)
                    {
                        tracing::info!(task = %task_id, worker = %worker_id, "reclaiming busy worker");
                        self.begin_cancel(task_id);
                        reclaimed = true;
                    }
                }
            }
        }
        // A worker that could not take the cancel was killed on the spot.
        if reclaimed {
            self.schedule();
        }
    }

    fn shutdown(&mut self) {
        for task in self.pending.drain(..) {
            let _ = task.reply.send(Err(EvalError::Canceled));
        }
        let workers: Vec<WorkerId> = self.workers.keys().copied().collect();
        for worker in workers {
            self.kill_worker(worker, "shutdown");
        }
        for (_, task) in self.running.drain() {
            task.finish(Err(EvalError::Canceled));
        }
        tracing::info!("worker pool stopped");
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            busy: self.workers.values().filter(|w| w.task.is_some()).count(),
            pending: self.pending.len(),
            running: self.running.len(),
        }
    }

    fn send_to(&self, worker: WorkerId, command: WorkerCommand) {
        let Some(w) = self.workers.get(&worker) else {
            return;
        };
        if let Err(e) = w.handle.send(command) {
            // The thread's death notice is already on its way.
            tracing::debug!("{e}");
        }
    }

    // ---- round-trips ----

    fn cache_command(&mut self, worker: WorkerId, task: TaskId, id: MessageId, data: &Value) {
        let command = match CacheCommand::from_json(data) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(worker = %worker, "rejecting cache command: {e}");
                self.send_to(
                    worker,
                    WorkerCommand::CacheCmdResult {
                        id,
                        result: e.into(),
                    },
                );
                return;
            }
        };
        tracing::debug!(
            worker = %worker,
            cmd = command.name(),
            key = command.key(),
            "cache command"
        );

        if let CacheCommand::Unlock { key, lock_id } = &command {
            for w in self.workers.values_mut() {
                w.pending_cleanup.retain(|c| !c.releases(key, *lock_id));
            }
        }
        let ticket = Ticket { task, message: id };
        let completions = self.cache.execute(worker, ticket, command);
        self.deliver(completions);
    }

    /// Route cache completions to their workers.
    ///
    /// A lock granted to a request whose task has finished or is being
    /// canceled is released again at once; nobody would ever unlock it.
    fn deliver(&mut self, completions: Vec<Completion<WorkerId, Ticket>>) {
        let mut queue = VecDeque::from(completions);
        while let Some(Completion {
            owner,
            ticket,
            key,
            reply,
        }) = queue.pop_front()
        {
            let current = self.is_current(owner, ticket.task);
            if let CacheReply::Locked { lock_id } = reply {
                let running = self
                    .running
                    .get(&ticket.task)
                    .is_some_and(|t| t.state == RunState::Running);
                if !(current && running) {
                    tracing::debug!(worker = %owner, key = %key, "releasing lock granted to a stale request");
                    let (_, granted) = self.cache.force_release(&key, lock_id);
                    queue.extend(granted);
                    continue;
                }
                if let Some(w) = self.workers.get_mut(&owner) {
                    w.pending_cleanup
                        .push(Cleanup::ReleaseLock { key, lock_id });
                }
            } else if !current {
                tracing::debug!(worker = %owner, key = %key, "dropping cache reply for stale request");
                continue;
            }
            self.send_to(
                owner,
                WorkerCommand::CacheCmdResult {
                    id: ticket.message,
                    result: reply,
                },
            );
        }
    }

    fn forward_kernel(&mut self, worker: WorkerId, task: TaskId, id: MessageId, code: &str) {
        let Some(kernel) = self.kernel.clone() else {
            self.send_to(
                worker,
                WorkerCommand::KernelEvalResult {
                    id,
                    result: Err("no kernel evaluator configured".to_string()),
                },
            );
            return;
        };
        let globals = self
            .running
            .get(&task)
            .map(|t| t.globals.clone())
            .unwrap_or_default();
        let pending = kernel.eval(code, globals);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pending.await;
            let _ = internal_tx.send(Internal::HostReply {
                worker,
                task,
                reply: WorkerCommand::KernelEvalResult { id, result },
            });
        });
    }

    fn forward_fetch(&mut self, worker: WorkerId, task: TaskId, id: MessageId, url: &str) {
        let Some(proxy) = self.fetch.clone() else {
            self.send_to(
                worker,
                WorkerCommand::FetchResult {
                    id,
                    result: Err("no fetch proxy configured".to_string()),
                },
            );
            return;
        };
        let pending = proxy.fetch(url);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pending.await;
            let _ = internal_tx.send(Internal::HostReply {
                worker,
                task,
                reply: WorkerCommand::FetchResult { id, result },
            });
        });
    }
}
