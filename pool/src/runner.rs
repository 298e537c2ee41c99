//! The host-side execution contract for worker threads.
//!
//! A [`RunnerFactory`] builds one [`TaskRunner`] per worker thread. The runner
//! executes task text and reaches back to the scheduler through the
//! [`WorkerContext`] it is handed for the duration of a task.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use tessera_cache::{CacheCommand, CacheReply};
use tessera_types::{EvalError, GlobalsMap, MessageId, TaskFailure, TaskId, WorkerId};

use crate::protocol::{RunKind, WorkerCommand, WorkerEvent, WorkerMessage};

/// Executes task text inside a worker thread.
///
/// Runners live on their worker thread for its whole life and need not be
/// `Send`. A runner that panics takes its worker down with it; the task in
/// flight resolves as canceled and the pool replaces the worker.
pub trait TaskRunner {
    fn run(
        &mut self,
        kind: RunKind,
        text: &str,
        globals: &GlobalsMap,
        ctx: &mut WorkerContext<'_>,
    ) -> Result<Value, TaskFailure>;
}

/// Builds the runner for a freshly spawned worker. Called on the worker thread.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, worker: WorkerId) -> Box<dyn TaskRunner>;
}

impl<F> RunnerFactory for F
where
    F: Fn(WorkerId) -> Box<dyn TaskRunner> + Send + Sync,
{
    fn create(&self, worker: WorkerId) -> Box<dyn TaskRunner> {
        self(worker)
    }
}

/// A runner's view of the scheduler while one task executes.
///
/// Every round-trip blocks the worker thread until the matching reply
/// arrives. A cancel request (or the scheduler detaching the worker) aborts
/// the wait with [`EvalError::Canceled`], and every later round-trip of the
/// same task fails the same way.
pub struct WorkerContext<'a> {
    worker: WorkerId,
    task: TaskId,
    commands: &'a mut mpsc::UnboundedReceiver<WorkerCommand>,
    events: &'a mpsc::UnboundedSender<WorkerEvent>,
    next_message: u64,
    canceled: bool,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(
        worker: WorkerId,
        task: TaskId,
        commands: &'a mut mpsc::UnboundedReceiver<WorkerCommand>,
        events: &'a mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            worker,
            task,
            commands,
            events,
            next_message: 1,
            canceled: false,
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Whether the scheduler asked this task to stop.
    ///
    /// Long-running runners should poll this between units of work.
    pub fn is_canceled(&mut self) -> bool {
        while !self.canceled {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Cancel) | Err(TryRecvError::Disconnected) => {
                    self.canceled = true;
                }
                Ok(other) => self.discard(&other),
                Err(TryRecvError::Empty) => break,
            }
        }
        self.canceled
    }

    /// Issue a cache command on behalf of the current task.
    pub fn cache(&mut self, command: &CacheCommand) -> Result<CacheReply, EvalError> {
        let data = serde_json::to_value(command)
            .map_err(|e| EvalError::task(format!("cannot encode cache command: {e}")))?;
        self.cache_json(data)
    }

    /// Issue a raw JSON cache command, e.g. one built by a script runtime.
    pub fn cache_json(&mut self, data: Value) -> Result<CacheReply, EvalError> {
        match self.round_trip(|id, task_id| WorkerMessage::CacheCmd { id, task_id, data })? {
            WorkerCommand::CacheCmdResult { result, .. } => Ok(result),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Evaluate code on the host's kernel.
    pub fn kernel_eval(&mut self, code: &str) -> Result<Value, EvalError> {
        let code = code.to_string();
        match self.round_trip(|id, task_id| WorkerMessage::KernelEvalRequest { id, task_id, code })? {
            WorkerCommand::KernelEvalResult { result, .. } => result.map_err(EvalError::Kernel),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Fetch a URL through the host's proxy.
    pub fn fetch(&mut self, url: &str) -> Result<Value, EvalError> {
        let owned = url.to_string();
        match self.round_trip(|id, task_id| WorkerMessage::FetchRequest {
            id,
            task_id,
            url: owned,
        })? {
            WorkerCommand::FetchResult { result, .. } => {
                result.map_err(|e| EvalError::task(format!("fetch {url} failed: {e}")))
            }
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Current values of `names`, read when the scheduler receives the request.
    ///
    /// Unknown names are absent from the result.
    pub fn globals<S: AsRef<str>>(&mut self, names: &[S]) -> Result<GlobalsMap, EvalError> {
        let names = names.iter().map(|n| n.as_ref().to_string()).collect();
        match self.round_trip(|id, task_id| WorkerMessage::GlobalsRequest { id, task_id, names })? {
            WorkerCommand::GlobalsResult { globals, .. } => Ok(globals),
            other => Err(unexpected_reply(&other)),
        }
    }

    fn round_trip(
        &mut self,
        build: impl FnOnce(MessageId, TaskId) -> WorkerMessage,
    ) -> Result<WorkerCommand, EvalError> {
        if self.is_canceled() {
            return Err(EvalError::Canceled);
        }
        let id = MessageId::new(self.next_message);
        self.next_message += 1;

        let event = WorkerEvent::Message {
            worker: self.worker,
            message: build(id, self.task),
        };
        if self.events.send(event).is_err() {
            self.canceled = true;
            return Err(EvalError::Canceled);
        }

        loop {
            match self.commands.blocking_recv() {
                None | Some(WorkerCommand::Cancel) => {
                    self.canceled = true;
                    return Err(EvalError::Canceled);
                }
                Some(reply) if reply.reply_id() == Some(id) => return Ok(reply),
                Some(other) => self.discard(&other),
            }
        }
    }

    fn discard(&self, command: &WorkerCommand) {
        tracing::debug!(
            worker = %self.worker,
            task = %self.task,
            reply_id = ?command.reply_id(),
            "discarding stale worker command"
        );
    }
}

fn unexpected_reply(command: &WorkerCommand) -> EvalError {
    EvalError::task(format!("unexpected scheduler reply: {command:?}"))
}
