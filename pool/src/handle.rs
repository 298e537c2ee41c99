//! `WorkerPool` facade: the cloneable handle callers hold.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use tessera_globals::SharedGlobals;
use tessera_types::{EvalError, TaskId};

use crate::config::PoolConfig;
use crate::host::{FetchProxy, KernelEvaluator};
use crate::protocol::RunKind;
use crate::runner::RunnerFactory;
use crate::scheduler::{NewTask, PoolStats, Request, Scheduler, SchedulerParts, TaskResult};

/// Handle to a running worker pool.
///
/// Clones share one scheduler. The scheduler stops, canceling every live task
/// and killing every worker, when [`WorkerPool::shutdown`] is called or the
/// last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    requests: mpsc::UnboundedSender<Request>,
    globals: SharedGlobals,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("closed", &self.requests.is_closed())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn builder(factory: impl RunnerFactory + 'static) -> PoolBuilder {
        PoolBuilder {
            factory: Arc::new(factory),
            config: PoolConfig::default(),
            globals: SharedGlobals::default(),
            kernel: None,
            fetch: None,
        }
    }

    /// The store task globals are read from.
    #[must_use]
    pub fn globals(&self) -> &SharedGlobals {
        &self.globals
    }

    /// Run query-language text for `group`, superseding the group's live task.
    ///
    /// The values of `global_names` are captured now; later store mutations
    /// do not reach this task.
    pub fn run_query<S: AsRef<str>>(
        &self,
        group: impl Into<String>,
        text: impl Into<String>,
        global_names: &[S],
    ) -> TaskFuture {
        self.submit(RunKind::Query, group.into(), text.into(), global_names)
    }

    /// Run script text for `group`. Same contract as [`WorkerPool::run_query`].
    pub fn run_eval<S: AsRef<str>>(
        &self,
        group: impl Into<String>,
        text: impl Into<String>,
        global_names: &[S],
    ) -> TaskFuture {
        self.submit(RunKind::Eval, group.into(), text.into(), global_names)
    }

    fn submit<S: AsRef<str>>(
        &self,
        kind: RunKind,
        group: String,
        text: String,
        global_names: &[S],
    ) -> TaskFuture {
        let id = TaskId::new();
        let globals = self.globals.read().snapshot(global_names);
        let (reply, rx) = oneshot::channel();
        let task = NewTask {
            id,
            group,
            kind,
            text,
            globals,
            reply,
        };
        // A closed inbox drops `reply`, which the future reports as PoolClosed.
        let _ = self.requests.send(Request::Enqueue(task));
        TaskFuture { id, rx }
    }

    /// Cancel every pending and running task of `group`.
    pub fn cancel_tasks(&self, group: impl Into<String>) {
        let _ = self.requests.send(Request::Cancel {
            group: group.into(),
        });
    }

    /// Snapshot of the pool's counters, or `None` once it has stopped.
    pub async fn stats(&self) -> Option<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Stop the pool and wait until every worker has been released.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

pub struct PoolBuilder {
    factory: Arc<dyn RunnerFactory>,
    config: PoolConfig,
    globals: SharedGlobals,
    kernel: Option<Arc<dyn KernelEvaluator>>,
    fetch: Option<Arc<dyn FetchProxy>>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn globals(mut self, globals: SharedGlobals) -> Self {
        self.globals = globals;
        self
    }

    pub fn kernel(mut self, kernel: Arc<dyn KernelEvaluator>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn fetch_proxy(mut self, proxy: Arc<dyn FetchProxy>) -> Self {
        self.fetch = Some(proxy);
        self
    }

    /// Spawn the scheduler. Must be called from within a tokio runtime.
    ///
    /// No worker starts until the first task arrives.
    #[must_use]
    pub fn start(self) -> WorkerPool {
        let (requests, inbox) = mpsc::unbounded_channel();
        let parts = SchedulerParts {
            config: self.config,
            factory: self.factory,
            globals: self.globals.clone(),
            kernel: self.kernel,
            fetch: self.fetch,
        };
        tokio::spawn(Scheduler::run(parts, inbox));
        WorkerPool {
            requests,
            globals: self.globals,
        }
    }
}

/// Outcome of one scheduled task.
///
/// Dropping the future does not cancel the task; use
/// [`WorkerPool::cancel_tasks`].
#[derive(Debug)]
pub struct TaskFuture {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskFuture {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskFuture {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EvalError::PoolClosed)))
    }
}
