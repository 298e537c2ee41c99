//! Worker threads: one OS thread and one [`TaskRunner`] per worker.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;

use tessera_types::WorkerId;

use crate::protocol::{RunKind, WorkerCommand, WorkerEvent, WorkerMessage};
use crate::runner::{RunnerFactory, TaskRunner, WorkerContext};

/// The scheduler's end of a worker thread.
///
/// Dropping the handle detaches the thread: its command channel closes, any
/// round-trip it is blocked on fails as canceled, and it exits once its
/// runner returns.
pub(crate) struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        id: WorkerId,
        factory: Arc<dyn RunnerFactory>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> io::Result<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name(format!("tessera-{id}"))
            .spawn(move || worker_main(id, factory.as_ref(), rx, &events))?;
        Ok(Self { id, commands })
    }

    /// A handle whose thread is already gone.
    #[cfg(test)]
    pub(crate) fn detached(id: WorkerId) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self { id, commands }
    }

    /// Queue a command for the worker. Fails once the thread has exited.
    pub(crate) fn send(&self, command: WorkerCommand) -> Result<(), WorkerGone> {
        self.commands.send(command).map_err(|_| WorkerGone(self.id))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is no longer running")]
pub(crate) struct WorkerGone(WorkerId);

fn worker_main(
    id: WorkerId,
    factory: &dyn RunnerFactory,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut runner: Box<dyn TaskRunner> =
        match panic::catch_unwind(AssertUnwindSafe(|| factory.create(id))) {
            Ok(runner) => runner,
            Err(payload) => {
                let reason = format!("runner construction panicked: {}", panic_message(&*payload));
                let _ = events.send(WorkerEvent::Died { worker: id, reason });
                return;
            }
        };
    tracing::debug!(worker = %id, "worker thread started");

    while let Some(command) = commands.blocking_recv() {
        let (kind, request) = match command {
            WorkerCommand::RunQuery(request) => (RunKind::Query, request),
            WorkerCommand::RunEval(request) => (RunKind::Eval, request),
            // Cancels and replies that raced with the end of a task.
            _ => continue,
        };

        let mut ctx = WorkerContext::new(id, request.id, &mut commands, events);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            runner.run(kind, &request.text, &request.serialized_globals, &mut ctx)
        }));

        match outcome {
            Ok(result) => {
                let message = WorkerMessage::RunResult {
                    id: request.id,
                    result,
                    is_canceled: ctx.is_canceled(),
                };
                if events
                    .send(WorkerEvent::Message { worker: id, message })
                    .is_err()
                {
                    break;
                }
            }
            Err(payload) => {
                let reason = format!("task panicked: {}", panic_message(&*payload));
                let _ = events.send(WorkerEvent::Died { worker: id, reason });
                return;
            }
        }
    }
    tracing::debug!(worker = %id, "worker thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
