//! Bounded worker-pool scheduler for binding evaluation.
//!
//! Tasks are grouped by cancellation group: starting a task supersedes the
//! group's live one. Each task runs on its own OS thread worker through a
//! host-supplied [`TaskRunner`], and may call back into the scheduler for
//! globals, the shared cache, the kernel evaluator or the fetch proxy.
//!
//! Cache locks belong to the worker that took them. Whenever a worker goes
//! away (idle reclamation, forced cancel, panic, shutdown) its locks are
//! released and the next waiter proceeds.

mod config;
mod handle;
mod host;
mod protocol;
mod runner;
mod scheduler;
mod worker;

pub use config::PoolConfig;
pub use handle::{PoolBuilder, TaskFuture, WorkerPool};
pub use host::{FetchProxy, KernelEvaluator};
pub use protocol::{RunKind, RunRequest, WorkerCommand, WorkerMessage};
pub use runner::{RunnerFactory, TaskRunner, WorkerContext};
pub use scheduler::PoolStats;
