//! Messages exchanged between the scheduler and its workers.
//!
//! Two disjoint channels: [`WorkerCommand`]s flow scheduler → worker,
//! [`WorkerMessage`]s flow worker → scheduler. Round-trips are correlated by
//! a [`MessageId`] that the worker allocates per task.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_cache::CacheReply;
use tessera_types::{GlobalsMap, MessageId, TaskFailure, TaskId, WorkerId};

/// Which compiler a task's text is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Query,
    Eval,
}

impl RunKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Query => "query",
            RunKind::Eval => "eval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub id: TaskId,
    pub text: String,
    pub serialized_globals: GlobalsMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    RunQuery(RunRequest),
    RunEval(RunRequest),
    Cancel,
    KernelEvalResult {
        id: MessageId,
        result: Result<Value, String>,
    },
    FetchResult {
        id: MessageId,
        result: Result<Value, String>,
    },
    CacheCmdResult {
        id: MessageId,
        result: CacheReply,
    },
    GlobalsResult {
        id: MessageId,
        globals: GlobalsMap,
    },
}

impl WorkerCommand {
    pub(crate) fn run(kind: RunKind, request: RunRequest) -> Self {
        match kind {
            RunKind::Query => WorkerCommand::RunQuery(request),
            RunKind::Eval => WorkerCommand::RunEval(request),
        }
    }

    /// Correlation id of a round-trip reply.
    pub(crate) fn reply_id(&self) -> Option<MessageId> {
        match self {
            WorkerCommand::KernelEvalResult { id, .. }
            | WorkerCommand::FetchResult { id, .. }
            | WorkerCommand::CacheCmdResult { id, .. }
            | WorkerCommand::GlobalsResult { id, .. } => Some(*id),
            WorkerCommand::RunQuery(_) | WorkerCommand::RunEval(_) | WorkerCommand::Cancel => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    RunResult {
        id: TaskId,
        result: Result<Value, TaskFailure>,
        is_canceled: bool,
    },
    KernelEvalRequest {
        id: MessageId,
        task_id: TaskId,
        code: String,
    },
    FetchRequest {
        id: MessageId,
        task_id: TaskId,
        url: String,
    },
    CacheCmd {
        id: MessageId,
        task_id: TaskId,
        data: Value,
    },
    GlobalsRequest {
        id: MessageId,
        task_id: TaskId,
        names: Vec<String>,
    },
}

impl WorkerMessage {
    /// Task a message was sent on behalf of.
    pub(crate) fn task_id(&self) -> TaskId {
        match self {
            WorkerMessage::RunResult { id, .. } => *id,
            WorkerMessage::KernelEvalRequest { task_id, .. }
            | WorkerMessage::FetchRequest { task_id, .. }
            | WorkerMessage::CacheCmd { task_id, .. }
            | WorkerMessage::GlobalsRequest { task_id, .. } => *task_id,
        }
    }
}

/// Everything the scheduler hears from its worker threads.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        worker: WorkerId,
        message: WorkerMessage,
    },
    /// The worker thread is gone and will never answer again.
    Died { worker: WorkerId, reason: String },
}
