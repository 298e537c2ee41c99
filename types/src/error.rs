use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure reported by a task runner or external evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<EvalError> for TaskFailure {
    fn from(err: EvalError) -> Self {
        TaskFailure::new(err.to_string())
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome error for an evaluation.
///
/// `Canceled` means the request was superseded or reclaimed; it is kept apart
/// from `Task` so callers can ignore supersession without hiding failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("evaluation canceled")]
    Canceled,

    #[error("evaluation failed: {0}")]
    Task(TaskFailure),

    #[error("kernel evaluation failed: {0}")]
    Kernel(String),

    #[error("binding error: {0}")]
    Binding(String),

    #[error("global '{0}' not found")]
    GlobalNotFound(String),

    #[error("worker pool is shut down")]
    PoolClosed,
}

impl EvalError {
    #[must_use]
    pub fn task(message: impl Into<String>) -> Self {
        EvalError::Task(TaskFailure::new(message))
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, EvalError::Canceled)
    }
}
