//! Built-in evaluation strategies.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

use tessera_globals::SharedGlobals;
use tessera_pool::{KernelEvaluator, RunKind, WorkerPool};
use tessera_types::EvalError;

use crate::binding::kind;
use crate::deps::{CommentStyle, DependencyScanner, ScanMode};

/// One way of evaluating binding text.
pub trait BindingEvaluator: Send + Sync {
    /// The discriminator this strategy is registered under.
    fn name(&self) -> &str;

    /// Global names `text` depends on.
    fn globals_for_binding(&self, text: &str) -> BTreeSet<String>;

    /// Evaluate `text` for cancellation group `group`, reading `globals`.
    fn evaluate(
        &self,
        group: &str,
        text: &str,
        globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>>;

    /// Abandon whatever is in flight for `group`.
    fn cancel(&self, _group: &str) {}
}

fn ready(result: Result<Value, EvalError>) -> BoxFuture<'static, Result<Value, EvalError>> {
    future::ready(result).boxed()
}

/// Pass-through read of one global. The text names it, `@` optional.
pub struct GlobalStrategy {
    globals: SharedGlobals,
}

impl GlobalStrategy {
    #[must_use]
    pub fn new(globals: SharedGlobals) -> Self {
        Self { globals }
    }
}

fn global_name(text: &str) -> &str {
    let name = text.trim();
    name.strip_prefix('@').unwrap_or(name)
}

impl BindingEvaluator for GlobalStrategy {
    fn name(&self) -> &str {
        kind::GLOBAL
    }

    fn globals_for_binding(&self, text: &str) -> BTreeSet<String> {
        let name = global_name(text);
        if name.is_empty() {
            BTreeSet::new()
        } else {
            BTreeSet::from([name.to_string()])
        }
    }

    fn evaluate(
        &self,
        _group: &str,
        text: &str,
        _globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        let name = global_name(text);
        let result = self
            .globals
            .read()
            .get(name)
            .cloned()
            .map_err(|_| EvalError::GlobalNotFound(name.to_string()));
        ready(result)
    }
}

/// Always null, never depends on anything.
pub struct NoneStrategy;

impl BindingEvaluator for NoneStrategy {
    fn name(&self) -> &str {
        kind::NONE
    }

    fn globals_for_binding(&self, _text: &str) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn evaluate(
        &self,
        _group: &str,
        _text: &str,
        _globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        ready(Ok(Value::Null))
    }
}

/// Runs text inside a pool worker.
pub struct ScriptStrategy {
    name: &'static str,
    kind: RunKind,
    pool: Option<WorkerPool>,
    scanner: DependencyScanner,
}

impl ScriptStrategy {
    /// Query-language text, run with [`WorkerPool::run_query`].
    #[must_use]
    pub fn query(pool: Option<WorkerPool>, style: CommentStyle) -> Self {
        Self {
            name: kind::SCRIPT_QUERY,
            kind: RunKind::Query,
            pool,
            scanner: DependencyScanner::new(style, ScanMode::Query),
        }
    }

    /// Script text, run with [`WorkerPool::run_eval`].
    #[must_use]
    pub fn script(pool: Option<WorkerPool>, style: CommentStyle) -> Self {
        Self {
            name: kind::SCRIPT_JS,
            kind: RunKind::Eval,
            pool,
            scanner: DependencyScanner::new(style, ScanMode::Script),
        }
    }
}

impl BindingEvaluator for ScriptStrategy {
    fn name(&self) -> &str {
        self.name
    }

    fn globals_for_binding(&self, text: &str) -> BTreeSet<String> {
        self.scanner.scan(text)
    }

    fn evaluate(
        &self,
        group: &str,
        text: &str,
        globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        let Some(pool) = &self.pool else {
            return ready(Err(EvalError::Binding(format!(
                "{} needs a worker pool",
                self.name
            ))));
        };
        let names: Vec<&str> = globals.iter().map(String::as_str).collect();
        let task = match self.kind {
            RunKind::Query => pool.run_query(group, text, names.as_slice()),
            RunKind::Eval => pool.run_eval(group, text, names.as_slice()),
        };
        task.boxed()
    }

    fn cancel(&self, group: &str) {
        if let Some(pool) = &self.pool {
            pool.cancel_tasks(group);
        }
    }
}

/// Hands text to the host's out-of-process kernel.
pub struct KernelStrategy {
    kernel: Option<Arc<dyn KernelEvaluator>>,
    globals: SharedGlobals,
    scanner: DependencyScanner,
}

impl KernelStrategy {
    #[must_use]
    pub fn new(
        kernel: Option<Arc<dyn KernelEvaluator>>,
        globals: SharedGlobals,
        style: CommentStyle,
    ) -> Self {
        Self {
            kernel,
            globals,
            scanner: DependencyScanner::new(style, ScanMode::AtNames),
        }
    }
}

impl BindingEvaluator for KernelStrategy {
    fn name(&self) -> &str {
        kind::KERNEL
    }

    fn globals_for_binding(&self, text: &str) -> BTreeSet<String> {
        self.scanner.scan(text)
    }

    fn evaluate(
        &self,
        _group: &str,
        text: &str,
        globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        let Some(kernel) = &self.kernel else {
            return ready(Err(EvalError::Binding(
                "no kernel evaluator configured".to_string(),
            )));
        };
        let names: Vec<&String> = globals.iter().collect();
        let snapshot = self.globals.read().snapshot(names.as_slice());
        let pending = kernel.eval(text, snapshot);
        async move { pending.await.map_err(EvalError::Kernel) }.boxed()
    }
}

/// Stand-in for an unregistered kind. Fails every evaluation.
pub struct ErrorStrategy {
    kind: String,
}

impl ErrorStrategy {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl BindingEvaluator for ErrorStrategy {
    fn name(&self) -> &str {
        &self.kind
    }

    fn globals_for_binding(&self, _text: &str) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn evaluate(
        &self,
        _group: &str,
        _text: &str,
        _globals: &BTreeSet<String>,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        ready(Err(EvalError::Binding(format!(
            "unknown binding kind '{}'",
            self.kind
        ))))
    }
}
