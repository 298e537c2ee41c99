//! Kind → strategy lookup.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use tessera_globals::SharedGlobals;
use tessera_pool::{KernelEvaluator, WorkerPool};
use tessera_types::EvalError;

use crate::binding::Binding;
use crate::config::BindingsConfig;
use crate::strategy::{
    BindingEvaluator, ErrorStrategy, GlobalStrategy, KernelStrategy, NoneStrategy, ScriptStrategy,
};

/// Resolves a binding's kind to the strategy that evaluates it.
///
/// Built once per session and passed to whoever evaluates bindings.
pub struct EvaluatorRegistry {
    strategies: HashMap<String, Arc<dyn BindingEvaluator>>,
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl EvaluatorRegistry {
    /// Start a registry reading globals from `globals`.
    #[must_use]
    pub fn builder(globals: SharedGlobals) -> RegistryBuilder {
        RegistryBuilder {
            globals,
            pool: None,
            kernel: None,
            config: BindingsConfig::default(),
            extra: Vec::new(),
        }
    }

    /// The strategy for `kind`, or one that fails every evaluation.
    #[must_use]
    pub fn resolve(&self, kind: &str) -> Arc<dyn BindingEvaluator> {
        match self.strategies.get(kind) {
            Some(strategy) => Arc::clone(strategy),
            None => Arc::new(ErrorStrategy::new(kind)),
        }
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Globals extracted from the binding's text, ignoring declarations.
    #[must_use]
    pub fn globals_for_binding(&self, binding: &Binding) -> BTreeSet<String> {
        self.resolve(&binding.kind).globals_for_binding(&binding.text)
    }

    /// Globals the binding reads: the declared set when present, else the
    /// extracted one.
    #[must_use]
    pub fn dependencies(&self, binding: &Binding) -> BTreeSet<String> {
        if binding.globals.is_empty() {
            self.globals_for_binding(binding)
        } else {
            binding.globals.clone()
        }
    }

    /// Evaluate `binding` on behalf of cancellation group `group`.
    pub fn evaluate(
        &self,
        group: &str,
        binding: &Binding,
    ) -> BoxFuture<'static, Result<Value, EvalError>> {
        let strategy = self.resolve(&binding.kind);
        let globals = self.dependencies(binding);
        debug!(kind = %binding.kind, group, globals = ?globals, "Evaluating binding");
        strategy.evaluate(group, &binding.text, &globals)
    }

    /// Cancel `group` in every strategy that tracks in-flight work.
    pub fn cancel(&self, group: &str) {
        for strategy in self.strategies.values() {
            strategy.cancel(group);
        }
    }
}

pub struct RegistryBuilder {
    globals: SharedGlobals,
    pool: Option<WorkerPool>,
    kernel: Option<Arc<dyn KernelEvaluator>>,
    config: BindingsConfig,
    extra: Vec<Arc<dyn BindingEvaluator>>,
}

impl RegistryBuilder {
    /// Pool backing `script-query` and `script-js`.
    #[must_use]
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Evaluator backing `kernel`.
    #[must_use]
    pub fn kernel(mut self, kernel: Arc<dyn KernelEvaluator>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    #[must_use]
    pub fn config(mut self, config: BindingsConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a host strategy under its own name. Replaces a built-in of the
    /// same name.
    #[must_use]
    pub fn register(mut self, strategy: Arc<dyn BindingEvaluator>) -> Self {
        self.extra.push(strategy);
        self
    }

    #[must_use]
    pub fn build(self) -> EvaluatorRegistry {
        let BindingsConfig {
            query,
            script,
            kernel: kernel_style,
        } = self.config;

        let builtins: [Arc<dyn BindingEvaluator>; 5] = [
            Arc::new(GlobalStrategy::new(self.globals.clone())),
            Arc::new(NoneStrategy),
            Arc::new(ScriptStrategy::query(self.pool.clone(), query)),
            Arc::new(ScriptStrategy::script(self.pool, script)),
            Arc::new(KernelStrategy::new(self.kernel, self.globals, kernel_style)),
        ];

        let mut strategies = HashMap::new();
        for strategy in builtins {
            strategies.insert(strategy.name().to_string(), strategy);
        }
        for strategy in self.extra {
            let name = strategy.name().to_string();
            if strategies.insert(name.clone(), strategy).is_some() {
                debug!(kind = %name, "Host strategy replaces built-in");
            }
        }
        EvaluatorRegistry { strategies }
    }
}
