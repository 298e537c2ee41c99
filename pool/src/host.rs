//! Services the host application lends to the pool.

use futures_util::future::BoxFuture;
use serde_json::Value;

use tessera_types::GlobalsMap;

/// Out-of-process evaluator behind the `kernel` binding kind.
///
/// Errors are plain messages; the caller decides how to surface them.
pub trait KernelEvaluator: Send + Sync {
    fn eval(&self, code: &str, globals: GlobalsMap) -> BoxFuture<'static, Result<Value, String>>;
}

/// Proxy for HTTP fetches issued from inside a worker.
pub trait FetchProxy: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Value, String>>;
}
