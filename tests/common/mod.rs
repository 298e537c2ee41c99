//! Shared test utilities and fixtures
//!
//! `Script` is a tiny runner whose text is a `;`-separated list of steps,
//! enough to drive the scheduler, the cache and the globals round-trips
//! from integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use tokio::time::sleep;

use tessera_bindings::EvaluatorRegistry;
use tessera_cache::{CacheCommand, CacheReply};
use tessera_globals::{GlobalStore, SharedGlobals};
use tessera_pool::{KernelEvaluator, PoolConfig, RunKind, TaskRunner, WorkerContext, WorkerPool};
use tessera_types::{GlobalsMap, LockId, TaskFailure, TypeTag, WorkerId};

pub const NO_GLOBALS: &[&str] = &[];

/// Steps:
/// `value <json>`, `echo`, `sleep <ms>` (cancel-aware), `hang <ms>`,
/// `fail <msg>`, `lock <key>`, `read <key>`, `unlock`, `put <key> <text>`,
/// `get <key>`, `global <name>`, `kernel <code>`.
pub struct Script;

impl TaskRunner for Script {
    fn run(
        &mut self,
        _kind: RunKind,
        text: &str,
        globals: &GlobalsMap,
        ctx: &mut WorkerContext<'_>,
    ) -> Result<Value, TaskFailure> {
        let mut last = Value::Null;
        let mut held: Option<(String, LockId)> = None;
        for step in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (op, arg) = step.split_once(' ').unwrap_or((step, ""));
            last = match op {
                "value" => serde_json::from_str(arg).unwrap(),
                "echo" => {
                    let values: serde_json::Map<String, Value> = globals
                        .iter()
                        .map(|(name, global)| (name.clone(), global.value.clone()))
                        .collect();
                    Value::Object(values)
                }
                "sleep" => {
                    let until = Instant::now() + Duration::from_millis(arg.parse().unwrap());
                    while Instant::now() < until {
                        if ctx.is_canceled() {
                            return Err(TaskFailure::new("stopped"));
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                    Value::Null
                }
                "hang" => {
                    thread::sleep(Duration::from_millis(arg.parse().unwrap()));
                    Value::Null
                }
                "fail" => return Err(TaskFailure::new(arg)),
                "lock" | "read" => {
                    let command = CacheCommand::Lock {
                        key: arg.to_string(),
                        is_write: op == "lock",
                    };
                    match ctx.cache(&command)? {
                        CacheReply::Locked { lock_id } => {
                            held = Some((arg.to_string(), lock_id));
                            json!("locked")
                        }
                        other => return Err(TaskFailure::new(format!("{other:?}"))),
                    }
                }
                "unlock" => {
                    let (key, lock_id) = held.take().unwrap();
                    let reply = ctx.cache(&CacheCommand::Unlock { key, lock_id })?;
                    serde_json::to_value(reply).unwrap()
                }
                "put" => {
                    let (key, value) = arg.split_once(' ').unwrap();
                    let command = CacheCommand::Put {
                        key: key.to_string(),
                        value: json!(value),
                        blocking: true,
                        lock_id: held.as_ref().map(|(_, id)| *id),
                    };
                    serde_json::to_value(ctx.cache(&command)?).unwrap()
                }
                "get" => {
                    let command = CacheCommand::Get {
                        key: arg.to_string(),
                        blocking: true,
                        lock_id: held.as_ref().map(|(_, id)| *id),
                    };
                    match ctx.cache(&command)? {
                        CacheReply::Value { value } => value,
                        CacheReply::Miss => json!("miss"),
                        other => return Err(TaskFailure::new(format!("{other:?}"))),
                    }
                }
                "global" => {
                    let fetched = ctx.globals(&[arg])?;
                    fetched
                        .get(arg)
                        .map_or(Value::Null, |global| global.value.clone())
                }
                "kernel" => ctx.kernel_eval(arg)?,
                other => return Err(TaskFailure::new(format!("unknown step {other}"))),
            };
        }
        Ok(last)
    }
}

pub fn script(_: WorkerId) -> Box<dyn TaskRunner> {
    Box::new(Script)
}

/// Store with `region = "emea"` and `year = 2024`.
pub fn sample_globals() -> SharedGlobals {
    let mut store = GlobalStore::new();
    store
        .add_global("region", TypeTag::String, json!("emea"))
        .unwrap();
    store
        .add_global("year", TypeTag::Integer, json!(2024))
        .unwrap();
    store.set_clean();
    SharedGlobals::new(store)
}

pub fn start_pool(globals: &SharedGlobals, config: PoolConfig) -> WorkerPool {
    WorkerPool::builder(script)
        .config(config)
        .globals(globals.clone())
        .kernel(Arc::new(EchoKernel))
        .start()
}

pub fn registry(globals: &SharedGlobals, pool: &WorkerPool) -> EvaluatorRegistry {
    EvaluatorRegistry::builder(globals.clone())
        .pool(pool.clone())
        .kernel(Arc::new(EchoKernel))
        .build()
}

/// Kernel that answers with the code it ran and the globals it was given.
pub struct EchoKernel;

impl KernelEvaluator for EchoKernel {
    fn eval(&self, code: &str, globals: GlobalsMap) -> BoxFuture<'static, Result<Value, String>> {
        let code = code.to_string();
        async move {
            let values: serde_json::Map<String, Value> = globals
                .into_iter()
                .map(|(name, global)| (name, global.value))
                .collect();
            Ok::<_, String>(json!({ "code": code, "globals": values }))
        }
        .boxed()
    }
}

pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}
