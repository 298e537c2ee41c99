//! Registry → strategy → pool, end to end.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tessera_bindings::{Binding, EvaluatorRegistry, kind};
use tessera_pool::PoolConfig;
use tessera_types::EvalError;

use crate::common::{registry, sample_globals, settle, start_pool};

#[tokio::test]
async fn query_binding_receives_extracted_globals() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let binding = Binding::new(kind::SCRIPT_QUERY, "echo @region");
    let value = registry.evaluate("g", &binding).await.unwrap();
    assert_eq!(value, json!({ "region": "emea" }));
}

#[tokio::test]
async fn script_binding_receives_member_globals() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let binding = Binding::new(kind::SCRIPT_JS, "echo globals.year, globals.region");
    let value = registry.evaluate("g", &binding).await.unwrap();
    assert_eq!(value, json!({ "region": "emea", "year": 2024 }));
}

#[tokio::test]
async fn declared_globals_replace_extracted_ones() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let binding = Binding::new(kind::SCRIPT_QUERY, "echo @region").with_globals(["year"]);
    let value = registry.evaluate("g", &binding).await.unwrap();
    assert_eq!(value, json!({ "year": 2024 }));
}

#[tokio::test]
async fn store_writes_after_evaluate_do_not_reach_the_task() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let pending = registry.evaluate("g", &Binding::new(kind::SCRIPT_QUERY, "sleep 30; echo @year"));
    globals.update(|g| g.set("year", json!(1999))).unwrap();

    assert_eq!(pending.await.unwrap(), json!({ "year": 2024 }));
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriber_reevaluates_binding_on_change() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = Arc::new(registry(&globals, &pool));

    let (tx, mut results) = mpsc::unbounded_channel();
    let chart = Binding::new(kind::SCRIPT_QUERY, "echo @region");
    globals.update(|store| {
        store.subscribe(Box::new(move |change| {
            if change.name == "region" {
                let _ = tx.send(registry.evaluate("chart", &chart));
            }
        }))
    });

    let writer = globals.clone();
    let write = tokio::task::spawn_blocking(move || {
        writer.update(|g| g.set("region", json!("apac")))
    });
    timeout(Duration::from_secs(1), write)
        .await
        .expect("writer blocked on its own subscriber")
        .unwrap()
        .unwrap();

    let reevaluated = results.recv().await.unwrap();
    assert_eq!(reevaluated.await.unwrap(), json!({ "region": "apac" }));
}

#[tokio::test]
async fn second_evaluation_in_group_supersedes_first() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let first = registry.evaluate("chart", &Binding::new(kind::SCRIPT_QUERY, "sleep 2000; value 1"));
    let second = registry.evaluate("chart", &Binding::new(kind::SCRIPT_JS, "value 2"));

    assert_eq!(first.await, Err(EvalError::Canceled));
    assert_eq!(second.await.unwrap(), json!(2));
}

#[tokio::test]
async fn registry_cancel_reaches_the_pool() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let running = registry.evaluate("chart", &Binding::new(kind::SCRIPT_QUERY, "sleep 2000"));
    settle().await;
    registry.cancel("chart");

    let result = timeout(Duration::from_secs(1), running).await.unwrap();
    assert_eq!(result, Err(EvalError::Canceled));
}

#[tokio::test]
async fn global_and_none_bindings_need_no_pool() {
    let registry = EvaluatorRegistry::builder(sample_globals()).build();

    let year = registry.evaluate("g", &Binding::new(kind::GLOBAL, "year")).await;
    assert_eq!(year.unwrap(), json!(2024));

    let none = registry.evaluate("g", &Binding::new(kind::NONE, "@year")).await;
    assert_eq!(none.unwrap(), json!(null));

    let script = registry
        .evaluate("g", &Binding::new(kind::SCRIPT_QUERY, "value 1"))
        .await;
    assert!(matches!(script, Err(EvalError::Binding(_))));
}

#[tokio::test]
async fn kernel_binding_gets_a_snapshot_of_its_dependencies() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let binding = Binding::new(kind::KERNEL, "# @region\ndf[@region, @year]");
    assert_eq!(
        registry.dependencies(&binding),
        BTreeSet::from(["region".to_string()])
    );
    let value = registry.evaluate("g", &binding).await.unwrap();
    assert_eq!(
        value,
        json!({ "code": "# @region\ndf[@region, @year]", "globals": { "region": "emea" } })
    );
}

#[tokio::test]
async fn worker_kernel_round_trip_uses_task_globals() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let binding = Binding::new(kind::SCRIPT_JS, "kernel plot(globals.region)");
    let value = registry.evaluate("g", &binding).await.unwrap();
    assert_eq!(
        value,
        json!({ "code": "plot(globals.region)", "globals": { "region": "emea" } })
    );
}

#[tokio::test]
async fn unknown_kind_fails_without_touching_the_pool() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());
    let registry = registry(&globals, &pool);

    let err = registry
        .evaluate("g", &Binding::new("sparkline", "@year"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EvalError::Binding("unknown binding kind 'sparkline'".to_string())
    );
    assert_eq!(pool.stats().await.unwrap().workers, 0);
}
