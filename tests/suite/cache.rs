//! Cross-worker cache behaviour as seen by tasks.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use tessera_pool::PoolConfig;
use tessera_types::EvalError;

use crate::common::{NO_GLOBALS, sample_globals, settle, start_pool};

fn config() -> PoolConfig {
    PoolConfig::default()
        .with_max_worker_count(3)
        .with_cancel_timeout(Duration::from_millis(100))
}

#[tokio::test]
async fn values_are_shared_between_tasks() {
    let pool = start_pool(&sample_globals(), config());

    let put = pool.run_query("writer", "put report ready", NO_GLOBALS).await;
    assert_eq!(put.unwrap(), json!({ "status": "ok" }));

    let got = pool.run_eval("reader", "get report", NO_GLOBALS).await;
    assert_eq!(got.unwrap(), json!("ready"));

    let miss = pool.run_eval("reader", "get nothing", NO_GLOBALS).await;
    assert_eq!(miss.unwrap(), json!("miss"));
}

#[tokio::test]
async fn write_lock_blocks_until_unlocked() {
    let pool = start_pool(&sample_globals(), config());

    let holder = pool.run_query("a", "lock k; sleep 150; put k first; unlock; value 1", NO_GLOBALS);
    settle().await;
    let waiter = pool.run_query("b", "lock k; get k", NO_GLOBALS);

    assert_eq!(holder.await.unwrap(), json!(1));
    let result = timeout(Duration::from_secs(1), waiter).await.unwrap();
    assert_eq!(result.unwrap(), json!("first"));
}

#[tokio::test]
async fn read_locks_are_shared() {
    let pool = start_pool(&sample_globals(), config());

    let first = pool.run_query("a", "read k; sleep 100; value 1", NO_GLOBALS);
    settle().await;
    // Never unlocked, so a second reader only gets in if readers share.
    let second = pool.run_query("b", "read k; value 2", NO_GLOBALS);

    let result = timeout(Duration::from_secs(1), second).await.unwrap();
    assert_eq!(result.unwrap(), json!(2));
    assert_eq!(first.await.unwrap(), json!(1));

    let mut writer = pool.run_query("c", "lock k; value 3", NO_GLOBALS);
    assert!(timeout(Duration::from_millis(100), &mut writer).await.is_err());
    pool.cancel_tasks("c");
    assert_eq!(writer.await, Err(EvalError::Canceled));
}

#[tokio::test]
async fn killed_holder_hands_lock_to_waiter() {
    let pool = start_pool(&sample_globals(), config());

    let holder = pool.run_query("a", "lock k; hang 3000", NO_GLOBALS);
    settle().await;
    let mut waiter = pool.run_query("b", "lock k; value 7", NO_GLOBALS);
    assert!(timeout(Duration::from_millis(100), &mut waiter).await.is_err());

    // The holder ignores the graceful cancel and is killed after the timeout.
    pool.cancel_tasks("a");
    assert_eq!(holder.await, Err(EvalError::Canceled));
    let result = timeout(Duration::from_secs(1), waiter).await.unwrap();
    assert_eq!(result.unwrap(), json!(7));
}

#[tokio::test]
async fn canceled_waiter_leaves_the_queue() {
    let pool = start_pool(&sample_globals(), config());

    let holder = pool.run_query("a", "lock k; sleep 200; unlock; value 1", NO_GLOBALS);
    settle().await;
    let waiter = pool.run_query("b", "lock k; value 2", NO_GLOBALS);
    settle().await;
    pool.cancel_tasks("b");
    assert_eq!(waiter.await, Err(EvalError::Canceled));

    assert_eq!(holder.await.unwrap(), json!(1));

    // The canceled waiter never received the lock, so a new task gets it.
    let next = pool.run_query("c", "lock k; value 3", NO_GLOBALS);
    let result = timeout(Duration::from_secs(1), next).await.unwrap();
    assert_eq!(result.unwrap(), json!(3));
}
