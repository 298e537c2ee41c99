//! Pool sizing, supersession and recovery.

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use tessera_pool::PoolConfig;
use tessera_types::{EvalError, TaskFailure};

use crate::common::{NO_GLOBALS, sample_globals, settle, start_pool};

#[tokio::test]
async fn only_the_latest_task_of_a_group_resolves() {
    let pool = start_pool(&sample_globals(), PoolConfig::default().with_max_worker_count(2));

    let a = pool.run_query("g1", "sleep 2000; value 1", NO_GLOBALS);
    let b = pool.run_query("g1", "sleep 2000; value 2", NO_GLOBALS);
    let c = pool.run_query("g1", "value 3", NO_GLOBALS);

    assert_eq!(a.await, Err(EvalError::Canceled));
    assert_eq!(b.await, Err(EvalError::Canceled));
    assert_eq!(c.await.unwrap(), json!(3));
}

#[tokio::test]
async fn runner_failures_reach_the_caller() {
    let pool = start_pool(&sample_globals(), PoolConfig::default());
    let err = pool.run_eval("g", "fail division by zero", NO_GLOBALS).await;
    assert_eq!(
        err,
        Err(EvalError::Task(TaskFailure::new("division by zero")))
    );
}

#[tokio::test]
async fn idle_pool_settles_at_one_worker() {
    let config = PoolConfig::default()
        .with_max_worker_count(2)
        .with_soft_idle_count(1)
        .with_kill_after(Duration::from_millis(100))
        .with_cleanup_interval(Duration::from_millis(20));
    let pool = start_pool(&sample_globals(), config);

    pool.run_query("g", "value 1", NO_GLOBALS).await.unwrap();
    sleep(Duration::from_millis(400)).await;

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.busy, 0);

    // Still one after several more sweeps.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.stats().await.unwrap().workers, 1);

    // And it grows back on demand.
    let x = pool.run_query("x", "sleep 50; value 1", NO_GLOBALS);
    let y = pool.run_query("y", "sleep 50; value 2", NO_GLOBALS);
    assert_eq!(pool.stats().await.unwrap().workers, 2);
    assert_eq!(x.await.unwrap(), json!(1));
    assert_eq!(y.await.unwrap(), json!(2));
}

#[tokio::test]
async fn growth_is_bounded_by_pending_plus_soft_idle() {
    let config = PoolConfig::default()
        .with_max_worker_count(4)
        .with_soft_idle_count(1);
    let pool = start_pool(&sample_globals(), config);

    let a = pool.run_query("a", "sleep 300; value 1", NO_GLOBALS);
    let b = pool.run_query("b", "sleep 300; value 2", NO_GLOBALS);
    settle().await;
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.workers, stats.busy, stats.pending), (2, 2, 0));

    // Two busy workers, one queued task: the bound is still two.
    let c = pool.run_query("c", "value 3", NO_GLOBALS);
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.workers, stats.pending), (2, 1));

    assert_eq!(a.await.unwrap(), json!(1));
    assert_eq!(b.await.unwrap(), json!(2));
    assert_eq!(c.await.unwrap(), json!(3));
}

#[tokio::test]
async fn hung_worker_is_replaced_after_cancel_timeout() {
    let config = PoolConfig::default()
        .with_max_worker_count(1)
        .with_soft_idle_count(0)
        .with_cancel_timeout(Duration::from_millis(100));
    let pool = start_pool(&sample_globals(), config);

    let stuck = pool.run_query("g", "hang 3000", NO_GLOBALS);
    settle().await;
    // Queued behind the stuck task on the only worker.
    let queued = pool.run_query("other", "value 9", NO_GLOBALS);
    pool.cancel_tasks("g");

    assert_eq!(
        timeout(Duration::from_secs(1), stuck).await.unwrap(),
        Err(EvalError::Canceled)
    );
    assert_eq!(
        timeout(Duration::from_secs(1), queued).await.unwrap().unwrap(),
        json!(9)
    );
}

#[tokio::test]
async fn globals_round_trip_sees_live_store() {
    let globals = sample_globals();
    let pool = start_pool(&globals, PoolConfig::default());

    let task = pool.run_query("g", "sleep 50; global region", NO_GLOBALS);
    globals.update(|g| g.set("region", json!("apac"))).unwrap();
    assert_eq!(task.await.unwrap(), json!("apac"));
}

#[tokio::test]
async fn dropping_every_handle_stops_the_pool() {
    let pool = start_pool(&sample_globals(), PoolConfig::default());
    let running = pool.run_query("g", "sleep 2000", NO_GLOBALS);
    settle().await;

    drop(pool);
    let result = timeout(Duration::from_secs(1), running).await.unwrap();
    assert_eq!(result, Err(EvalError::Canceled));
}
