mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use abe_core::config::PoolConfig;
use abe_core::pool::{FnPool, PoolError, WorkerPool};
use tokio::sync::{Notify, mpsc, oneshot};

fn config(size: usize, max_blocking_tasks: usize, nonblocking: bool) -> PoolConfig {
    PoolConfig {
        size,
        max_blocking_tasks,
        nonblocking,
        ..PoolConfig::default()
    }
}

/// Submit a task that holds its slot until the returned sender fires.
async fn occupy(pool: &WorkerPool) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel::<()>();
    pool.submit(async move {
        let _ = rx.await;
    })
    .await
    .unwrap();
    tx
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ═══ Capacity ═══

#[tokio::test]
async fn test_runs_submitted_tasks() {
    let pool = WorkerPool::new(&config(4, 0, false));
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        pool.submit(async move {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }
    wait_until(|| done.load(Ordering::SeqCst) == 10).await;
    assert_eq!(pool.cap(), 4);
}

#[tokio::test]
async fn test_nonblocking_pool_reports_overload() {
    let pool = WorkerPool::new(&config(1, 0, true));
    let hold = occupy(&pool).await;
    assert_eq!(pool.running(), 1);

    let err = pool.submit(async {}).await.unwrap_err();
    assert_eq!(err, PoolError::Overload);

    hold.send(()).unwrap();
    wait_until(|| pool.running() == 0).await;
    pool.submit(async {}).await.unwrap();
}

#[tokio::test]
async fn test_waiters_are_capped() {
    let pool = WorkerPool::new(&config(1, 1, false));
    let hold = occupy(&pool).await;

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit(async {}).await })
    };
    wait_until(|| pool.waiting() == 1).await;

    assert_eq!(pool.submit(async {}).await.unwrap_err(), PoolError::Overload);

    hold.send(()).unwrap();
    waiter.await.unwrap().unwrap();
    assert_eq!(pool.waiting(), 0);
}

#[tokio::test]
async fn test_panicking_task_frees_its_slot() {
    let pool = WorkerPool::new(&config(1, 0, false));
    pool.submit(async { panic!("task exploded"); }).await.unwrap();

    let ran = Arc::new(Notify::new());
    let signal = ran.clone();
    pool.submit(async move { signal.notify_one() }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), ran.notified())
        .await
        .unwrap();
}

// ═══ Release ═══

#[tokio::test]
async fn test_release_rejects_new_work() {
    let pool = WorkerPool::new(&config(2, 0, false));
    pool.release();
    pool.release();
    assert!(pool.is_closed());
    assert_eq!(pool.submit(async {}).await.unwrap_err(), PoolError::Closed);
}

#[tokio::test]
async fn test_release_timeout_waits_for_running_tasks() {
    let pool = WorkerPool::new(&config(2, 0, false));
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    pool.submit(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();

    assert!(pool.release_timeout(Duration::from_secs(2)).await);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_release_timeout_reports_stuck_tasks() {
    let pool = WorkerPool::new(&config(1, 0, false));
    let _hold = occupy(&pool).await;
    assert!(!pool.release_timeout(Duration::from_millis(50)).await);
}

// ═══ Function pools ═══

#[tokio::test]
async fn test_fn_pool_invokes_bound_function() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = FnPool::new(&config(2, 0, false), move |n: u32| {
        let tx = tx.clone();
        async move {
            tx.send(n * 2).ok();
        }
    });

    pool.invoke(21).await.unwrap();
    assert_eq!(rx.recv().await, Some(42));

    pool.release();
    assert_eq!(pool.invoke(1).await.unwrap_err(), PoolError::Closed);
}

#[tokio::test]
async fn test_engine_task_submission() {
    let engine = common::engine("worker_pool:\n  size: 3\n").await;
    assert_eq!(engine.pool().cap(), 3);

    let (tx, rx) = oneshot::channel();
    engine
        .submit_task(async move {
            tx.send("done").ok();
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), "done");

    let doubled = engine.new_fn_pool(1, |n: u32| async move {
        assert_eq!(n, 4);
    });
    assert_eq!(doubled.pool().cap(), 1);
    doubled.invoke(4).await.unwrap();

    engine.pool().release();
    assert!(engine.submit_task(async {}).await.is_err());
}
