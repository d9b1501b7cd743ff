//! Bounded worker pool for fire-and-forget work.
//!
//! `size` tasks run at once. Further submissions wait for a free slot, up to
//! `max_blocking_tasks` waiters; in `nonblocking` mode they fail immediately
//! with [`PoolError::Overload`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker pool is overloaded")]
    Overload,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
    max_waiting: usize,
    nonblocking: bool,
    closed: AtomicBool,
    tracker: TaskTracker,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("cap", &self.cap())
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// A `size` of zero means unbounded; a `max_blocking_tasks` of zero
    /// means any number of waiters.
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = if config.size == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.size.min(Semaphore::MAX_PERMITS)
        };
        tracing::debug!(
            size = capacity,
            max_blocking_tasks = config.max_blocking_tasks,
            nonblocking = config.nonblocking,
            "worker pool created"
        );
        WorkerPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                waiting: AtomicUsize::new(0),
                max_waiting: config.max_blocking_tasks,
                nonblocking: config.nonblocking,
                closed: AtomicBool::new(false),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue `task` on the pool.
    ///
    /// Returns once the task has a slot; it then runs in the background.
    /// A panicking task is logged and its slot released.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.inner.tracker.spawn(async move {
            let _permit = permit;
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %detail, "worker pool task panicked");
            }
        });
        Ok(())
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }
        if self.inner.nonblocking {
            return Err(PoolError::Overload);
        }
        let waiting = self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(&self.inner.waiting);
        if self.inner.max_waiting > 0 && waiting >= self.inner.max_waiting {
            return Err(PoolError::Overload);
        }
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Tasks currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Callers currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn cap(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work. Running tasks finish on their own.
    pub fn release(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        self.inner.tracker.close();
        tracing::debug!(running = self.running(), "worker pool released");
    }

    /// Release and wait up to `timeout` for running tasks. Returns `false`
    /// on timeout.
    pub async fn release_timeout(&self, timeout: Duration) -> bool {
        self.release();
        tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
    }
}

type PoolFn<T> = dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync;

/// A pool bound to one function; callers only supply arguments.
pub struct FnPool<T> {
    pool: WorkerPool,
    func: Arc<PoolFn<T>>,
}

impl<T> Clone for FnPool<T> {
    fn clone(&self) -> Self {
        FnPool {
            pool: self.pool.clone(),
            func: self.func.clone(),
        }
    }
}

impl<T: Send + 'static> FnPool<T> {
    pub fn new<F, Fut>(config: &PoolConfig, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        FnPool {
            pool: WorkerPool::new(config),
            func: Arc::new(move |arg: T| -> BoxFuture<'static, ()> { Box::pin(func(arg)) }),
        }
    }

    pub async fn invoke(&self, arg: T) -> Result<(), PoolError> {
        self.pool.submit((self.func)(arg)).await
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn release(&self) {
        self.pool.release();
    }
}
