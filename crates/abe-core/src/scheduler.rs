//! Cron-style job scheduler.
//!
//! Schedules are six-field cron expressions with seconds
//! (`"*/5 * * * * *"`), the usual `@hourly`/`@daily` descriptors, or
//! `@every <duration>` (`"@every 1m30s"`). A run that is still in progress
//! when the next tick arrives causes that tick to be skipped; a panicking
//! job is logged and scheduled again.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::parse_duration;
use crate::error::AbeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid schedule {spec:?}: {reason}")]
    InvalidSchedule { spec: String, reason: String },

    #[error("scheduler is stopped")]
    Stopped,
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self) -> Result<(), AbeError>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: Fn() -> BoxFuture<'static, Result<(), AbeError>> + Send + Sync + 'static,
{
    async fn run(&self) -> Result<(), AbeError> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum Trigger {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Trigger {
    fn parse(spec: &str) -> Result<Self, SchedulerError> {
        let spec = spec.trim();
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            spec: spec.to_string(),
            reason,
        };
        if let Some(every) = spec.strip_prefix("@every") {
            let interval = parse_duration(every.trim()).map_err(invalid)?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".into()));
            }
            return Ok(Trigger::Every(interval));
        }
        cron::Schedule::from_str(spec)
            .map(|s| Trigger::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    fn next_delay(&self) -> Option<Duration> {
        match self {
            Trigger::Every(interval) => Some(*interval),
            Trigger::Cron(schedule) => {
                let next = schedule.upcoming(Local).next()?;
                Some((next - Local::now()).to_std().unwrap_or_default())
            }
        }
    }
}

/// Handle to the engine's job scheduler.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    jobs: Mutex<HashMap<JobId, CancellationToken>>,
    next_id: AtomicU64,
    root: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job`. Must be called from within a tokio runtime.
    pub fn add_job<J: Job>(&self, spec: &str, job: J) -> Result<JobId, SchedulerError> {
        self.add_arc(spec, Arc::new(job))
    }

    pub fn add_fn<F, Fut>(&self, spec: &str, f: F) -> Result<JobId, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AbeError>> + Send + 'static,
    {
        let job = FnJob(move || -> BoxFuture<'static, Result<(), AbeError>> { Box::pin(f()) });
        self.add_arc(spec, Arc::new(job))
    }

    fn add_arc(&self, spec: &str, job: Arc<dyn Job>) -> Result<JobId, SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        let trigger = Trigger::parse(spec)?;
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let token = self.inner.root.child_token();
        self.inner.jobs.lock().insert(id, token.clone());

        let tracker = self.inner.tracker.clone();
        let spec = spec.to_string();
        tracing::info!(job = %id, schedule = %spec, "job scheduled");
        self.inner.tracker.spawn(async move {
            let running = Arc::new(AtomicBool::new(false));
            loop {
                let Some(delay) = trigger.next_delay() else {
                    tracing::debug!(job = %id, schedule = %spec, "schedule has no upcoming run");
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if running.swap(true, Ordering::SeqCst) {
                    tracing::debug!(job = %id, "previous run still active, skipping");
                    continue;
                }
                let job = job.clone();
                let running = running.clone();
                tracker.spawn(async move {
                    match AssertUnwindSafe(job.run()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::error!(job = %id, error = %err, "scheduled job failed"),
                        Err(_) => tracing::error!(job = %id, "scheduled job panicked"),
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        });
        Ok(id)
    }

    /// Unschedule a job. A run already in progress is not interrupted.
    pub fn remove_job(&self, id: JobId) -> bool {
        match self.inner.jobs.lock().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop scheduling and wait for in-progress runs.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.root.cancel();
        self.inner.jobs.lock().clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::debug!("scheduler stopped");
    }
}
