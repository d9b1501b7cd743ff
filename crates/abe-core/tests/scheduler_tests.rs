use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use abe_core::AbeError;
use abe_core::scheduler::{Job, Scheduler, SchedulerError};
use async_trait::async_trait;

fn counter_job(scheduler: &Scheduler, spec: &str, count: &Arc<AtomicUsize>) {
    let count = count.clone();
    scheduler
        .add_fn(spec, move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
}

// ═══ Schedules ═══

#[tokio::test]
async fn test_accepts_cron_and_descriptors() {
    let scheduler = Scheduler::new();
    scheduler.add_fn("*/5 * * * * *", || async { Ok(()) }).unwrap();
    scheduler.add_fn("@hourly", || async { Ok(()) }).unwrap();
    scheduler.add_fn("@every 1m30s", || async { Ok(()) }).unwrap();
    assert_eq!(scheduler.len(), 3);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_rejects_invalid_schedules() {
    let scheduler = Scheduler::new();
    for spec in ["not a schedule", "@every 0s", "@every soon"] {
        let err = scheduler.add_fn(spec, || async { Ok(()) }).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }), "{spec}: {err:?}");
    }
    assert!(scheduler.is_empty());
}

// ═══ Execution ═══

#[tokio::test(start_paused = true)]
async fn test_every_runs_on_interval() {
    let scheduler = Scheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    counter_job(&scheduler, "@every 1s", &count);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    scheduler.stop().await;
}

struct Slow {
    starts: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for Slow {
    async fn run(&self) -> Result<(), AbeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_ticks_are_skipped() {
    let scheduler = Scheduler::new();
    let starts = Arc::new(AtomicUsize::new(0));
    scheduler
        .add_job("@every 1s", Slow { starts: starts.clone() })
        .unwrap();

    // runs start at 1s and 4s; the ticks at 2s, 3s and 5s find a run in progress
    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_jobs_keep_their_schedule() {
    let scheduler = Scheduler::new();
    let panics = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let counter = panics.clone();
    scheduler
        .add_fn("@every 1s", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                    panic!("job exploded");
                }
                Ok(())
            }
        })
        .unwrap();
    let counter = errors.clone();
    scheduler
        .add_fn("@every 1s", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AbeError::Internal("job failed".into()))
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(panics.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_job_stops_running() {
    let scheduler = Scheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count_in_job = count.clone();
    let id = scheduler
        .add_fn("@every 1s", move || {
            let count = count_in_job.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(scheduler.remove_job(id));
    assert!(!scheduler.remove_job(id));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ═══ Stop ═══

#[tokio::test(start_paused = true)]
async fn test_stop_waits_and_rejects_new_jobs() {
    let scheduler = Scheduler::new();
    let starts = Arc::new(AtomicUsize::new(0));
    scheduler
        .add_job("@every 1s", Slow { starts: starts.clone() })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    let began = tokio::time::Instant::now();
    scheduler.stop().await;
    // the in-progress run finishes before stop returns
    assert!(began.elapsed() >= Duration::from_millis(2400));
    assert!(scheduler.is_stopped());
    assert!(scheduler.is_empty());

    let err = scheduler.add_fn("@every 1s", || async { Ok(()) }).unwrap_err();
    assert_eq!(err, SchedulerError::Stopped);

    // stopping twice is harmless
    scheduler.stop().await;
}
