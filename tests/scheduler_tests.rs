use anyhow::Result;
use bulkretry::context::{self, RequestContext};
use bulkretry::error::BulkError;
use bulkretry::scheduler::{ScheduledHandle, Scheduler, TokioScheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[tokio::test]
async fn test_task_fires_after_delay() -> Result<()> {
    let scheduler = TokioScheduler::current()?;
    let (tx, rx) = oneshot::channel();

    let start = Instant::now();
    let handle = scheduler.schedule(
        Duration::from_millis(30),
        Box::new(move || {
            let _ = tx.send(Instant::now());
        }),
    )?;

    let fired_at = rx.await?;
    assert!(fired_at.duration_since(start) >= Duration::from_millis(30));
    assert!(handle.is_fired());
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_firing_prevents_task() -> Result<()> {
    let scheduler = TokioScheduler::current()?;
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let handle = scheduler.schedule(
        Duration::from_millis(30),
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )?;

    assert!(handle.cancel());
    assert!(!handle.cancel(), "second cancel must be a no-op");
    assert!(handle.is_cancelled());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_firing_is_a_no_op() -> Result<()> {
    let scheduler = TokioScheduler::current()?;
    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();

    let counter = runs.clone();
    let handle = scheduler.schedule(
        Duration::from_millis(5),
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }),
    )?;
    rx.await?;

    assert!(!handle.cancel());
    assert!(!handle.cancel());
    assert!(handle.is_fired());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_fire_and_cancel_are_exclusive() {
    let handle = ScheduledHandle::new();
    assert!(handle.cancel());
    assert!(!handle.try_fire());

    let handle = ScheduledHandle::new();
    assert!(handle.try_fire());
    assert!(!handle.try_fire());
    assert!(!handle.cancel());
}

#[tokio::test]
async fn test_shutdown_scheduler_rejects_tasks() -> Result<()> {
    let scheduler = TokioScheduler::current()?;
    scheduler.shutdown();

    let result = scheduler.schedule(Duration::ZERO, Box::new(|| {}));

    assert!(matches!(result, Err(BulkError::Scheduling(_))));
    Ok(())
}

#[test]
fn test_current_requires_runtime() {
    assert!(matches!(
        TokioScheduler::current(),
        Err(BulkError::Scheduling(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preserved_context_is_restored_on_fire() -> Result<()> {
    let scheduler = TokioScheduler::current()?;
    let observed = Arc::new(Mutex::new(None));
    let (tx, rx) = oneshot::channel();

    let ctx = RequestContext::new().with_header("x-opaque-id", "scheduled");
    let sink = observed.clone();
    let task = ctx.sync_scope(|| {
        context::preserve(move || {
            *sink.lock().unwrap() = RequestContext::current();
            let _ = tx.send(());
        })
    });

    // scheduled from a task that has no context of its own
    scheduler.schedule(Duration::from_millis(5), task)?;
    rx.await?;

    let seen = observed.lock().unwrap().clone();
    assert_eq!(
        seen.as_ref().and_then(|c| c.header("x-opaque-id")),
        Some("scheduled")
    );
    assert!(RequestContext::current().is_none());
    Ok(())
}
