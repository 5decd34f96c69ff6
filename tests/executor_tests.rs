mod common;

use anyhow::Result;
use bulkretry::backoff::BackoffPolicy;
use bulkretry::bulk::Batch;
use bulkretry::error::BulkError;
use bulkretry::executor::{self, AttemptListener, AttemptTarget, BatchExecutor, FnExecutor};
use bulkretry::retry::Retry;
use common::{batch_of, outcome_for, slots, Step};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_retry() -> Retry {
    Retry::on_rejection().policy(BackoffPolicy::constant(Duration::from_millis(5), 3))
}

#[tokio::test]
async fn test_inline_executor_drives_retry_rounds() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let executor = Arc::new(executor::from_sync_fn(move |batch: &Batch| {
        let mut seen = recorder.lock().unwrap();
        let steps = if seen.is_empty() {
            vec![Step::Ok, Step::Reject, Step::Reject]
        } else {
            Vec::new()
        };
        seen.push(batch.slots());
        Ok(outcome_for(batch, &steps))
    }));

    let outcome = fast_retry().with_backoff(executor, batch_of(3)).await?;

    assert_eq!(*seen.lock().unwrap(), vec![vec![0, 1, 2], vec![1, 2]]);
    assert_eq!(slots(&outcome), vec![0, 1, 2]);
    assert!(!outcome.has_failures());
    Ok(())
}

#[tokio::test]
async fn test_inline_executor_hard_failure() -> Result<()> {
    let executor = Arc::new(executor::from_sync_fn(|_: &Batch| {
        Err(BulkError::execution(anyhow::anyhow!("connection refused")))
    }));

    let result = fast_retry().with_backoff(executor, batch_of(2)).await;

    assert!(matches!(result, Err(BulkError::Execution(_))));
    Ok(())
}

#[test]
fn test_fn_executor_runs_on_its_own_runtime() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("bulk-io")
        .enable_all()
        .build()?;

    let calls = Arc::new(AtomicUsize::new(0));
    let threads = Arc::new(Mutex::new(Vec::new()));
    let (counter, names) = (calls.clone(), threads.clone());
    let executor = Arc::new(FnExecutor::with_runtime(
        runtime.handle().clone(),
        move |batch: Batch| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            let names = names.clone();
            async move {
                names
                    .lock()
                    .unwrap()
                    .push(std::thread::current().name().map(str::to_string));
                let steps = if first { vec![Step::Reject] } else { Vec::new() };
                Ok(outcome_for(&batch, &steps))
            }
        },
    ));

    // submitted from a plain thread: the retry is scheduled on the runtime
    // the executor reports from
    let outcome = fast_retry().with_sync_backoff(executor, batch_of(2))?;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!outcome.has_failures());
    let threads = threads.lock().unwrap().clone();
    assert_eq!(threads, vec![Some("bulk-io".to_string()); 2]);
    Ok(())
}

#[test]
fn test_fn_executor_without_runtime_fails_attempt() {
    struct Recorder(Mutex<Option<Result<usize, String>>>);

    impl AttemptTarget for Recorder {
        fn on_outcome(self: Arc<Self>, outcome: bulkretry::bulk::BatchOutcome) {
            *self.0.lock().unwrap() = Some(Ok(outcome.len()));
        }

        fn on_failure(self: Arc<Self>, error: BulkError) {
            *self.0.lock().unwrap() = Some(Err(error.to_string()));
        }
    }

    let executor = executor::from_fn(|batch: Batch| async move { Ok(outcome_for(&batch, &[])) });
    let recorder = Arc::new(Recorder(Mutex::new(None)));

    executor.execute(batch_of(1), AttemptListener::new(recorder.clone()));

    let reported = recorder.0.lock().unwrap().clone();
    assert!(matches!(reported, Some(Err(message)) if message.contains("no tokio runtime")));
}
