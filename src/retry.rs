//! Retrying partially failed bulk batches with backoff
//!
//! A bulk batch can come back with some operations failed and the rest
//! applied. When every failure was caused by a transient condition (by
//! default a full write queue, [`RejectedExecution`]) the failed operations,
//! and only those, are sent again after a backoff delay. Results from all
//! rounds are merged into one outcome for the caller.
//!
//! Each submission gets its own retry session, which moves through three
//! phases:
//!
//! - awaiting the outcome of an attempt
//! - awaiting the backoff delay before the next attempt
//! - finalized, after the caller has been answered
//!
//! Rounds never overlap, but consecutive rounds usually run on different
//! threads, so all session state sits behind one mutex. The caller's request
//! context is carried into every scheduled round.
//!
//! Three ways to wait for the result are offered:
//!
//! - [`Retry::with_async_backoff`] hands it to a callback
//! - [`Retry::with_backoff`] returns it from a future
//! - [`Retry::with_sync_backoff`] blocks the calling thread

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::backoff::{BackoffObserver, BackoffPolicy, BackoffSchedule};
use crate::bulk::{Batch, BatchOutcome, ItemOutcome};
use crate::context;
use crate::error::{BulkError, RejectedExecution, RetryOn};
use crate::executor::{AttemptListener, AttemptTarget, BatchExecutor};
use crate::scheduler::{ScheduledHandle, Scheduler, TokioScheduler};

/// Caller-side completion of a retry session, invoked exactly once
pub type BulkListener = Box<dyn FnOnce(Result<BatchOutcome, BulkError>) + Send + 'static>;

/// Entry point for retrying bulk batches
///
/// # Examples
///
/// ```
/// use bulkretry::backoff::BackoffPolicy;
/// use bulkretry::bulk::{
///     Batch, BatchOutcome, DocWriteRequest, OperationOutcome, WriteResponse, WriteResult,
/// };
/// use bulkretry::error::BulkError;
/// use bulkretry::executor;
/// use bulkretry::retry::Retry;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let retry = Retry::on_rejection()
///     .policy(BackoffPolicy::constant(Duration::from_millis(10), 3));
///
/// let executor = Arc::new(executor::from_fn(|batch: Batch| async move {
///     // Send the batch to the cluster here
///     let results = batch
///         .iter()
///         .map(|item| {
///             OperationOutcome::Success(WriteResponse {
///                 index: item.request().index_name().to_string(),
///                 id: item.request().id().unwrap_or_default().to_string(),
///                 version: 1,
///                 result: WriteResult::Deleted,
///             })
///         })
///         .collect();
///     Ok::<_, BulkError>(BatchOutcome::from_results(&batch, results, Duration::ZERO))
/// }));
///
/// let batch: Batch = vec![DocWriteRequest::delete("logs", "1")].into_iter().collect();
/// let outcome = retry.with_backoff(executor, batch).await?;
/// println!("took {:?}", outcome.took());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Retry {
    retry_on: RetryOn,
    policy: BackoffPolicy,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("retry_on", &self.retry_on)
            .field("policy", &self.policy)
            .field("custom_scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl Retry {
    /// Retries operations whose root cause is exactly of type `E`
    pub fn on<E: StdError + 'static>() -> Self {
        Self {
            retry_on: RetryOn::of::<E>(),
            policy: BackoffPolicy::default(),
            scheduler: None,
        }
    }

    /// Retries operations rejected by a full write queue
    pub fn on_rejection() -> Self {
        Self::on::<RejectedExecution>()
    }

    /// Sets how long and how often to wait between rounds
    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the scheduler that fires delayed rounds
    ///
    /// Without one, rounds are scheduled on the tokio runtime of the
    /// submitting thread, or failing that, on the runtime of the thread that
    /// reports the failed attempt. A retry that finds no runtime at all ends
    /// the session with [`BulkError::Scheduling`].
    pub fn using(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    fn submission_scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        match &self.scheduler {
            Some(scheduler) => Some(Arc::clone(scheduler)),
            None => Handle::try_current()
                .ok()
                .map(|runtime| Arc::new(TokioScheduler::new(runtime)) as Arc<dyn Scheduler>),
        }
    }

    /// Submits `batch` and returns immediately
    ///
    /// `listener` receives the merged outcome, or the hard failure that
    /// ended the session.
    pub fn with_async_backoff<L>(&self, executor: Arc<dyn BatchExecutor>, batch: Batch, listener: L)
    where
        L: FnOnce(Result<BatchOutcome, BulkError>) + Send + 'static,
    {
        let handler = RetryHandler::new(
            self.retry_on,
            self.policy.schedule(),
            executor,
            self.submission_scheduler(),
            Box::new(listener),
        );
        handler.execute(batch);
    }

    /// Submits `batch` and waits for the merged outcome
    pub async fn with_backoff(
        &self,
        executor: Arc<dyn BatchExecutor>,
        batch: Batch,
    ) -> Result<BatchOutcome, BulkError> {
        let (tx, rx) = oneshot::channel();
        self.with_async_backoff(executor, batch, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or_else(|_| Err(BulkError::SessionAbandoned))
    }

    /// Submits `batch` and blocks the calling thread until the merged outcome is ready
    ///
    /// Must not be called from within an async task; use
    /// [`Retry::with_backoff`] there, or move the call to
    /// `tokio::task::spawn_blocking`. Plain threads work too, as long as
    /// retries have a runtime to be scheduled on: either a scheduler passed
    /// to [`Retry::using`] or an executor that reports from a runtime thread.
    pub fn with_sync_backoff(
        &self,
        executor: Arc<dyn BatchExecutor>,
        batch: Batch,
    ) -> Result<BatchOutcome, BulkError> {
        let (tx, rx) = oneshot::channel();
        self.with_async_backoff(executor, batch, move |result| {
            let _ = tx.send(result);
        });
        rx.blocking_recv()
            .unwrap_or_else(|_| Err(BulkError::SessionAbandoned))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAttempt,
    AwaitingRetryDelay,
    Finalized,
}

/// Mutable state of one retry session
struct Session {
    phase: Phase,
    backoff: BackoffSchedule,
    // needed to build the next batch from the outcome of the current one
    current: Batch,
    responses: Vec<ItemOutcome>,
    scheduled: Option<ScheduledHandle>,
    listener: Option<BulkListener>,
    round: u32,
}

impl Session {
    /// Records outcomes of this round that pass `filter`, slotted by position in the current batch
    fn add_responses(&mut self, outcome: &BatchOutcome, filter: impl Fn(&ItemOutcome) -> bool) {
        let slotted = self
            .current
            .iter()
            .zip(outcome.items())
            .filter(|(_, item)| filter(item))
            .map(|(request, item)| ItemOutcome {
                slot: request.slot(),
                op_type: request.request().op_type(),
                outcome: item.outcome.clone(),
            });
        self.responses.extend(slotted);
    }
}

/// What to do once the session lock is released
enum Next {
    Finish,
    Retry {
        batch: Batch,
        delay: Duration,
        round: u32,
        observer: BackoffObserver,
    },
    Fail(BulkError),
    Ignore,
}

/// Drives one retry session
struct RetryHandler {
    retry_on: RetryOn,
    executor: Arc<dyn BatchExecutor>,
    // resolved on first retry when the submitting thread had no runtime
    scheduler: Option<Arc<dyn Scheduler>>,
    // monotonic, immune to wall clock changes
    start: Instant,
    session: Mutex<Session>,
}

impl RetryHandler {
    fn new(
        retry_on: RetryOn,
        backoff: BackoffSchedule,
        executor: Arc<dyn BatchExecutor>,
        scheduler: Option<Arc<dyn Scheduler>>,
        listener: BulkListener,
    ) -> Arc<Self> {
        Arc::new(Self {
            retry_on,
            executor,
            scheduler,
            start: Instant::now(),
            session: Mutex::new(Session {
                phase: Phase::AwaitingAttempt,
                backoff,
                current: Batch::new(),
                responses: Vec::new(),
                scheduled: None,
                listener: Some(listener),
                round: 0,
            }),
        })
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `batch` to the executor as the next round
    fn execute(self: &Arc<Self>, batch: Batch) {
        let round = {
            let mut session = self.lock_session();
            if session.phase == Phase::Finalized {
                debug!("Bulk retry session already finalized, dropping round");
                return;
            }
            session.phase = Phase::AwaitingAttempt;
            session.current = batch.clone();
            session.scheduled = None;
            session.round += 1;
            session.round
        };

        debug!("Executing bulk round {} with {} operations", round, batch.len());
        let target: Arc<dyn AttemptTarget> = Arc::clone(self) as Arc<dyn AttemptTarget>;
        self.executor.execute(batch, AttemptListener::new(target));
    }

    /// Decides retry eligibility for a round that had failures
    fn can_retry(&self, session: &mut Session, outcome: &BatchOutcome) -> bool {
        if !session.backoff.has_next() {
            debug!("Backoff schedule exhausted, not retrying");
            return false;
        }
        for failure in outcome.failures() {
            let root_cause = failure.root_cause();
            if !self.retry_on.matches(root_cause) {
                trace!(
                    "Not retrying: root cause '{}' is not {}",
                    root_cause,
                    self.retry_on.type_name()
                );
                return false;
            }
        }
        true
    }

    fn retry(self: &Arc<Self>, batch: Batch, delay: Duration, round: u32) {
        trace!("Retry of bulk request scheduled in {} ms", delay.as_millis());

        let scheduler: Arc<dyn Scheduler> = match &self.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => match TokioScheduler::current() {
                Ok(scheduler) => Arc::new(scheduler),
                Err(e) => {
                    warn!("No runtime to schedule bulk retry on: {}", e);
                    self.fail(e);
                    return;
                }
            },
        };

        let handler = Arc::clone(self);
        let task = context::preserve(move || handler.execute(batch));

        match scheduler.schedule(delay, task) {
            Ok(handle) => {
                let mut session = self.lock_session();
                if session.phase == Phase::AwaitingRetryDelay && session.round == round {
                    session.scheduled = Some(handle);
                } else {
                    // the round already fired or the session ended; nothing left to cancel
                    drop(session);
                    handle.cancel();
                }
            }
            Err(e) => {
                warn!("Could not schedule bulk retry: {}", e);
                self.fail(e);
            }
        }
    }

    /// Delivers the merged outcome and cancels any pending round
    fn finish(&self) {
        let (listener, scheduled, mut items) = {
            let mut session = self.lock_session();
            session.phase = Phase::Finalized;
            (
                session.listener.take(),
                session.scheduled.take(),
                std::mem::take(&mut session.responses),
            )
        };
        items.sort_by_key(|item| item.slot);
        let took = self.start.elapsed();

        debug!("Bulk retry session finished with {} items in {:?}", items.len(), took);
        if let Some(listener) = listener {
            listener(Ok(BatchOutcome::new(items, took)));
        }
        if let Some(handle) = scheduled {
            handle.cancel();
        }
    }

    /// Delivers a hard failure and cancels any pending round
    fn fail(&self, error: BulkError) {
        let (listener, scheduled) = {
            let mut session = self.lock_session();
            if session.phase == Phase::Finalized {
                warn!("Ignoring failure after bulk retry session finished: {}", error);
                return;
            }
            session.phase = Phase::Finalized;
            (session.listener.take(), session.scheduled.take())
        };

        debug!("Bulk retry session failed: {}", error);
        if let Some(listener) = listener {
            listener(Err(error));
        }
        if let Some(handle) = scheduled {
            handle.cancel();
        }
    }
}

impl Drop for RetryHandler {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = session.listener.take() {
            // no round is left that could finish the session
            warn!("Bulk retry session dropped before finishing");
            listener(Err(BulkError::SessionAbandoned));
        }
    }
}

impl AttemptTarget for RetryHandler {
    fn on_outcome(self: Arc<Self>, outcome: BatchOutcome) {
        let next = {
            let mut session = self.lock_session();
            if session.phase != Phase::AwaitingAttempt {
                Next::Ignore
            } else if outcome.len() != session.current.len() {
                Next::Fail(BulkError::OutcomeMismatch {
                    expected: session.current.len(),
                    actual: outcome.len(),
                })
            } else if !outcome.has_failures() {
                // we're done here, include all responses
                session.add_responses(&outcome, |_| true);
                Next::Finish
            } else if self.can_retry(&mut session, &outcome) {
                let batch = create_batch_for_retry(&session.current, &outcome);
                match session.backoff.advance() {
                    Some(delay) => {
                        session.add_responses(&outcome, |item| !item.is_failed());
                        session.phase = Phase::AwaitingRetryDelay;
                        Next::Retry {
                            batch,
                            delay,
                            round: session.round,
                            observer: session.backoff.observer(),
                        }
                    }
                    None => {
                        session.add_responses(&outcome, |_| true);
                        Next::Finish
                    }
                }
            } else {
                session.add_responses(&outcome, |_| true);
                Next::Finish
            }
        };

        match next {
            Next::Finish => self.finish(),
            Next::Retry {
                batch,
                delay,
                round,
                observer,
            } => {
                observer.notify(delay);
                debug!(
                    "Retrying {} of {} operations after {:?}",
                    batch.len(),
                    outcome.len(),
                    delay
                );
                self.retry(batch, delay, round);
            }
            Next::Fail(error) => self.fail(error),
            Next::Ignore => warn!("Ignoring bulk outcome delivered outside an attempt"),
        }
    }

    fn on_failure(self: Arc<Self>, error: BulkError) {
        self.fail(error);
    }
}

/// Builds the next round from the operations that failed in this one
///
/// Operations are taken from the batch that produced `outcome`, paired by
/// position, and keep their relative order and original slots.
fn create_batch_for_retry(current: &Batch, outcome: &BatchOutcome) -> Batch {
    let failed = current
        .iter()
        .zip(outcome.items())
        .filter(|(_, item)| item.is_failed())
        .map(|(request, _)| request.clone())
        .collect();
    Batch::from_items(failed)
}
