//! The seam between the retry coordinator and whatever runs a batch
//!
//! A [`BatchExecutor`] receives a batch and an [`AttemptListener`]. The
//! listener is consumed by the first report, so an executor can answer each
//! attempt at most once. Dropping it without reporting counts as a hard
//! failure, so it also answers at least once.

use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;

use crate::bulk::{Batch, BatchOutcome};
use crate::context::ContextSnapshot;
use crate::error::BulkError;

/// Runs one batch and reports its outcome to the listener
pub trait BatchExecutor: Send + Sync + 'static {
    fn execute(&self, batch: Batch, listener: AttemptListener);
}

/// Receiver of attempt results
pub trait AttemptTarget: Send + Sync + 'static {
    /// The batch ran and produced one outcome per operation
    fn on_outcome(self: Arc<Self>, outcome: BatchOutcome);

    /// The batch could not produce any per-operation outcome
    fn on_failure(self: Arc<Self>, error: BulkError);
}

/// One-shot completion handle for a single attempt
pub struct AttemptListener {
    target: Option<Arc<dyn AttemptTarget>>,
}

impl AttemptListener {
    pub fn new(target: Arc<dyn AttemptTarget>) -> Self {
        Self {
            target: Some(target),
        }
    }

    pub fn on_outcome(mut self, outcome: BatchOutcome) {
        if let Some(target) = self.target.take() {
            target.on_outcome(outcome);
        }
    }

    pub fn on_failure(mut self, error: BulkError) {
        if let Some(target) = self.target.take() {
            target.on_failure(error);
        }
    }

    pub fn complete(self, result: Result<BatchOutcome, BulkError>) {
        match result {
            Ok(outcome) => self.on_outcome(outcome),
            Err(error) => self.on_failure(error),
        }
    }
}

impl Drop for AttemptListener {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            warn!("Attempt listener dropped without an outcome");
            target.on_failure(BulkError::ListenerDropped);
        }
    }
}

/// Executor built from an async function
///
/// Each batch runs as its own tokio task, with the caller's request context
/// and span carried into it.
pub struct FnExecutor<F> {
    f: F,
    runtime: Option<Handle>,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BatchOutcome, BulkError>> + Send + 'static,
{
    /// Runs batches on the given runtime
    pub fn with_runtime(runtime: Handle, f: F) -> Self {
        Self {
            f,
            runtime: Some(runtime),
        }
    }
}

impl<F, Fut> BatchExecutor for FnExecutor<F>
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BatchOutcome, BulkError>> + Send + 'static,
{
    fn execute(&self, batch: Batch, listener: AttemptListener) {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                listener.on_failure(BulkError::execution(anyhow::anyhow!(
                    "no tokio runtime available to execute the batch"
                )));
                return;
            }
        };

        let fut = (self.f)(batch);
        let snapshot = ContextSnapshot::capture();
        runtime.spawn(snapshot.instrument(async move {
            listener.complete(fut.await);
        }));
    }
}

/// Executor from an async function, bound to the runtime active at the call
/// site if there is one, otherwise to the runtime of each submitting thread
pub fn from_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BatchOutcome, BulkError>> + Send + 'static,
{
    FnExecutor {
        f,
        runtime: Handle::try_current().ok(),
    }
}

/// Executor that runs the batch inline and reports before returning
pub struct SyncFnExecutor<F> {
    f: F,
}

impl<F> BatchExecutor for SyncFnExecutor<F>
where
    F: Fn(&Batch) -> Result<BatchOutcome, BulkError> + Send + Sync + 'static,
{
    fn execute(&self, batch: Batch, listener: AttemptListener) {
        listener.complete((self.f)(&batch));
    }
}

pub fn from_sync_fn<F>(f: F) -> SyncFnExecutor<F>
where
    F: Fn(&Batch) -> Result<BatchOutcome, BulkError> + Send + Sync + 'static,
{
    SyncFnExecutor { f }
}
