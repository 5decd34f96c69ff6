#![allow(dead_code)]

use bulkretry::bulk::{
    Batch, BatchOutcome, DocWriteRequest, OperationFailure, OperationOutcome, WriteResponse,
    WriteResult,
};
use bulkretry::context::{ContextSnapshot, RequestContext};
use bulkretry::error::{BulkError, RejectedExecution};
use bulkretry::executor::{AttemptListener, BatchExecutor};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

/// What the scripted executor does with one operation
#[derive(Clone, Copy)]
pub enum Step {
    Ok,
    /// Rejected by a full queue, the retryable cause
    Reject,
    /// Fails with a plain message, never retryable
    Fail,
    /// Fails with a custom cause
    Cause(fn() -> anyhow::Error),
}

/// What the scripted executor does with one whole batch
pub enum Round {
    Steps(Vec<Step>),
    HardFailure,
    WrongLength,
    DropListener,
}

pub fn rejection() -> RejectedExecution {
    RejectedExecution {
        queue: "write".to_string(),
        capacity: 1,
        operation: "index".to_string(),
    }
}

/// Executor answering each round from a script, asynchronously
///
/// Rounds beyond the script succeed for every operation.
pub struct ScriptedExecutor {
    rounds: Mutex<VecDeque<Round>>,
    seen: Mutex<Vec<Vec<usize>>>,
    contexts: Mutex<Vec<Option<String>>>,
    calls: AtomicUsize,
    runtime: Handle,
}

impl ScriptedExecutor {
    pub fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            seen: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            runtime: Handle::current(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Original slots of every batch received, in order
    pub fn seen(&self) -> Vec<Vec<usize>> {
        self.seen.lock().unwrap().clone()
    }

    /// `x-opaque-id` header active when each batch was submitted
    pub fn contexts(&self) -> Vec<Option<String>> {
        self.contexts.lock().unwrap().clone()
    }
}

/// Outcome of `batch` answering position `i` with `steps[i]`, success past the end
pub fn outcome_for(batch: &Batch, steps: &[Step]) -> BatchOutcome {
    let results = batch
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let request = item.request();
            match steps.get(position).copied().unwrap_or(Step::Ok) {
                Step::Ok => OperationOutcome::Success(WriteResponse {
                    index: request.index_name().to_string(),
                    id: request.id().unwrap_or_default().to_string(),
                    version: 1,
                    result: WriteResult::Created,
                }),
                Step::Reject => OperationOutcome::Failure(OperationFailure::for_request(
                    request,
                    anyhow::Error::new(rejection()).context("failed to execute bulk item"),
                )),
                Step::Fail => OperationOutcome::Failure(OperationFailure::for_request(
                    request,
                    anyhow::anyhow!("mapper parsing failed"),
                )),
                Step::Cause(cause) => {
                    OperationOutcome::Failure(OperationFailure::for_request(request, cause()))
                }
            }
        })
        .collect();
    BatchOutcome::from_results(batch, results, Duration::from_millis(1))
}

impl BatchExecutor for ScriptedExecutor {
    fn execute(&self, batch: Batch, listener: AttemptListener) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(batch.slots());
        self.contexts.lock().unwrap().push(
            RequestContext::current().and_then(|ctx| ctx.header("x-opaque-id").map(str::to_string)),
        );

        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Round::Steps(Vec::new()));

        let result = match round {
            Round::Steps(steps) => Ok(outcome_for(&batch, &steps)),
            Round::HardFailure => Err(BulkError::execution(anyhow::anyhow!("node disconnected"))),
            Round::WrongLength => {
                let mut outcome = outcome_for(&batch, &[]).into_items();
                outcome.pop();
                Ok(BatchOutcome::new(outcome, Duration::from_millis(1)))
            }
            Round::DropListener => {
                self.runtime.spawn(async move { drop(listener) });
                return;
            }
        };

        // answer on another task, carrying the caller's context like a transport would
        let snapshot = ContextSnapshot::capture();
        self.runtime.spawn(snapshot.instrument(async move {
            listener.complete(result);
        }));
    }
}

/// `n` index operations with ids `doc-0` .. `doc-{n-1}`
pub fn batch_of(n: usize) -> Batch {
    (0..n)
        .map(|i| {
            DocWriteRequest::index_with_id("test", format!("doc-{}", i), serde_json::json!({ "n": i }))
        })
        .collect()
}

/// Slots of the items in a final outcome
pub fn slots(outcome: &BatchOutcome) -> Vec<usize> {
    outcome.items().iter().map(|item| item.slot).collect()
}

/// Slots of the failed items in a final outcome
pub fn failed_slots(outcome: &BatchOutcome) -> Vec<usize> {
    outcome
        .items()
        .iter()
        .filter(|item| item.is_failed())
        .map(|item| item.slot)
        .collect()
}
