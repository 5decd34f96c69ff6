//! In-memory cluster for driving bulk retries end to end
//!
//! [`SimulatedCluster`] executes bulk batches against a versioned document
//! map behind a bounded [`WriteQueue`]. Operations beyond the queue's
//! capacity are rejected with [`RejectedExecution`], which is exactly the
//! partial failure the retry coordinator is built to recover from. Invalid
//! requests and updates of missing documents fail permanently.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::bulk::{
    Batch, BatchOutcome, DocWriteRequest, ItemOutcome, OperationFailure, OperationOutcome,
    WriteResponse, WriteResult,
};
use crate::context::ContextSnapshot;
use crate::error::{BulkError, RejectedExecution};
use crate::executor::{AttemptListener, BatchExecutor};
use crate::rate_limit::WriteQueue;
use crate::validation::validate_request;

/// Update target does not exist
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{index}][{id}]: document missing")]
pub struct DocumentMissing {
    pub index: String,
    pub id: String,
}

/// Tuning of the simulated cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Operations the write queue accepts per refill period
    pub queue_capacity: usize,
    /// Refill period of the write queue in milliseconds
    pub refill_ms: u64,
    /// Batches allowed to execute at once
    pub max_concurrent: usize,
    /// Artificial latency added to each batch in milliseconds
    pub latency_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            refill_ms: 100,
            max_concurrent: 4,
            latency_ms: 0,
        }
    }
}

struct ClusterInner {
    queue: WriteQueue,
    documents: DashMap<(String, String), u64>,
    bulk_calls: AtomicUsize,
    available: AtomicBool,
    latency: Duration,
    runtime: Handle,
}

/// Cheaply cloneable handle to an in-memory cluster
#[derive(Clone)]
pub struct SimulatedCluster {
    inner: Arc<ClusterInner>,
}

impl SimulatedCluster {
    pub fn new(config: ClusterConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                queue: WriteQueue::new(
                    "write",
                    config.queue_capacity,
                    config.refill_ms,
                    config.max_concurrent,
                ),
                documents: DashMap::new(),
                bulk_calls: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                latency: Duration::from_millis(config.latency_ms),
                runtime,
            }),
        }
    }

    /// Number of bulk batches received so far, retries included
    pub fn bulk_calls(&self) -> usize {
        self.inner.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.inner.documents.len()
    }

    pub fn version(&self, index: &str, id: &str) -> Option<u64> {
        self.inner
            .documents
            .get(&(index.to_string(), id.to_string()))
            .map(|entry| *entry.value())
    }

    /// While unavailable, whole batches fail without per-operation outcomes
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Executes one bulk batch
    pub async fn bulk(&self, batch: &Batch) -> Result<BatchOutcome, BulkError> {
        let start = Instant::now();
        self.inner.bulk_calls.fetch_add(1, Ordering::SeqCst);

        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BulkError::execution(anyhow::anyhow!(
                "cluster unavailable, no master node"
            )));
        }

        let _worker = self
            .inner
            .queue
            .acquire_worker()
            .await
            .map_err(BulkError::Execution)?;

        if !self.inner.latency.is_zero() {
            sleep(self.inner.latency).await;
        }

        let mut results = Vec::with_capacity(batch.len());
        for item in batch.iter() {
            results.push(self.apply(item.request()).await);
        }

        debug!(
            "Bulk of {} operations executed in {:?}",
            batch.len(),
            start.elapsed()
        );
        Ok(BatchOutcome::from_results(batch, results, start.elapsed()))
    }

    async fn apply(&self, request: &DocWriteRequest) -> OperationOutcome {
        if let Err(invalid) = validate_request(request) {
            return OperationOutcome::Failure(OperationFailure::for_request(request, invalid));
        }

        let queue = &self.inner.queue;
        if !queue.try_take().await {
            let rejection = RejectedExecution {
                queue: queue.name().to_string(),
                capacity: queue.capacity(),
                operation: format!("{:?} on [{}]", request.op_type(), request.index_name()),
            };
            let cause = anyhow::Error::new(rejection)
                .context(format!("failed to execute bulk item on [{}]", request.index_name()));
            return OperationOutcome::Failure(OperationFailure::for_request(request, cause));
        }

        let documents = &self.inner.documents;
        match request {
            DocWriteRequest::Index { index, id, .. } => {
                let id = id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                let mut entry = documents.entry((index.clone(), id.clone())).or_insert(0);
                *entry += 1;
                let version = *entry;
                let result = if version == 1 {
                    WriteResult::Created
                } else {
                    WriteResult::Updated
                };
                OperationOutcome::Success(WriteResponse {
                    index: index.clone(),
                    id,
                    version,
                    result,
                })
            }
            DocWriteRequest::Update { index, id, .. } => {
                match documents.get_mut(&(index.clone(), id.clone())) {
                    Some(mut entry) => {
                        *entry += 1;
                        OperationOutcome::Success(WriteResponse {
                            index: index.clone(),
                            id: id.clone(),
                            version: *entry,
                            result: WriteResult::Updated,
                        })
                    }
                    None => OperationOutcome::Failure(OperationFailure::for_request(
                        request,
                        DocumentMissing {
                            index: index.clone(),
                            id: id.clone(),
                        },
                    )),
                }
            }
            DocWriteRequest::Delete { index, id } => {
                let removed = documents.remove(&(index.clone(), id.clone()));
                let (version, result) = match removed {
                    Some((_, version)) => (version + 1, WriteResult::Deleted),
                    None => (1, WriteResult::NotFound),
                };
                OperationOutcome::Success(WriteResponse {
                    index: index.clone(),
                    id: id.clone(),
                    version,
                    result,
                })
            }
        }
    }
}

impl BatchExecutor for SimulatedCluster {
    fn execute(&self, batch: Batch, listener: AttemptListener) {
        let cluster = self.clone();
        let snapshot = ContextSnapshot::capture();
        self.inner.runtime.spawn(snapshot.instrument(async move {
            listener.complete(cluster.bulk(&batch).await);
        }));
    }
}

/// Builds `operations` index requests against `index`
///
/// Every `invalid_every`-th operation (when non-zero) targets an invalid
/// index name so it fails permanently.
pub fn sample_batch(index: &str, operations: usize, invalid_every: usize) -> Batch {
    (0..operations)
        .map(|n| {
            let target = if invalid_every > 0 && (n + 1) % invalid_every == 0 {
                "Invalid-Index"
            } else {
                index
            };
            DocWriteRequest::index_with_id(
                target,
                format!("doc-{}", n),
                serde_json::json!({ "seq": n, "message": format!("event {}", n) }),
            )
        })
        .collect()
}

/// Summary of a simulated bulk load
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub sessions: usize,
    pub operations: usize,
    pub successful: usize,
    pub failed: usize,
    pub bulk_calls: usize,
    /// Duration of the slowest session
    pub took_ms: u64,
    pub failures: Vec<ItemOutcome>,
}

impl SimulationReport {
    pub fn new(outcomes: &[BatchOutcome], bulk_calls: usize) -> Self {
        let failures: Vec<ItemOutcome> = outcomes
            .iter()
            .flat_map(|outcome| outcome.items())
            .filter(|item| item.is_failed())
            .cloned()
            .collect();
        let operations: usize = outcomes.iter().map(BatchOutcome::len).sum();
        let took = outcomes
            .iter()
            .map(BatchOutcome::took)
            .max()
            .unwrap_or_default();

        let report = Self {
            sessions: outcomes.len(),
            operations,
            successful: operations - failures.len(),
            failed: failures.len(),
            bulk_calls,
            took_ms: took.as_millis() as u64,
            failures,
        };
        info!(
            "Bulk load finished: {} ok, {} failed, {} bulk calls",
            report.successful, report.failed, report.bulk_calls
        );
        report
    }
}
