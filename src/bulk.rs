//! Bulk request and response model
//!
//! A [`Batch`] is an ordered list of write operations. Every operation keeps
//! the slot it had in the batch the caller originally submitted, so outcomes
//! gathered across several retry rounds can be lined up with the original
//! request again.
//!
//! A [`BatchOutcome`] is the positional answer to one batch: item `i` belongs
//! to operation `i` of the batch that produced it.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

/// Kind of write carried by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Index,
    Update,
    Delete,
}

/// A single write request inside a bulk batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DocWriteRequest {
    /// Create or replace a document; a missing id is generated on write
    Index {
        index: String,
        #[serde(default)]
        id: Option<String>,
        source: serde_json::Value,
    },
    /// Partially update an existing document
    Update {
        index: String,
        id: String,
        doc: serde_json::Value,
    },
    /// Remove a document
    Delete { index: String, id: String },
}

impl DocWriteRequest {
    pub fn index(index: impl Into<String>, source: serde_json::Value) -> Self {
        Self::Index {
            index: index.into(),
            id: None,
            source,
        }
    }

    pub fn index_with_id(
        index: impl Into<String>,
        id: impl Into<String>,
        source: serde_json::Value,
    ) -> Self {
        Self::Index {
            index: index.into(),
            id: Some(id.into()),
            source,
        }
    }

    pub fn update(index: impl Into<String>, id: impl Into<String>, doc: serde_json::Value) -> Self {
        Self::Update {
            index: index.into(),
            id: id.into(),
            doc,
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            index: index.into(),
            id: id.into(),
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            Self::Index { .. } => OpType::Index,
            Self::Update { .. } => OpType::Update,
            Self::Delete { .. } => OpType::Delete,
        }
    }

    pub fn index_name(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Update { index, .. } | Self::Delete { index, .. } => {
                index
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Index { id, .. } => id.as_deref(),
            Self::Update { id, .. } | Self::Delete { id, .. } => Some(id),
        }
    }
}

/// An operation together with its slot in the originally submitted batch
#[derive(Debug, Clone)]
pub struct BulkItemRequest {
    slot: usize,
    request: Arc<DocWriteRequest>,
}

impl BulkItemRequest {
    /// Position of this operation in the batch the caller first submitted
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn request(&self) -> &DocWriteRequest {
        &self.request
    }
}

/// Ordered sequence of write operations
///
/// Cloning a batch is cheap; operations are shared, not copied.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    items: Vec<BulkItemRequest>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation; its slot is its position in this batch
    pub fn add(&mut self, request: DocWriteRequest) -> &mut Self {
        let slot = self.items.len();
        self.items.push(BulkItemRequest {
            slot,
            request: Arc::new(request),
        });
        self
    }

    /// Builds a batch from already-slotted items, keeping their original slots
    pub(crate) fn from_items(items: Vec<BulkItemRequest>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[BulkItemRequest] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &BulkItemRequest> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Original slots of the operations, in batch order
    pub fn slots(&self) -> Vec<usize> {
        self.items.iter().map(BulkItemRequest::slot).collect()
    }
}

impl FromIterator<DocWriteRequest> for Batch {
    fn from_iter<I: IntoIterator<Item = DocWriteRequest>>(iter: I) -> Self {
        let mut batch = Batch::new();
        for request in iter {
            batch.add(request);
        }
        batch
    }
}

/// What a successful write did to the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteResult {
    Created,
    Updated,
    Deleted,
    NotFound,
    Noop,
}

/// Payload of a successful operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub index: String,
    pub id: String,
    pub version: u64,
    pub result: WriteResult,
}

/// Payload of a failed operation
///
/// The cause is shared so outcomes stay cheap to clone while the full error
/// chain remains available for classification.
#[derive(Debug, Clone)]
pub struct OperationFailure {
    pub index: String,
    pub id: Option<String>,
    cause: Arc<anyhow::Error>,
}

impl OperationFailure {
    pub fn new(
        index: impl Into<String>,
        id: Option<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            index: index.into(),
            id,
            cause: Arc::new(cause.into()),
        }
    }

    /// Failure for `request`, copying its index and id
    pub fn for_request(request: &DocWriteRequest, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            request.index_name(),
            request.id().map(str::to_string),
            cause,
        )
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Innermost error of the cause chain
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        self.cause.root_cause()
    }
}

impl Serialize for OperationFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("OperationFailure", 4)?;
        state.serialize_field("index", &self.index)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("reason", &format!("{:#}", self.cause))?;
        state.serialize_field("root_cause", &self.root_cause().to_string())?;
        state.end()
    }
}

/// Result of one operation in one attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OperationOutcome {
    Success(WriteResponse),
    Failure(OperationFailure),
}

impl OperationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn failure(&self) -> Option<&OperationFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            Self::Success(_) => None,
        }
    }

    pub fn response(&self) -> Option<&WriteResponse> {
        match self {
            Self::Success(response) => Some(response),
            Self::Failure(_) => None,
        }
    }
}

/// An outcome tagged with the original slot of its operation
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub slot: usize,
    pub op_type: OpType,
    pub outcome: OperationOutcome,
}

impl ItemOutcome {
    pub fn is_failed(&self) -> bool {
        self.outcome.is_failed()
    }
}

/// Outcomes of one batch execution, or the merged outcome of a whole session
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    items: Vec<ItemOutcome>,
    #[serde(rename = "took_ms", serialize_with = "serialize_millis")]
    took: Duration,
}

fn serialize_millis<S: Serializer>(took: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(took.as_millis() as u64)
}

impl BatchOutcome {
    pub fn new(items: Vec<ItemOutcome>, took: Duration) -> Self {
        Self { items, took }
    }

    /// Pairs positional results with the operations of `batch`
    ///
    /// Extra results, or missing ones, are dropped by the pairing; callers
    /// that care should compare lengths first.
    pub fn from_results(batch: &Batch, results: Vec<OperationOutcome>, took: Duration) -> Self {
        let items = batch
            .iter()
            .zip(results)
            .map(|(item, outcome)| ItemOutcome {
                slot: item.slot(),
                op_type: item.request().op_type(),
                outcome,
            })
            .collect();
        Self { items, took }
    }

    pub fn items(&self) -> &[ItemOutcome] {
        &self.items
    }

    pub fn into_items(self) -> Vec<ItemOutcome> {
        self.items
    }

    pub fn took(&self) -> Duration {
        self.took
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(ItemOutcome::is_failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationFailure> {
        self.items.iter().filter_map(|item| item.outcome.failure())
    }

    pub fn successes(&self) -> impl Iterator<Item = &WriteResponse> {
        self.items.iter().filter_map(|item| item.outcome.response())
    }
}
