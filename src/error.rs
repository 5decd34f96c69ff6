//! Error types and retry classification for bulk sessions
//!
//! Two kinds of failure flow through a bulk retry session:
//!
//! - Per-operation failures are data. They travel inside a [`BatchOutcome`]
//!   and never abort the session. Their cause is an [`anyhow::Error`] whose
//!   root cause decides whether the operation may be retried.
//! - Hard failures ([`BulkError`]) end the session immediately and are
//!   delivered to the caller instead of an outcome.
//!
//! [`BatchOutcome`]: crate::bulk::BatchOutcome

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// A failure that prevents a batch from producing per-operation outcomes
#[derive(Debug, Error)]
pub enum BulkError {
    /// The executor could not run the batch at all
    #[error("bulk execution failed: {0}")]
    Execution(#[source] anyhow::Error),

    /// A delayed retry could not be handed to the scheduler
    #[error("failed to schedule bulk retry: {0}")]
    Scheduling(String),

    /// The executor answered with a different number of outcomes than operations sent
    #[error("executor returned {actual} outcomes for a batch of {expected} operations")]
    OutcomeMismatch { expected: usize, actual: usize },

    /// The executor dropped its attempt listener without reporting anything
    #[error("executor dropped the attempt listener without reporting an outcome")]
    ListenerDropped,

    /// The session was dropped before finishing, such as when the runtime
    /// holding its pending retry shut down
    #[error("retry session ended without delivering a result")]
    SessionAbandoned,
}

impl BulkError {
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        Self::Execution(err.into())
    }

    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling(msg.into())
    }
}

/// Transient rejection raised when a shard's write queue is full
///
/// This is the canonical retryable cause: the operation was never applied
/// and can safely be sent again once the queue drains.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rejected execution of {operation} on [{queue}]: queue capacity {capacity}")]
pub struct RejectedExecution {
    /// Name of the queue that rejected the work
    pub queue: String,
    /// Configured capacity of that queue
    pub capacity: usize,
    /// Short description of the rejected operation
    pub operation: String,
}

/// Classifies operation failures as retryable by the exact type of their root cause
///
/// Matching is on the concrete type only. An error type that merely wraps
/// the retryable one without exposing it through `source()` does not match.
#[derive(Clone, Copy)]
pub struct RetryOn {
    type_name: &'static str,
    matches: fn(&(dyn StdError + 'static)) -> bool,
}

fn is_exactly<E: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    err.is::<E>()
}

impl RetryOn {
    /// Retry on root causes of exactly type `E`
    pub fn of<E: StdError + 'static>() -> Self {
        Self {
            type_name: std::any::type_name::<E>(),
            matches: is_exactly::<E>,
        }
    }

    /// Whether `root_cause` is exactly the configured type
    pub fn matches(&self, root_cause: &(dyn StdError + 'static)) -> bool {
        (self.matches)(root_cause)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryOn").field(&self.type_name).finish()
    }
}
