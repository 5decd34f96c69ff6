//! Delayed execution of retry rounds
//!
//! A [`Scheduler`] runs a task after a delay and hands back a
//! [`ScheduledHandle`] that can cancel it. Cancelling is idempotent: a handle
//! that already fired, or was already cancelled, ignores further cancels, and
//! a cancelled task never runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::trace;

use crate::error::BulkError;

/// Work handed to a scheduler
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay on an unspecified worker
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` no earlier than `delay` from now
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> Result<ScheduledHandle, BulkError>;
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Default)]
struct HandleState {
    status: AtomicU8,
    abort: OnceLock<AbortHandle>,
}

/// Cancellable handle to a scheduled task
///
/// The scheduler and the task share the handle: the task calls
/// [`ScheduledHandle::try_fire`] before doing any work, and only one of
/// firing or cancelling can ever win.
#[derive(Debug, Clone, Default)]
pub struct ScheduledHandle {
    state: Arc<HandleState>,
}

impl ScheduledHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the runtime task to abort on cancellation
    pub fn attach(&self, abort: AbortHandle) {
        let _ = self.state.abort.set(abort);
    }

    /// Marks the task as running; false if it was cancelled first
    pub fn try_fire(&self) -> bool {
        self.state
            .status
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancels the task if it has not fired yet
    ///
    /// Returns true only for the call that actually cancelled it.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(abort) = self.state.abort.get() {
                abort.abort();
            }
        }
        cancelled
    }

    pub fn is_fired(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == CANCELLED
    }
}

/// Scheduler backed by a tokio runtime
#[derive(Debug)]
pub struct TokioScheduler {
    runtime: Handle,
    closed: AtomicBool,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    /// Scheduler on the runtime of the calling thread
    pub fn current() -> Result<Self, BulkError> {
        let runtime = Handle::try_current().map_err(|e| BulkError::scheduling(e.to_string()))?;
        Ok(Self::new(runtime))
    }

    /// Rejects all further scheduling; already scheduled tasks still fire
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> Result<ScheduledHandle, BulkError> {
        if self.is_shutdown() {
            return Err(BulkError::scheduling("scheduler is shut down"));
        }

        let handle = ScheduledHandle::new();
        let fire = handle.clone();
        let join = self.runtime.spawn(async move {
            sleep(delay).await;
            if fire.try_fire() {
                task();
            } else {
                trace!("Scheduled task cancelled before firing");
            }
        });
        handle.attach(join.abort_handle());

        Ok(handle)
    }
}
