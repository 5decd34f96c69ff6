use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use anyhow::{Result, Context};
use tracing::debug;

/// A token bucket modelling a shard's bounded write queue
///
/// Every operation takes one token. When the bucket is empty the operation is
/// rejected outright instead of waiting, which is what makes a bulk batch
/// come back partially failed. Tokens are refilled once per period.
#[derive(Debug)]
pub struct WriteQueue {
    /// Name reported in rejections
    name: String,
    /// Maximum number of operations accepted per period
    capacity: usize,
    /// Current token count
    tokens: Mutex<usize>,
    /// Time period for token replenishment in milliseconds
    refill_time_ms: u64,
    /// Last time tokens were refilled
    last_refill: Mutex<Instant>,
    /// Semaphore limiting how many bulk batches run at once
    workers: Arc<Semaphore>,
}

impl WriteQueue {
    /// Creates a new write queue
    ///
    /// # Arguments
    ///
    /// * `name` - Name reported when operations are rejected
    /// * `capacity` - Operations accepted per refill period
    /// * `period_ms` - Refill period in milliseconds
    /// * `max_concurrent` - Maximum number of batches executing at once
    pub fn new(name: impl Into<String>, capacity: usize, period_ms: u64, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            tokens: Mutex::new(capacity),
            refill_time_ms: period_ms.max(1),
            last_refill: Mutex::new(Instant::now()),
            workers: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free write worker
    ///
    /// Returns a guard that releases the worker when dropped.
    pub async fn acquire_worker(&self) -> Result<WorkerGuard> {
        let permit = self.workers.clone()
            .acquire_owned()
            .await
            .context("Write queue is closed")?;

        Ok(WorkerGuard { _permit: permit })
    }

    /// Takes a token for one operation; false if the queue is full
    pub async fn try_take(&self) -> bool {
        let mut tokens = self.tokens.lock().await;
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();

        // Calculate how many tokens to add based on elapsed time
        let elapsed = now.duration_since(*last_refill).as_millis() as u64;

        if elapsed >= self.refill_time_ms {
            let periods = elapsed / self.refill_time_ms;
            let new_tokens = periods as usize * self.capacity;

            *tokens = (*tokens + new_tokens).min(self.capacity);
            *last_refill = now - Duration::from_millis(elapsed % self.refill_time_ms);
        }

        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            debug!("Write queue [{}] full, rejecting operation", self.name);
            false
        }
    }

    /// Tokens left in the current period, without refilling
    pub async fn available(&self) -> usize {
        *self.tokens.lock().await
    }

    /// Stops handing out workers; waiting and future batches fail
    pub fn close(&self) {
        self.workers.close();
    }
}

/// A guard that releases the write worker when dropped
#[derive(Debug)]
pub struct WorkerGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
