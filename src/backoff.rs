//! Backoff schedules for bulk retries
//!
//! A [`BackoffPolicy`] describes how long to wait before each retry round and
//! how many rounds are allowed. Every retry session pulls its own
//! [`BackoffSchedule`] from the policy and consumes it strictly forward:
//!
//! - [`BackoffSchedule::has_next`] is checked before a retry is promised
//! - [`BackoffSchedule::next_delay`] consumes exactly one delay per round
//! - exhaustion is the normal end of retrying, not an error
//!
//! The available policies are:
//!
//! - no backoff (retries disabled)
//! - constant delay for a fixed number of retries
//! - exponential growth for a fixed number of retries
//! - multiplicative backoff with a cap and optional jitter ([`RetryConfig`])
//! - any custom iterator of delays

use std::fmt;
use std::iter::Peekable;
use std::sync::Arc;
use std::time::Duration;

/// Lazy, possibly infinite sequence of wait durations
pub type Backoff = Box<dyn Iterator<Item = Duration> + Send>;

type BackoffFactory = Arc<dyn Fn() -> Backoff + Send + Sync>;
type BackoffCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Configuration for the multiplicative backoff strategy
///
/// Controls:
/// - How many retry rounds are allowed
/// - How long to wait before the first retry
/// - How the wait time grows with each round
/// - Whether randomization is applied to spread out retry storms
///
/// # Examples
///
/// ```
/// use bulkretry::backoff::RetryConfig;
///
/// // Default configuration
/// let default_config = RetryConfig::default();
///
/// // Custom configuration
/// let custom_config = RetryConfig {
///     max_retries: 5,
///     initial_backoff_ms: 50,
///     backoff_factor: 3.0,
///     max_backoff_ms: 5000,
///     add_jitter: true,
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry rounds
    pub max_retries: u32,

    /// Wait before the first retry in milliseconds
    pub initial_backoff_ms: u64,

    /// Multiplier for each subsequent retry
    pub backoff_factor: f64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Whether to add jitter to backoff times
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
            max_backoff_ms: 10000, // 10 seconds
            add_jitter: true,
        }
    }
}

/// Iterator behind [`BackoffPolicy::from_config`]
struct ConfiguredBackoff {
    config: RetryConfig,
    attempt: u32,
    backoff_ms: u64,
}

impl Iterator for ConfiguredBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        self.attempt += 1;

        let jittered_ms = if self.config.add_jitter {
            let jitter_factor = rand::random::<f64>() * 0.2 + 0.9; // 0.9-1.1 range
            (self.backoff_ms as f64 * jitter_factor) as u64
        } else {
            self.backoff_ms
        };
        let delay = std::cmp::min(jittered_ms, self.config.max_backoff_ms);

        self.backoff_ms = (self.backoff_ms as f64 * self.config.backoff_factor) as u64;
        if self.backoff_ms > self.config.max_backoff_ms {
            self.backoff_ms = self.config.max_backoff_ms;
        }

        Some(Duration::from_millis(delay))
    }
}

/// Delay before retry `round` (0-based) of the exponential policy
fn exponential_delay(initial: Duration, round: usize) -> Duration {
    let growth = (0.8 * round as f64).exp().floor() as u64;
    initial + Duration::from_millis(10 * growth.saturating_sub(1))
}

/// Recipe for the backoff schedule of a retry session
#[derive(Clone)]
pub enum BackoffPolicy {
    /// Never wait, never retry
    NoBackoff,
    /// The same delay before each of `max_retries` rounds
    Constant { delay: Duration, max_retries: usize },
    /// Delays growing as `initial + 10ms * (floor(e^(0.8 * round)) - 1)`
    Exponential { initial: Duration, max_retries: usize },
    /// Multiplicative growth with cap and optional jitter
    Configured(RetryConfig),
    /// Caller-supplied schedule
    Custom(BackoffFactory),
    /// Another policy with a callback run whenever a delay is consumed
    Wrapped {
        inner: Box<BackoffPolicy>,
        on_backoff: BackoffCallback,
    },
}

impl BackoffPolicy {
    pub fn no_backoff() -> Self {
        Self::NoBackoff
    }

    pub fn constant(delay: Duration, max_retries: usize) -> Self {
        Self::Constant { delay, max_retries }
    }

    pub fn exponential(initial: Duration, max_retries: usize) -> Self {
        Self::Exponential {
            initial,
            max_retries,
        }
    }

    /// Exponential backoff starting at 50ms with 8 retries
    pub fn exponential_default() -> Self {
        Self::exponential(Duration::from_millis(50), 8)
    }

    pub fn from_config(config: RetryConfig) -> Self {
        Self::Configured(config)
    }

    /// Custom schedule; `factory` is called once per retry session
    pub fn from_fn<F>(factory: F) -> Self
    where
        F: Fn() -> Backoff + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(factory))
    }

    /// Wraps this policy so `on_backoff` observes every consumed delay
    pub fn wrap<F>(self, on_backoff: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        Self::Wrapped {
            inner: Box::new(self),
            on_backoff: Arc::new(on_backoff),
        }
    }

    /// Raw delays of a fresh schedule, without callbacks
    pub fn delays(&self) -> Backoff {
        match self {
            Self::NoBackoff => Box::new(std::iter::empty()),
            Self::Constant { delay, max_retries } => {
                Box::new(std::iter::repeat(*delay).take(*max_retries))
            }
            Self::Exponential {
                initial,
                max_retries,
            } => {
                let initial = *initial;
                Box::new((0..*max_retries).map(move |round| exponential_delay(initial, round)))
            }
            Self::Configured(config) => Box::new(ConfiguredBackoff {
                config: config.clone(),
                attempt: 0,
                backoff_ms: config.initial_backoff_ms,
            }),
            Self::Custom(factory) => factory(),
            Self::Wrapped { inner, .. } => inner.delays(),
        }
    }

    /// A fresh schedule for one retry session
    pub fn schedule(&self) -> BackoffSchedule {
        let mut callbacks = Vec::new();
        let mut policy = self;
        while let Self::Wrapped { inner, on_backoff } = policy {
            callbacks.push(Arc::clone(on_backoff));
            policy = inner.as_ref();
        }
        // innermost wrapper observes first
        callbacks.reverse();

        BackoffSchedule {
            delays: policy.delays().peekable(),
            callbacks: callbacks.into(),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential_default()
    }
}

impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBackoff => f.write_str("NoBackoff"),
            Self::Constant { delay, max_retries } => f
                .debug_struct("Constant")
                .field("delay", delay)
                .field("max_retries", max_retries)
                .finish(),
            Self::Exponential {
                initial,
                max_retries,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max_retries", max_retries)
                .finish(),
            Self::Configured(config) => f.debug_tuple("Configured").field(config).finish(),
            Self::Custom(_) => f.write_str("Custom"),
            Self::Wrapped { inner, .. } => f.debug_struct("Wrapped").field("inner", inner).finish(),
        }
    }
}

/// Forward-only cursor over the delays of one retry session
pub struct BackoffSchedule {
    delays: Peekable<Backoff>,
    callbacks: Arc<[BackoffCallback]>,
}

impl BackoffSchedule {
    /// Whether another retry round is allowed
    pub fn has_next(&mut self) -> bool {
        self.delays.peek().is_some()
    }

    /// Consumes the delay for the next retry round
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.advance()?;
        self.observer().notify(delay);
        Some(delay)
    }

    /// Consumes the next delay without running the `wrap` callbacks
    ///
    /// The caller reports the delay through [`BackoffSchedule::observer`]
    /// once it no longer holds any lock guarding the schedule.
    pub(crate) fn advance(&mut self) -> Option<Duration> {
        self.delays.next()
    }

    pub(crate) fn observer(&self) -> BackoffObserver {
        BackoffObserver {
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

/// The `wrap` callbacks of a schedule, detached from it
pub(crate) struct BackoffObserver {
    callbacks: Arc<[BackoffCallback]>,
}

impl BackoffObserver {
    pub(crate) fn notify(&self, delay: Duration) {
        for callback in self.callbacks.iter() {
            callback(delay);
        }
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.next_delay()
    }
}

impl fmt::Debug for BackoffSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffSchedule")
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}
