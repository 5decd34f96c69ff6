//! Command-line interface for the bulkretry load simulator
//!
//! This module provides the command-line surface for pushing bulk batches
//! through the retry coordinator against an in-memory cluster, featuring:
//!
//! - A `simulate` subcommand running one bulk load end to end
//! - A `schedule` subcommand printing the delays a backoff policy produces
//! - Global tuning of the simulated cluster's write queue
//!
//! Both subcommands share the same backoff options, so a schedule can be
//! inspected before it is used for a simulated load.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::{BackoffPolicy, RetryConfig};
use crate::simulate::ClusterConfig;

/// Main command-line interface structure for bulkretry
///
/// Global options describe the simulated cluster and apply to every
/// subcommand.
///
/// # Examples
///
/// ```no_run
/// use bulkretry::cli::Cli;
/// use clap::Parser;
///
/// let cli = Cli::parse_from(["bulkretry", "schedule", "--policy", "constant"]);
/// println!("Queue capacity {}", cli.queue_capacity);
/// ```
#[derive(Parser)]
#[command(
    name = "bulkretry",
    about = "Bulk write load simulator with backoff retries of rejected operations",
    version
)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Operations the simulated write queue accepts per refill period
    #[arg(short = 'q', long, default_value = "50")]
    pub queue_capacity: usize,

    /// Refill period of the write queue in milliseconds
    #[arg(long, default_value = "100")]
    pub refill_ms: u64,

    /// Bulk batches the cluster executes concurrently
    #[arg(short = 'c', long, default_value = "4")]
    pub max_concurrent: usize,

    /// Artificial latency per bulk batch in milliseconds
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,
}

impl Cli {
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            queue_capacity: self.queue_capacity,
            refill_ms: self.refill_ms,
            max_concurrent: self.max_concurrent,
            latency_ms: self.latency_ms,
        }
    }
}

/// Available subcommands
///
/// Simulated load:
/// ```text
/// bulkretry simulate --operations 200 --policy exponential --max-retries 8
/// ```
///
/// Backoff preview:
/// ```text
/// bulkretry schedule --policy configured --initial-backoff-ms 100
/// ```
#[derive(Subcommand)]
pub enum Commands {
    /// Submit bulk batches to the simulated cluster, retrying rejections
    ///
    /// Prints a JSON report with the number of successful and failed
    /// operations, the number of bulk calls made, and the failures.
    Simulate {
        /// Number of index operations in the batch
        #[arg(short = 'n', long, default_value = "100")]
        operations: usize,

        /// Index the operations write to
        #[arg(long, default_value = "events")]
        index: String,

        /// Independent bulk sessions submitted concurrently
        ///
        /// Session `n` writes to `<index>-<n>` when more than one is run.
        #[arg(short, long, default_value = "1")]
        sessions: usize,

        /// Make every Nth operation target an invalid index (0 disables)
        #[arg(long, default_value = "0")]
        invalid_every: usize,

        /// Wait for the result by blocking a thread instead of awaiting it
        #[arg(long, value_enum, default_value_t = Mode::Async)]
        mode: Mode,

        /// Output file for per-operation outcomes (JSON, one item per line)
        #[arg(short, long)]
        output_file: Option<PathBuf>,

        #[command(flatten)]
        backoff: BackoffArgs,
    },
    /// Print the delays produced by a backoff policy
    Schedule {
        #[command(flatten)]
        backoff: BackoffArgs,
    },
}

/// How the caller waits for the merged outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Async,
    Sync,
}

/// Backoff policy family
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyKind {
    None,
    Constant,
    Exponential,
    Configured,
}

/// Backoff options shared by all subcommands
#[derive(Debug, Clone, Args)]
pub struct BackoffArgs {
    /// Backoff policy used between retry rounds
    #[arg(short, long, value_enum, default_value_t = PolicyKind::Exponential)]
    pub policy: PolicyKind,

    /// Maximum number of retry rounds
    #[arg(short = 'r', long, default_value = "8")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[arg(short = 'i', long, default_value = "50")]
    pub initial_backoff_ms: u64,

    /// Growth factor of the configured policy
    #[arg(long, default_value = "2.0")]
    pub backoff_factor: f64,

    /// Upper bound of the configured policy in milliseconds
    #[arg(long, default_value = "10000")]
    pub max_backoff_ms: u64,

    /// Randomize configured delays by +/-10%
    #[arg(long)]
    pub jitter: bool,
}

impl BackoffArgs {
    pub fn policy(&self) -> BackoffPolicy {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let max_retries = self.max_retries as usize;
        match self.policy {
            PolicyKind::None => BackoffPolicy::no_backoff(),
            PolicyKind::Constant => BackoffPolicy::constant(initial, max_retries),
            PolicyKind::Exponential => BackoffPolicy::exponential(initial, max_retries),
            PolicyKind::Configured => BackoffPolicy::from_config(RetryConfig {
                max_retries: self.max_retries,
                initial_backoff_ms: self.initial_backoff_ms,
                backoff_factor: self.backoff_factor,
                max_backoff_ms: self.max_backoff_ms,
                add_jitter: self.jitter,
            }),
        }
    }
}
