use clap::Parser;
use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, debug};
use tokio::runtime::{Builder, Handle};

use bulkretry::bulk::{Batch, BatchOutcome};
use bulkretry::cli::{self, Cli, Mode};
use bulkretry::context::RequestContext;
use bulkretry::executor::BatchExecutor;
use bulkretry::retry::Retry;
use bulkretry::simulate::{sample_batch, SimulatedCluster, SimulationReport};

fn main() -> Result<()> {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    // Retry rounds are short callbacks; a few workers beyond the core count are plenty
    let worker_threads = std::cmp::min(num_cpus + 2, 16);

    debug!("Configuring Tokio runtime with {} worker threads", worker_threads);

    let runtime = Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        cli::Commands::Schedule { backoff } => {
            let delays: Vec<u128> = backoff
                .policy()
                .schedule()
                .map(|delay| delay.as_millis())
                .collect();
            println!("{}", serde_json::to_string_pretty(&delays)?);
        }
        cli::Commands::Simulate {
            operations,
            index,
            sessions,
            invalid_every,
            mode,
            output_file,
            backoff,
        } => {
            let cluster = SimulatedCluster::new(cli.cluster_config(), Handle::current());
            let executor: Arc<dyn BatchExecutor> = Arc::new(cluster.clone());
            let retry = Retry::on_rejection().policy(backoff.policy());
            let sessions = (*sessions).max(1);
            let batches: Vec<Batch> = (0..sessions)
                .map(|n| {
                    let target = if sessions == 1 {
                        index.clone()
                    } else {
                        format!("{}-{}", index, n)
                    };
                    sample_batch(&target, *operations, *invalid_every)
                })
                .collect();

            info!(
                "Submitting {} bulk session(s) of {} operations ({:?} mode)",
                sessions, operations, mode
            );

            let context = RequestContext::new().with_header("x-opaque-id", "bulkretry-simulate");
            let outcomes: Vec<BatchOutcome> = match mode {
                Mode::Async => {
                    let submissions = batches.into_iter().map(|batch| {
                        context
                            .clone()
                            .scope(retry.with_backoff(Arc::clone(&executor), batch))
                    });
                    try_join_all(submissions).await?
                }
                Mode::Sync => {
                    let submissions = batches.into_iter().map(|batch| {
                        let (retry, executor, context) =
                            (retry.clone(), Arc::clone(&executor), context.clone());
                        tokio::task::spawn_blocking(move || {
                            context.sync_scope(|| retry.with_sync_backoff(executor, batch))
                        })
                    });
                    let mut outcomes = Vec::with_capacity(sessions);
                    for joined in join_all(submissions).await {
                        outcomes.push(joined.context("Blocking bulk submission panicked")??);
                    }
                    outcomes
                }
            };

            let report = SimulationReport::new(&outcomes, cluster.bulk_calls());

            if let Some(path) = output_file {
                let mut writer = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(path)
                    .await
                    .context("Failed to create output file")?;
                for item in outcomes.iter().flat_map(|outcome| outcome.items()) {
                    let json_line = format!("{}\n", serde_json::to_string(item)?);
                    writer.write_all(json_line.as_bytes()).await?;
                }
                writer.flush().await?;
            }

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
