use anyhow::Result;
use bulkretry::cli::{Cli, Commands, Mode, PolicyKind};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_cli_simulate_defaults() -> Result<()> {
    let cli = Cli::try_parse_from(["bulkretry", "simulate"])?;

    match &cli.command {
        Commands::Simulate {
            operations,
            index,
            sessions,
            invalid_every,
            mode,
            output_file,
            backoff,
        } => {
            assert_eq!(*operations, 100);
            assert_eq!(index, "events");
            assert_eq!(*sessions, 1);
            assert_eq!(*invalid_every, 0);
            assert_eq!(*mode, Mode::Async);
            assert!(output_file.is_none());
            assert_eq!(backoff.policy, PolicyKind::Exponential);
            assert_eq!(backoff.max_retries, 8);
            assert_eq!(backoff.initial_backoff_ms, 50);
        }
        _ => panic!("Expected Simulate command"),
    }

    // Test default values
    assert_eq!(cli.queue_capacity, 50);
    assert_eq!(cli.refill_ms, 100);
    assert_eq!(cli.max_concurrent, 4);
    assert_eq!(cli.latency_ms, 0);

    Ok(())
}

#[test]
fn test_cli_simulate_options() -> Result<()> {
    let args = vec![
        "bulkretry",
        "--queue-capacity",
        "10",
        "--refill-ms",
        "20",
        "simulate",
        "--operations",
        "500",
        "--invalid-every",
        "7",
        "--sessions",
        "3",
        "--mode",
        "sync",
        "--output-file",
        "out.jsonl",
        "--policy",
        "constant",
        "--max-retries",
        "2",
        "--initial-backoff-ms",
        "15",
    ];
    let cli = Cli::try_parse_from(args)?;

    let config = cli.cluster_config();
    assert_eq!(config.queue_capacity, 10);
    assert_eq!(config.refill_ms, 20);

    match &cli.command {
        Commands::Simulate {
            operations,
            sessions,
            invalid_every,
            mode,
            output_file,
            backoff,
            ..
        } => {
            assert_eq!(*operations, 500);
            assert_eq!(*sessions, 3);
            assert_eq!(*invalid_every, 7);
            assert_eq!(*mode, Mode::Sync);
            assert_eq!(output_file.as_ref(), Some(&PathBuf::from("out.jsonl")));

            let delays: Vec<Duration> = backoff.policy().schedule().collect();
            assert_eq!(delays, vec![Duration::from_millis(15); 2]);
        }
        _ => panic!("Expected Simulate command"),
    }

    Ok(())
}

#[test]
fn test_cli_schedule_configured() -> Result<()> {
    let cli = Cli::try_parse_from([
        "bulkretry",
        "schedule",
        "--policy",
        "configured",
        "--max-retries",
        "3",
        "--initial-backoff-ms",
        "100",
        "--max-backoff-ms",
        "150",
    ])?;

    match &cli.command {
        Commands::Schedule { backoff } => {
            assert!(!backoff.jitter);
            let delays: Vec<u128> = backoff.policy().schedule().map(|d| d.as_millis()).collect();
            assert_eq!(delays, vec![100, 150, 150]);
        }
        _ => panic!("Expected Schedule command"),
    }

    Ok(())
}

#[test]
fn test_cli_rejects_unknown_policy() {
    let result = Cli::try_parse_from(["bulkretry", "schedule", "--policy", "fibonacci"]);
    assert!(result.is_err());
}

#[test]
fn test_cli_requires_subcommand() {
    assert!(Cli::try_parse_from(["bulkretry"]).is_err());
}
