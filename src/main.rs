//! # Main — CLI Entry Point
//!
//! Routes subcommands to the execution functions in `cli.rs` and handles the
//! shared concerns: `.env` loading, logging, config file loading.
//!
//! ## Subcommands
//!
//! - `worker`: run the worker pool, optionally with the health/metrics listener.
//! - `post`: store a payload file and queue its work key, the way the HTTP
//!   ingress does. Handy for local testing.
//! - `check-config`: load and validate the config file, print the result.
//!
//! ## Global Options
//!
//! - `--config`: TOML config file (defaults apply when omitted).
//! - `--redis-url` / `REDIS_URL`: queue store.
//! - `--database-url` / `DATABASE_URL`: PostgreSQL collector database.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "fleetfeed",
    about = "Ingest fleet status snapshots into the collector database"
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "FLEETFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Redis connection URL (or set REDIS_URL env var)
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted
    Worker {
        /// Number of runners (overrides worker.runners)
        #[arg(long)]
        runners: Option<usize>,
        /// Serve /healthz, /readyz and /metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
        /// Autocommit every statement instead of one transaction per job
        #[arg(long)]
        no_tx: bool,
        /// Maximum database connections
        #[arg(long, default_value_t = 10)]
        max_connections: u32,
    },
    /// Queue a payload file for a work kind
    Post {
        /// Work kind (daemonStatus, system)
        #[arg(long)]
        kind: String,
        /// Work key, usually the posting node id
        #[arg(long)]
        work_key: String,
        /// JSON payload file
        #[arg(long)]
        file: PathBuf,
        /// Change tokens (`<object>@<nodename>`), comma separated
        #[arg(long, value_delimiter = ',')]
        changes: Vec<String>,
    },
    /// Validate the config file and print the effective configuration
    CheckConfig,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for K8s, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let mut config = fleetfeed::config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::CheckConfig => cli::run_check_config(&config),
        Commands::Post {
            kind,
            work_key,
            file,
            changes,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_post(&cli, kind, work_key, file, changes))
        }
        Commands::Worker {
            runners,
            metrics_port,
            no_tx,
            max_connections,
        } => {
            if let Some(n) = runners {
                config.worker.runners = *n;
            }
            if *no_tx {
                config.worker.with_tx = false;
            }
            fleetfeed::config::validate_config(&config)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_worker(&cli, config, *metrics_port, *max_connections))
        }
    }
}
