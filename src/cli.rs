//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand: worker pool startup with signal
//! handling, payload posting and config checking.

use anyhow::{Context, Result};
use fleetfeed::config::{self, Config};
use fleetfeed::http;
use fleetfeed::jobs::{self, Deps};
use fleetfeed::kv::{KvStore, RedisKv};
use fleetfeed::metrics::Metrics;
use fleetfeed::notify::{ChangeNotifier, LogNotifier, RedisNotifier};
use fleetfeed::queue::{self, QueueKeys};
use fleetfeed::store::postgres::PgStore;
use fleetfeed::worker::WorkerPool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::Cli;

fn database_url(cli: &Cli) -> Result<&str> {
    cli.database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)"))
}

// ── Worker ──────────────────────────────────────────────────────

/// Connect both stores and run the pool until SIGINT/SIGTERM.
pub async fn run_worker(
    cli: &Cli,
    config: Config,
    metrics_port: Option<u16>,
    max_connections: u32,
) -> Result<()> {
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&cli.redis_url).await?);
    let store = PgStore::connect(database_url(cli)?, max_connections).await?;
    let notifier: Arc<dyn ChangeNotifier> = if config.notify.enabled {
        Arc::new(RedisNotifier::new(kv.clone(), config.notify.channel.clone()))
    } else {
        Arc::new(LogNotifier)
    };
    info!(
        runners = config.worker.runners,
        with_tx = config.worker.with_tx,
        queues = config.worker.queues.len(),
        "worker starting"
    );
    let deps = Deps::new(kv, Arc::new(store), notifier, Arc::new(Metrics::new()), config);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("stop requested, finishing jobs in flight");
        let _ = tx.send(true);
    });

    let listener = metrics_port.map(|port| {
        let deps = deps.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(port, deps, rx).await {
                warn!(error = %e, "metrics listener failed");
            }
        })
    });

    WorkerPool::new(deps).run(rx).await?;
    if let Some(handle) = listener {
        let _ = handle.await;
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

// ── Post ────────────────────────────────────────────────────────

/// Store `file` as the payload of `work_key` and queue it.
pub async fn run_post(
    cli: &Cli,
    kind: &str,
    work_key: &str,
    file: &Path,
    changes: &[String],
) -> Result<()> {
    if !jobs::KINDS.contains(&kind) {
        anyhow::bail!("unknown kind '{}'. Valid: {}", kind, jobs::KINDS.join(", "));
    }
    let payload =
        std::fs::read(file).with_context(|| format!("reading payload {}", file.display()))?;
    serde_json::from_slice::<serde_json::Value>(&payload)
        .with_context(|| format!("{} is not valid json", file.display()))?;
    let kv = RedisKv::connect(&cli.redis_url).await?;
    let keys = QueueKeys::for_kind(kind);
    let queued = queue::post(&kv, &keys, work_key, &payload, changes).await?;
    let depth = kv.llen(&keys.queue).await?;
    if queued {
        println!("queued {} on {} (depth {})", work_key, keys.queue, depth);
    } else {
        println!("{} already pending on {}, payload replaced", work_key, keys.queue);
    }
    Ok(())
}

// ── Config ──────────────────────────────────────────────────────

pub fn run_check_config(config: &Config) -> Result<()> {
    config::validate_config(config)?;
    print!("{}", config::to_toml(config)?);
    Ok(())
}
