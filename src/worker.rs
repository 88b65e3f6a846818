//! # Worker Pool — Blocking-Pop Runners
//!
//! A fixed number of runners, each an independent tokio task holding its own
//! KV connection, loop on a blocking pop across every configured queue:
//!
//! ```text
//! runner ──BLPOP daemonStatusQ systemQ (timeout)──> (queue, work key)
//!        ──dispatch(kind)──> run_job ──> commit | rollback
//! ```
//!
//! There is no coordinator and no ordering across work keys. A failed job is
//! logged and dropped. The pop timeout bounds how long an idle runner takes
//! to notice shutdown; a job already started always runs to completion.
//!
//! ## Weighted order
//!
//! BLPOP serves the first non-empty key listed, so the key listed first gets
//! priority. [`weighted_order`] rotates the first slot across pops in
//! proportion to each queue's weight, so a busy high-weight queue cannot
//! starve the others.

use crate::config::QueueWeight;
use crate::jobs::{self, Deps};
use crate::queue::QueueKeys;
use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Queue keys to pop for the `tick`-th pop: the weighted pick first, then
/// every other queue in configured order.
pub fn weighted_order(queues: &[QueueWeight], tick: u64) -> Vec<String> {
    let total: u64 = queues.iter().map(|q| u64::from(q.weight)).sum();
    if total == 0 {
        return queues
            .iter()
            .map(|q| QueueKeys::for_kind(&q.name).queue)
            .collect();
    }
    let mut slot = tick % total;
    let mut first = 0;
    for (i, q) in queues.iter().enumerate() {
        let w = u64::from(q.weight);
        if slot < w {
            first = i;
            break;
        }
        slot -= w;
    }
    std::iter::once(first)
        .chain((0..queues.len()).filter(|&i| i != first))
        .map(|i| QueueKeys::for_kind(&queues[i].name).queue)
        .collect()
}

pub struct WorkerPool {
    deps: Deps,
}

impl WorkerPool {
    pub fn new(deps: Deps) -> Self {
        Self { deps }
    }

    /// Run every runner until `shutdown` turns true, then wait for the jobs
    /// in flight.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let runners = self.deps.config.worker.runners;
        info!(runners, "worker pool starting");
        let mut set = JoinSet::new();
        for id in 0..runners {
            let deps = self.deps.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                if let Err(e) = run_runner(id, deps, shutdown).await {
                    error!(runner = id, error = %e, "runner exited");
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "runner task panicked");
            }
        }
        info!("worker pool stopped");
        Ok(())
    }
}

async fn run_runner(id: usize, deps: Deps, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let kv = deps.kv.dedicated().await?;
    let timeout = deps.config.worker.pop_timeout();
    // Runners start at different ticks so they do not all favour the same queue.
    let mut tick = id as u64;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let order = weighted_order(&deps.config.worker.queues, tick);
        tick = tick.wrapping_add(1);
        let popped = tokio::select! {
            r = kv.blpop(&order, timeout) => r,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let (queue, work_key) = match popped {
            Ok(Some(item)) => item,
            Ok(None) => continue,
            Err(e) => {
                warn!(runner = id, error = %e, "queue pop failed");
                tokio::time::sleep(timeout).await;
                continue;
            }
        };
        deps.metrics.queue_popped(&queue);
        let Some(kind) = QueueKeys::kind_of_queue(&queue) else {
            warn!(queue = %queue, "popped from unrecognised queue");
            continue;
        };
        deps.metrics.runners_busy.inc();
        match jobs::dispatch(kind, &work_key, &deps).await {
            Ok(outcome) => debug!(queue = %queue, work_key = %work_key, ?outcome, "job done"),
            Err(e) => {
                let detail = format!("{:#}", e);
                error!(queue = %queue, work_key = %work_key, error = %detail, "job failed, dropped");
            }
        }
        deps.metrics.runners_busy.dec();
    }
    debug!(runner = id, "runner stopping");
    Ok(())
}
