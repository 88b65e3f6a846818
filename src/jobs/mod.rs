//! # Jobs — Operation Chains with Transactional Commit
//!
//! A job is an ordered chain of [`Operation`]s run against one relational
//! [`Session`]. Each popped work key yields exactly one job run:
//!
//! ```text
//! popped ──> running ──┬──> committed    (chain succeeded)
//!                      └──> rolled back  (a blocking step failed)
//! ```
//!
//! Both ends are terminal. There is no retry: the pending marker is dropped
//! before the session opens, so a failed run (store outage included) is
//! lost only until the agent posts again.
//!
//! ## Operation semantics
//!
//! | Field | Effect |
//! |-------|--------|
//! | `condition` | step skipped when it returns false |
//! | `blocking` | failure aborts the chain and rolls back |
//! | non-blocking | failure is logged, the chain continues |
//!
//! A step may also end the chain early without error through
//! [`JobContext::stop`], used for referential gaps (unknown node, missing
//! payload). The run still commits.
//!
//! Every step's duration and outcome is recorded in
//! `fleetfeed_job_step_duration_seconds`.
//!
//! With a Postgres transaction, a failed non-blocking statement aborts the
//! transaction and the final commit becomes a rollback. Run with
//! `with_tx = false` when best-effort steps must not cost the whole job.

pub mod daemon_status;
pub mod system;

pub use daemon_status::DaemonStatusJob;
pub use system::SystemJob;

use crate::config::Config;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::notify::{self, ChangeNotifier, ChangeSet};
use crate::queue::{self, QueueKeys};
use crate::store::{Session, Store};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

pub const DAEMON_STATUS: &str = "daemonStatus";
pub const SYSTEM: &str = "system";

/// Work kinds with a registered job.
pub const KINDS: [&str; 2] = [DAEMON_STATUS, SYSTEM];

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything a job needs, built once at startup and shared by all runners.
#[derive(Clone)]
pub struct Deps {
    pub kv: Arc<dyn KvStore>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub clock: Clock,
}

impl Deps {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn ChangeNotifier>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        Self {
            kv,
            store,
            notifier,
            metrics,
            config: Arc::new(config),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

// ── Operations ──────────────────────────────────────────────────

pub struct Operation<J: Job> {
    pub desc: &'static str,
    pub step: J::Step,
    pub blocking: bool,
    pub condition: Option<fn(&J) -> bool>,
}

impl<J: Job> Operation<J> {
    pub fn blocking(desc: &'static str, step: J::Step) -> Self {
        Self {
            desc,
            step,
            blocking: true,
            condition: None,
        }
    }

    pub fn best_effort(desc: &'static str, step: J::Step) -> Self {
        Self {
            desc,
            step,
            blocking: false,
            condition: None,
        }
    }

    pub fn when(mut self, condition: fn(&J) -> bool) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Per-run state handed to every step.
pub struct JobContext<'a> {
    pub session: &'a mut dyn Session,
    pub deps: &'a Deps,
    pub changes: &'a mut ChangeSet,
    /// Timestamp of this run, shared by every row it writes.
    pub now: DateTime<Utc>,
    stopped: bool,
}

impl JobContext<'_> {
    /// End the chain after the current step, without error.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

#[async_trait]
pub trait Job: Send + Sized {
    type Step: Copy + Send + Sync + fmt::Debug;

    fn name(&self) -> &'static str;

    fn work_key(&self) -> &str;

    fn with_tx(&self) -> bool {
        true
    }

    fn operations(&self) -> Vec<Operation<Self>>;

    async fn execute(&mut self, step: Self::Step, ctx: &mut JobContext<'_>) -> Result<()>;

    /// Called after a successful commit.
    fn log_result(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Committed,
    /// A step ended the chain early; whatever ran was committed.
    Stopped,
}

// ── Runner ──────────────────────────────────────────────────────

pub async fn run_job<J: Job>(job: J, deps: &Deps) -> Result<JobOutcome> {
    let span = info_span!("job", queue = job.name(), work_key = %job.work_key());
    run_job_inner(job, deps).instrument(span).await
}

async fn run_job_inner<J: Job>(mut job: J, deps: &Deps) -> Result<JobOutcome> {
    drop_pending(deps, &QueueKeys::for_kind(job.name()), job.work_key()).await?;
    let with_tx = job.with_tx() && deps.config.worker.with_tx;
    let mut session = deps
        .store
        .session(with_tx)
        .await
        .context("opening store session")?;
    let mut changes = ChangeSet::default();
    let result = {
        let mut ctx = JobContext {
            session: session.as_mut(),
            deps,
            changes: &mut changes,
            now: deps.now(),
            stopped: false,
        };
        run_chain(&mut job, &mut ctx)
            .await
            .map(|()| ctx.stopped)
    };
    match result {
        Ok(stopped) => {
            if let Err(e) = session.commit().await {
                deps.metrics.job_finished(job.name(), "rolled_back");
                return Err(e.context("commit failed"));
            }
            job.log_result();
            notify::publish(deps.notifier.as_ref(), &changes).await;
            if stopped {
                deps.metrics.job_finished(job.name(), "stopped");
                Ok(JobOutcome::Stopped)
            } else {
                deps.metrics.job_finished(job.name(), "committed");
                Ok(JobOutcome::Committed)
            }
        }
        Err(e) => {
            if let Err(rb) = session.rollback().await {
                warn!(error = %rb, "rollback failed");
            }
            deps.metrics.job_finished(job.name(), "rolled_back");
            Err(e)
        }
    }
}

async fn run_chain<J: Job>(job: &mut J, ctx: &mut JobContext<'_>) -> Result<()> {
    let name = job.name();
    for op in job.operations() {
        if ctx.stopped {
            break;
        }
        if let Some(condition) = op.condition {
            if !condition(job) {
                debug!(step = op.desc, "skipped");
                ctx.deps
                    .metrics
                    .observe_step(name, op.desc, "skipped", Default::default());
                continue;
            }
        }
        let started = Instant::now();
        let result = job.execute(op.step, ctx).await;
        let elapsed = started.elapsed();
        match result {
            Ok(()) => {
                debug!(step = op.desc, elapsed_ms = elapsed.as_millis() as u64, "ok");
                ctx.deps.metrics.observe_step(name, op.desc, "ok", elapsed);
            }
            Err(e) if op.blocking => {
                let detail = format!("{:#}", e);
                error!(step = op.desc, error = %detail, "blocking step failed");
                ctx.deps.metrics.observe_step(name, op.desc, "err", elapsed);
                return Err(e.context(format!("{} failed", op.desc)));
            }
            Err(e) => {
                let detail = format!("{:#}", e);
                warn!(step = op.desc, error = %detail, "step failed, continuing");
                ctx.deps.metrics.observe_step(name, op.desc, "warn", elapsed);
            }
        }
    }
    Ok(())
}

/// Run the job registered for `kind` on `work_key`.
pub async fn dispatch(kind: &str, work_key: &str, deps: &Deps) -> Result<JobOutcome> {
    match kind {
        DAEMON_STATUS => run_job(DaemonStatusJob::new(work_key), deps).await,
        SYSTEM => run_job(SystemJob::new(work_key), deps).await,
        other => bail!("no job registered for kind '{}'", other),
    }
}

// ── Shared steps ────────────────────────────────────────────────

/// Clear the pending marker so a post arriving from now on queues a new
/// run, whatever happens to this one.
async fn drop_pending(deps: &Deps, keys: &QueueKeys, work_key: &str) -> Result<()> {
    queue::drop_pending(deps.kv.as_ref(), &keys.pending, work_key)
        .await
        .context("dropping pending marker")
}

/// Load the latest payload; `None` stops the chain.
pub(crate) async fn fetch_payload(ctx: &mut JobContext<'_>, keys: &QueueKeys, work_key: &str) -> Result<Option<Vec<u8>>> {
    let payload = queue::fetch_payload(ctx.deps.kv.as_ref(), keys, work_key)
        .await
        .context("fetching payload")?;
    if payload.is_none() {
        debug!("no payload stored, nothing to do");
        ctx.stop();
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::notify::RecordingNotifier;
    use crate::store::memory::MemoryStore;
    use anyhow::anyhow;

    /// Store whose database is unreachable.
    struct Unreachable;

    #[async_trait]
    impl Store for Unreachable {
        async fn ping(&self) -> Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn session(&self, _with_tx: bool) -> Result<Box<dyn Session>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Write,
        Fail,
        Stop,
        Never,
    }

    struct Scripted {
        blocking_failure: bool,
        ran: Vec<&'static str>,
    }

    #[async_trait]
    impl Job for Scripted {
        type Step = Step;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn work_key(&self) -> &str {
            "k1"
        }

        fn operations(&self) -> Vec<Operation<Self>> {
            let fail = if self.blocking_failure {
                Operation::blocking("fail", Step::Fail)
            } else {
                Operation::best_effort("fail", Step::Fail)
            };
            vec![
                Operation::blocking("write", Step::Write),
                fail,
                Operation::blocking("never", Step::Never).when(|_| false),
                Operation::blocking("stop", Step::Stop),
                Operation::blocking("after stop", Step::Write),
            ]
        }

        async fn execute(&mut self, step: Step, ctx: &mut JobContext<'_>) -> Result<()> {
            match step {
                Step::Write => {
                    self.ran.push("write");
                    ctx.session
                        .find_or_create_object("app1", "c1", "", ctx.now)
                        .await?;
                    ctx.changes.mark("services");
                    Ok(())
                }
                Step::Fail => {
                    self.ran.push("fail");
                    Err(anyhow!("boom"))
                }
                Step::Stop => {
                    self.ran.push("stop");
                    ctx.stop();
                    Ok(())
                }
                Step::Never => {
                    self.ran.push("never");
                    Ok(())
                }
            }
        }
    }

    fn deps(store: &MemoryStore, notifier: Arc<RecordingNotifier>) -> Deps {
        Deps::new(
            Arc::new(MemoryKv::new()),
            Arc::new(store.clone()),
            notifier,
            Arc::new(Metrics::new()),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn blocking_failure_rolls_back() {
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let d = deps(&store, notifier.clone());
        let job = Scripted {
            blocking_failure: true,
            ran: Vec::new(),
        };
        let err = run_job(job, &d).await.unwrap_err();
        assert!(format!("{:#}", err).contains("fail failed"));
        assert!(store.objects().is_empty());
        assert!(notifier.events().is_empty());
        assert!(d.metrics.encode().contains("status=\"rolled_back\""));
    }

    #[tokio::test]
    async fn best_effort_failure_continues_and_commits() {
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let d = deps(&store, notifier.clone());
        let job = Scripted {
            blocking_failure: false,
            ran: Vec::new(),
        };
        let outcome = run_job(job, &d).await.unwrap();
        assert_eq!(outcome, JobOutcome::Stopped);
        assert_eq!(store.objects().len(), 1);
        assert_eq!(notifier.events(), vec!["services"]);
        let text = d.metrics.encode();
        assert!(text.contains("step=\"fail\",status=\"warn\""));
        assert!(text.contains("step=\"never\",status=\"skipped\""));
        assert!(!text.contains("step=\"after stop\""));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let store = MemoryStore::new();
        let d = deps(&store, Arc::new(RecordingNotifier::new()));
        let err = dispatch("packages", "k", &d).await.unwrap_err();
        assert!(err.to_string().contains("packages"));
    }

    #[tokio::test]
    async fn store_outage_still_releases_work_key() {
        let kv = MemoryKv::new();
        let d = Deps::new(
            Arc::new(kv.clone()),
            Arc::new(Unreachable),
            Arc::new(RecordingNotifier::new()),
            Arc::new(Metrics::new()),
            Config::default(),
        );
        let keys = QueueKeys::for_kind(DAEMON_STATUS);
        assert!(queue::post(&kv, &keys, "nid1", b"{}", &[]).await.unwrap());
        assert!(!queue::post(&kv, &keys, "nid1", b"{}", &[]).await.unwrap());
        let popped = kv
            .blpop(&[keys.queue.clone()], std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(popped, Some((keys.queue.clone(), "nid1".to_string())));

        let err = dispatch(DAEMON_STATUS, "nid1", &d).await.unwrap_err();
        assert!(format!("{:#}", err).contains("opening store session"));
        assert!(kv.hash(&keys.pending).is_empty());

        // The next agent post queues a fresh run.
        assert!(queue::post(&kv, &keys, "nid1", b"{}", &[]).await.unwrap());
        assert_eq!(kv.list(&keys.queue), vec!["nid1"]);
    }
}
