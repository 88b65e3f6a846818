//! # Metrics — Prometheus Exposition
//!
//! Worker pool and job runner metrics in the OpenMetrics text format.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleetfeed_job_step_duration_seconds` | Histogram | `job`, `step`, `status` | Duration of each operation-chain step |
//! | `fleetfeed_jobs_total` | Counter | `job`, `status` | Finished jobs (`committed`, `stopped`, `rolled_back`) |
//! | `fleetfeed_queue_pops_total` | Counter | `queue` | Work keys popped per queue |
//! | `fleetfeed_runners_busy` | Gauge | — | Runners currently executing a job |
//!
//! Step `status` is one of `ok`, `err` (blocking failure), `warn`
//! (non-blocking failure) or `skipped` (condition false).

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabel {
    pub job: String,
    pub step: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabel {
    pub job: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabel {
    pub queue: String,
}

type HistogramFamily<L> = Family<L, Histogram, fn() -> Histogram>;

/// 1 ms to ~32 s.
fn step_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

/// Registry shared by every runner. All metric handles are atomic.
pub struct Metrics {
    pub registry: Registry,
    pub step_duration: HistogramFamily<StepLabel>,
    pub jobs: Family<JobLabel, Counter>,
    pub queue_pops: Family<QueueLabel, Counter>,
    pub runners_busy: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let step_duration = HistogramFamily::<StepLabel>::new_with_constructor(step_histogram);
        registry.register(
            "fleetfeed_job_step_duration_seconds",
            "Duration of job operation steps",
            step_duration.clone(),
        );

        let jobs = Family::<JobLabel, Counter>::default();
        registry.register("fleetfeed_jobs", "Finished jobs by outcome", jobs.clone());

        let queue_pops = Family::<QueueLabel, Counter>::default();
        registry.register(
            "fleetfeed_queue_pops",
            "Work keys popped from each queue",
            queue_pops.clone(),
        );

        let runners_busy = Gauge::default();
        registry.register(
            "fleetfeed_runners_busy",
            "Runners currently executing a job",
            runners_busy.clone(),
        );

        Self {
            registry,
            step_duration,
            jobs,
            queue_pops,
            runners_busy,
        }
    }

    pub fn observe_step(&self, job: &str, step: &str, status: &str, elapsed: Duration) {
        self.step_duration
            .get_or_create(&StepLabel {
                job: job.to_string(),
                step: step.to_string(),
                status: status.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn job_finished(&self, job: &str, status: &str) {
        self.jobs
            .get_or_create(&JobLabel {
                job: job.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn queue_popped(&self, queue: &str) {
        self.queue_pops
            .get_or_create(&QueueLabel {
                queue: queue.to_string(),
            })
            .inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            warn!(error = %e, "metrics encoding failed");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
