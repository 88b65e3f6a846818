//! # Config — Worker Configuration File
//!
//! Optional TOML file; every section and key has a built-in default, so a
//! missing file means "run with defaults".
//!
//! ```toml
//! [worker]
//! runners = 4
//! with_tx = true
//! pop_timeout_ms = 1000
//!
//! [[worker.queues]]
//! name = "daemonStatus"
//! weight = 3
//!
//! [[worker.queues]]
//! name = "system"
//! weight = 1
//!
//! [alerts.unavailable]
//! default = 3
//! PRD = 4
//!
//! [notify]
//! enabled = true
//! channel = "fleetfeed:changes"
//! ```
//!
//! Command-line flags override file values after loading.

use crate::alerts::AlertSeverities;
use crate::jobs;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub alerts: AlertSeverities,
    pub notify: NotifyConfig,
}

/// The `[worker]` section: pool sizing and queue weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub runners: usize,
    /// Run jobs inside a database transaction.
    pub with_tx: bool,
    /// Blocking pop timeout, after which an idle runner re-checks shutdown.
    pub pop_timeout_ms: u64,
    pub queues: Vec<QueueWeight>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            runners: 4,
            with_tx: true,
            pop_timeout_ms: 1000,
            queues: vec![
                QueueWeight {
                    name: jobs::DAEMON_STATUS.to_string(),
                    weight: 3,
                },
                QueueWeight {
                    name: jobs::SYSTEM.to_string(),
                    weight: 1,
                },
            ],
        }
    }
}

impl WorkerConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWeight {
    pub name: String,
    pub weight: u32,
}

/// The `[notify]` section: change event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub channel: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "fleetfeed:changes".to_string(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────

/// Parse and validate a configuration from a TOML string.
pub fn parse_toml(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the file at `path`, or the defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub fn to_toml(config: &Config) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

/// Check the configuration for logical consistency.
pub fn validate_config(config: &Config) -> Result<()> {
    let w = &config.worker;
    if w.runners == 0 {
        bail!("worker.runners must be at least 1");
    }
    if w.pop_timeout_ms == 0 {
        bail!("worker.pop_timeout_ms must be positive");
    }
    if w.queues.is_empty() {
        bail!("worker.queues must name at least one queue");
    }
    let mut seen = BTreeSet::new();
    for q in &w.queues {
        if !jobs::KINDS.contains(&q.name.as_str()) {
            bail!(
                "unknown queue '{}'. Valid: {}",
                q.name,
                jobs::KINDS.join(", ")
            );
        }
        if q.weight == 0 {
            bail!("queue '{}' has zero weight", q.name);
        }
        if !seen.insert(q.name.as_str()) {
            bail!("queue '{}' listed twice", q.name);
        }
    }
    if config.notify.enabled && config.notify.channel.is_empty() {
        bail!("notify.channel is required when notify.enabled is set");
    }
    Ok(())
}
