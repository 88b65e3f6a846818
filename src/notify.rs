//! # Notify — Table Change Events
//!
//! A job collects the names of the tables it touched in a [`ChangeSet`].
//! After commit, one event per distinct table is handed to a
//! [`ChangeNotifier`]. Delivery is best effort: a failed publish is logged
//! and never fails the job.

use crate::kv::KvStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Distinct names of changed tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<String>);

impl ChangeSet {
    pub fn mark(&mut self, table: &str) {
        self.0.insert(table.to_string());
    }

    pub fn contains(&self, table: &str) -> bool {
        self.0.contains(table)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, table: &str, data: Option<Value>) -> Result<()>;
}

/// Publish every change, logging failures.
pub async fn publish(notifier: &dyn ChangeNotifier, changes: &ChangeSet) {
    for table in changes.iter() {
        if let Err(e) = notifier.notify(table, None).await {
            warn!(table, error = %e, "change notification failed");
        }
    }
}

/// Publishes `{"event": "<table>_change", "data": ...}` on a pub/sub channel.
pub struct RedisNotifier {
    kv: Arc<dyn KvStore>,
    channel: String,
}

impl RedisNotifier {
    pub fn new(kv: Arc<dyn KvStore>, channel: impl Into<String>) -> Self {
        Self {
            kv,
            channel: channel.into(),
        }
    }
}

pub(crate) fn event_message(table: &str, data: Option<Value>) -> String {
    json!({
        "event": format!("{}_change", table),
        "data": data.unwrap_or_else(|| json!({})),
    })
    .to_string()
}

#[async_trait]
impl ChangeNotifier for RedisNotifier {
    async fn notify(&self, table: &str, data: Option<Value>) -> Result<()> {
        self.kv
            .publish(&self.channel, &event_message(table, data))
            .await
    }
}

/// Logs events instead of publishing them.
pub struct LogNotifier;

#[async_trait]
impl ChangeNotifier for LogNotifier {
    async fn notify(&self, table: &str, _data: Option<Value>) -> Result<()> {
        info!(table, "table changed");
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChangeNotifier for RecordingNotifier {
    async fn notify(&self, table: &str, _data: Option<Value>) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(table.to_string());
        }
        Ok(())
    }
}
