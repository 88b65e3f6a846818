//! # Store — Relational State
//!
//! Current-state tables, transition-log pairs and dashboard alerts, reached
//! through a [`Session`] that a single job owns for its whole run.
//!
//! ## Sessions
//!
//! [`Store::session`] opens either a transaction (committed or rolled back
//! as a whole by the job runner) or a plain pooled connection where every
//! statement autocommits. `commit` and `rollback` consume the session.
//!
//! ## Implementations
//!
//! - [`postgres::PgStore`]: `sqlx` pool against the collector schema
//! - [`memory::MemoryStore`]: mutex-guarded tables for tests
//!
//! ## Object identifiers
//!
//! [`Session::find_or_create_object`] serializes per `(name, cluster)` so
//! two workers seeing a new object at once allocate a single identifier.

pub mod memory;
pub mod postgres;

use crate::merge::StatusVector;
use crate::status::Status;
use crate::translog::{Field, LastRow, TransitionTable};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Row types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub node_id: String,
    pub nodename: String,
    pub cluster_id: String,
    pub frozen: bool,
}

/// Hardware and OS facts posted on the `system` queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInventory {
    pub os_name: String,
    pub os_vendor: String,
    pub os_release: String,
    pub os_kernel: String,
    pub os_arch: String,
    pub cpu_model: String,
    pub cpu_threads: i64,
    pub mem_bytes: i64,
    pub model: String,
    pub serial: String,
    pub asset_env: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRow {
    pub object_id: String,
    pub name: String,
    pub cluster_id: String,
    pub env: String,
    pub app: String,
    pub avail: Status,
    pub overall: Status,
    pub placement: String,
    pub frozen: bool,
    pub provisioned: String,
    pub topology: String,
    pub flex_min: i64,
    pub flex_max: i64,
    pub updated: DateTime<Utc>,
}

impl ObjectRow {
    /// A freshly allocated object, status unknown until first update.
    pub fn new(object_id: String, name: &str, cluster_id: &str, app: &str, now: DateTime<Utc>) -> Self {
        Self {
            object_id,
            name: name.to_string(),
            cluster_id: cluster_id.to_string(),
            env: String::new(),
            app: app.to_string(),
            avail: Status::Undef,
            overall: Status::Undef,
            placement: String::new(),
            frozen: false,
            provisioned: "n/a".to_string(),
            topology: "failover".to_string(),
            flex_min: 0,
            flex_max: 0,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    pub object_id: String,
    pub node_id: String,
    pub vmname: String,
    pub status: StatusVector,
    pub frozen: i32,
    pub monitor_status: String,
    pub global_expect: String,
    pub topology: String,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub object_id: String,
    pub vmname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRow {
    pub object_id: String,
    pub node_id: String,
    pub vmname: String,
    pub rid: String,
    pub status: Status,
    pub kind: String,
    pub desc: String,
    pub log: String,
    pub monitor: bool,
    pub disable: bool,
    pub optional: bool,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRow {
    pub node_id: String,
    pub peer_node_id: String,
    pub hb_id: String,
    pub driver: String,
    pub state: String,
    pub beating: i64,
    pub desc: String,
    pub updated: DateTime<Utc>,
}

/// Dashboard alert. `node_id` is empty for object-level alerts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRow {
    pub object_id: String,
    pub node_id: String,
    pub alert_type: String,
    pub fmt: String,
    pub dict: Value,
    pub severity: i32,
    pub env: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

// ── Traits ──────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Open a session, transactional when `with_tx` is set.
    async fn session(&self, with_tx: bool) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    // transition log primitives

    async fn log_last(&mut self, table: &TransitionTable, key: &[String]) -> Result<Option<LastRow>>;

    async fn insert_log(
        &mut self,
        table: &TransitionTable,
        key: &[String],
        values: &[Field],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;

    async fn put_log_last(
        &mut self,
        table: &TransitionTable,
        key: &[String],
        values: &[Field],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;

    /// Move `end` forward; never moves it backwards.
    async fn extend_log_last(&mut self, table: &TransitionTable, key: &[String], end: DateTime<Utc>) -> Result<()>;

    // nodes

    async fn node(&mut self, node_id: &str) -> Result<Option<Node>>;

    async fn cluster_nodes(&mut self, cluster_id: &str) -> Result<Vec<Node>>;

    async fn set_node_frozen(&mut self, node_id: &str, frozen: bool) -> Result<bool>;

    async fn update_node_inventory(&mut self, node_id: &str, inventory: &NodeInventory, now: DateTime<Utc>) -> Result<()>;

    /// Instances currently recorded for the node.
    async fn node_instance_count(&mut self, node_id: &str) -> Result<i64>;

    // objects

    async fn find_object(&mut self, name: &str, cluster_id: &str) -> Result<Option<ObjectRow>>;

    /// Returns the row and whether it was created by this call.
    async fn find_or_create_object(
        &mut self,
        name: &str,
        cluster_id: &str,
        app: &str,
        now: DateTime<Utc>,
    ) -> Result<(ObjectRow, bool)>;

    async fn update_object_status(&mut self, row: &ObjectRow) -> Result<()>;

    async fn object_has_tag(&mut self, object_id: &str, tag: &str) -> Result<bool>;

    // instances

    async fn upsert_instance(&mut self, row: &InstanceRow) -> Result<()>;

    /// Delete every row of the object on the node, containers included.
    async fn delete_instances(&mut self, object_id: &str, node_id: &str) -> Result<u64>;

    /// Delete the node's instance rows not listed in `keep`, with their
    /// resources and the node-scoped alerts of objects no longer kept.
    /// Returns the number of instance rows removed.
    async fn delete_stale_instances(&mut self, node_id: &str, keep: &[InstanceKey]) -> Result<u64>;

    // resources

    async fn upsert_resource(&mut self, row: &ResourceRow) -> Result<()>;

    async fn delete_stale_resources(
        &mut self,
        object_id: &str,
        node_id: &str,
        vmname: &str,
        keep_rids: &[String],
    ) -> Result<u64>;

    // heartbeats

    async fn upsert_heartbeat(&mut self, row: &HeartbeatRow) -> Result<()>;

    // dashboard

    async fn upsert_alert(&mut self, row: &AlertRow) -> Result<()>;

    async fn delete_alert(&mut self, object_id: &str, node_id: &str, alert_type: &str) -> Result<u64>;

    /// Count the object's `up` instances and upsert `row` (with the count
    /// and range in its dict) only when outside `[min, max]`, `max = 0`
    /// meaning unbounded. Returns true when the row was written.
    async fn upsert_flex_alert_if_violated(&mut self, row: &AlertRow, min: i64, max: i64) -> Result<bool>;

    /// True while an acknowledged-unavailability window covers `now`.
    async fn unavailability_acked(&mut self, object_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Failed actions not yet acknowledged for the object on the node.
    async fn action_error_count(&mut self, object_id: &str, node_id: &str) -> Result<i64>;
}
