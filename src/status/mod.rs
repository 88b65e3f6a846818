//! # Status — Schema-Versioned Cluster Status Normalizer
//!
//! Node agents push their view of the cluster as loosely-typed JSON. Two
//! payload generations are in the wild and both must be accepted:
//!
//! | Version | Layout |
//! |---------|--------|
//! | `2.x` | flat: `data.nodes`, `data.services`, `data.cluster.{id,name}` |
//! | `3.x` | nested: `data.cluster.node`, `data.cluster.object`, `data.cluster.config`, `data.daemon` |
//!
//! [`Snapshot::from_slice`] dispatches on the `version` prefix and returns a
//! tagged union of [`V2Status`] and [`V3Status`]. Both implement
//! [`ClusterStatus`], the capability set the ingestion jobs consume, so the
//! pipeline never walks raw JSON itself.
//!
//! ## Error Reporting
//!
//! Shape violations surface as [`StatusError`] carrying the full key path of
//! the offending value (`data.nodes.n1.services.status.app1.avail`). Unknown
//! properties are ignored so newer agents keep working against this worker.

mod parse;
mod tree;
mod v2;
mod v3;

pub use v2::V2Status;
pub use v3::V3Status;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

// ── Errors ──────────────────────────────────────────────────────

/// Malformed payload errors. Every variant names the key path involved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("payload is not valid json: {0}")]
    Decode(String),

    #[error("unsupported status version {0:?}")]
    UnsupportedVersion(String),

    #[error("missing key {path}")]
    Missing { path: String },

    #[error("unexpected type at {path}: expected {expected}")]
    WrongType { path: String, expected: &'static str },

    #[error("unparsable timestamp at {path}: {value:?}")]
    BadTimestamp { path: String, value: String },
}

pub type StatusResult<T> = Result<T, StatusError>;

// ── Status enumeration ──────────────────────────────────────────

/// Availability of an object, instance, resource or status-group dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "warn")]
    Warn,
    #[default]
    #[serde(rename = "n/a")]
    NotApplicable,
    #[serde(rename = "undef")]
    Undef,
    #[serde(rename = "stdby up")]
    StdbyUp,
    #[serde(rename = "stdby down")]
    StdbyDown,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Up,
        Status::Down,
        Status::Warn,
        Status::NotApplicable,
        Status::Undef,
        Status::StdbyUp,
        Status::StdbyDown,
    ];

    /// Parse an agent status string. Anything unrecognized is `undef`.
    pub fn parse(s: &str) -> Status {
        match s.trim() {
            "up" => Status::Up,
            "down" => Status::Down,
            "warn" => Status::Warn,
            "n/a" => Status::NotApplicable,
            "stdby up" => Status::StdbyUp,
            "stdby down" => Status::StdbyDown,
            _ => Status::Undef,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
            Status::Warn => "warn",
            Status::NotApplicable => "n/a",
            Status::Undef => "undef",
            Status::StdbyUp => "stdby up",
            Status::StdbyDown => "stdby down",
        }
    }

    /// Position in [`Status::ALL`], used to index the merge table.
    pub fn index(self) -> usize {
        match self {
            Status::Up => 0,
            Status::Down => 1,
            Status::Warn => 2,
            Status::NotApplicable => 3,
            Status::Undef => 4,
            Status::StdbyUp => 5,
            Status::StdbyDown => 6,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Normalized value types ──────────────────────────────────────

/// Per-instance status dimensions reported alongside avail/overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusGroup {
    pub ip: Status,
    pub disk: Status,
    pub fs: Status,
    pub share: Status,
    pub container: Status,
    pub app: Status,
    pub sync: Status,
}

/// Daemon monitor state for an instance (`smon`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Monitor {
    pub status: String,
    pub global_expect: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    pub rid: String,
    pub status: Status,
    pub kind: String,
    pub desc: String,
    pub log: String,
    pub monitor: bool,
    pub disable: bool,
    pub optional: bool,
}

/// A container or VM hosted inside a hypervisor-managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapStatus {
    pub rid: String,
    pub hostname: String,
    pub avail: Status,
    pub overall: Status,
    pub status_group: StatusGroup,
    pub frozen: bool,
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub avail: Status,
    pub overall: Status,
    pub status_group: StatusGroup,
    pub frozen: bool,
    pub monitor: Monitor,
    pub resources: Vec<ResourceStatus>,
    pub encap: Vec<EncapStatus>,
    pub app: Option<String>,
    pub env: Option<String>,
    pub topology: String,
    pub flex_min: i64,
    pub flex_max: i64,
    pub scale: Option<i64>,
    pub slave: bool,
}

impl InstanceStatus {
    /// Scaler and wrapper instances carry neither resources nor containers.
    pub fn is_scaler(&self) -> bool {
        self.resources.is_empty() && self.encap.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStatus {
    pub avail: Status,
    pub overall: Status,
    pub placement: String,
    pub frozen: bool,
    pub provisioned: String,
}

/// One (stream, peer) heartbeat observation from the posting node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStatus {
    pub stream: String,
    pub peer: String,
    pub driver: String,
    pub state: String,
    /// 0 = peer silent, 1 = peer beating, 2 = stream not running.
    pub beating: i64,
    pub desc: String,
}

// ── Capability interface ────────────────────────────────────────

/// Uniform read access to a cluster status snapshot, whatever its version.
pub trait ClusterStatus {
    fn version(&self) -> &str;
    fn cluster_id(&self) -> &str;
    fn cluster_name(&self) -> &str;
    fn node_names(&self) -> Vec<String>;
    fn object_names(&self) -> Vec<String>;
    fn node_frozen(&self, node: &str) -> StatusResult<bool>;
    fn object_status(&self, name: &str) -> StatusResult<Option<ObjectStatus>>;
    fn instance_status(&self, object: &str, node: &str) -> StatusResult<Option<InstanceStatus>>;
    fn heartbeats(&self) -> StatusResult<Vec<HeartbeatStatus>>;

    /// Nodes of the snapshot hosting an instance of `object`.
    fn instance_nodes(&self, object: &str) -> StatusResult<Vec<String>> {
        let mut nodes = Vec::new();
        for node in self.node_names() {
            if self.instance_status(object, &node)?.is_some() {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// First non-empty `app` declared by an instance of `name` on `nodes`.
    fn app_from_object_name(&self, name: &str, nodes: &[String]) -> Option<String> {
        nodes.iter().find_map(|node| match self.instance_status(name, node) {
            Ok(inst) => inst.and_then(|i| i.app).filter(|app| !app.is_empty()),
            Err(e) => {
                debug!(object = %name, node = %node, error = %e, "instance unreadable, no app");
                None
            }
        })
    }
}

// ── Snapshot dispatch ───────────────────────────────────────────

/// A decoded status payload of either supported generation.
#[derive(Debug, Clone)]
pub enum Snapshot {
    V2(V2Status),
    V3(V3Status),
}

/// Top-level keys understood by this worker.
const KNOWN_TOP_LEVEL: [&str; 2] = ["version", "data"];

impl Snapshot {
    pub fn from_slice(raw: &[u8]) -> StatusResult<Snapshot> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| StatusError::Decode(e.to_string()))?;
        Snapshot::from_value(value)
    }

    pub fn from_value(value: Value) -> StatusResult<Snapshot> {
        let Value::Object(mut top) = value else {
            return Err(StatusError::WrongType {
                path: "$".to_string(),
                expected: "object",
            });
        };
        for key in top.keys() {
            if !KNOWN_TOP_LEVEL.contains(&key.as_str()) {
                debug!(key = %key, "ignoring unknown status property");
            }
        }
        let version = match top.get("version") {
            Some(Value::String(v)) => v.clone(),
            Some(_) => {
                return Err(StatusError::WrongType {
                    path: "version".to_string(),
                    expected: "string",
                })
            }
            None => {
                return Err(StatusError::Missing {
                    path: "version".to_string(),
                })
            }
        };
        let data = top.remove("data").ok_or_else(|| StatusError::Missing {
            path: "data".to_string(),
        })?;
        if version.starts_with("2.") {
            Ok(Snapshot::V2(V2Status::parse(version, data)?))
        } else if version.starts_with("3.") {
            Ok(Snapshot::V3(V3Status::parse(version, data)?))
        } else {
            Err(StatusError::UnsupportedVersion(version))
        }
    }

    fn inner(&self) -> &dyn ClusterStatus {
        match self {
            Snapshot::V2(s) => s,
            Snapshot::V3(s) => s,
        }
    }

    /// Only v3 payloads carry heartbeat stream details.
    pub fn has_heartbeats(&self) -> bool {
        matches!(self, Snapshot::V3(_))
    }
}

impl ClusterStatus for Snapshot {
    fn version(&self) -> &str {
        self.inner().version()
    }

    fn cluster_id(&self) -> &str {
        self.inner().cluster_id()
    }

    fn cluster_name(&self) -> &str {
        self.inner().cluster_name()
    }

    fn node_names(&self) -> Vec<String> {
        self.inner().node_names()
    }

    fn object_names(&self) -> Vec<String> {
        self.inner().object_names()
    }

    fn node_frozen(&self, node: &str) -> StatusResult<bool> {
        self.inner().node_frozen(node)
    }

    fn object_status(&self, name: &str) -> StatusResult<Option<ObjectStatus>> {
        self.inner().object_status(name)
    }

    fn instance_status(&self, object: &str, node: &str) -> StatusResult<Option<InstanceStatus>> {
        self.inner().instance_status(object, node)
    }

    fn heartbeats(&self) -> StatusResult<Vec<HeartbeatStatus>> {
        self.inner().heartbeats()
    }
}

/// Union of two key sets, sorted.
pub(crate) fn sorted_union(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    a.into_iter()
        .chain(b)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
