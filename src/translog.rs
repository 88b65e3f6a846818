//! # Transition Log — Current Interval + Append-Only History
//!
//! Every observed state value is time-bounded by a pair of tables: a `last`
//! table holding the current interval per entity key, and a `history` table
//! holding closed intervals. One algorithm drives all of them:
//!
//! | `last` row | tracked values | effect |
//! |------------|----------------|--------|
//! | absent | — | insert `last` with `begin = end = now` |
//! | present | equal | extend `last.end = now` |
//! | present | different | close the previous interval into `history`, reopen `last` at `now` |
//!
//! The algorithm is instantiated once per entity kind through a
//! [`TransitionTable`] descriptor naming the tables, key columns and tracked
//! value columns. The five instantiations are listed at the bottom of this
//! module.
//!
//! Writes are last-write-wins per key. Concurrent writers for the same key
//! are serialized upstream by the pending-dedup queue.

use crate::notify::ChangeSet;
use crate::store::Session;
use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ── Descriptors ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: FieldKind::Text,
    }
}

const fn int(name: &'static str) -> Column {
    Column {
        name,
        kind: FieldKind::Int,
    }
}

/// One tracked value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Field {
    Text(String),
    Int(i64),
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Text(_) => FieldKind::Text,
            Field::Int(_) => FieldKind::Int,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            Field::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(i) => Some(*i),
            Field::Text(_) => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Text(s) => f.write_str(s),
            Field::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Text(s.to_string())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Text(s)
    }
}

impl From<i64> for Field {
    fn from(i: i64) -> Self {
        Field::Int(i)
    }
}

/// Table pair and column layout of one transition-log instantiation.
/// Key columns are always text.
#[derive(Debug, Clone, Copy)]
pub struct TransitionTable {
    pub history: &'static str,
    pub last: &'static str,
    pub key_columns: &'static [&'static str],
    pub value_columns: &'static [Column],
}

impl TransitionTable {
    fn check(&self, key: &[String], values: &[Field]) -> Result<()> {
        ensure!(
            key.len() == self.key_columns.len(),
            "{}: expected {} key parts, got {}",
            self.history,
            self.key_columns.len(),
            key.len()
        );
        ensure!(
            values.len() == self.value_columns.len(),
            "{}: expected {} values, got {}",
            self.history,
            self.value_columns.len(),
            values.len()
        );
        for (col, v) in self.value_columns.iter().zip(values) {
            ensure!(
                col.kind == v.kind(),
                "{}.{}: expected {:?} value, got {:?}",
                self.history,
                col.name,
                col.kind,
                v.kind()
            );
        }
        Ok(())
    }
}

/// Current interval of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRow {
    pub values: Vec<Field>,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// What [`record`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation: `last` created, nothing appended.
    Opened,
    /// Same values: `last.end` moved forward.
    Extended,
    /// Values changed: previous interval appended to history.
    Appended,
}

// ── Writer ──────────────────────────────────────────────────────

/// Apply one observation of `values` for `key` at `now`.
///
/// A clock that moves backwards never produces an interval ending before it
/// began: the closing timestamp is clamped to the previous `end`.
pub async fn record(
    session: &mut dyn Session,
    table: &TransitionTable,
    key: &[String],
    values: &[Field],
    now: DateTime<Utc>,
    changes: &mut ChangeSet,
) -> Result<Transition> {
    table.check(key, values)?;
    match session.log_last(table, key).await? {
        None => {
            session.put_log_last(table, key, values, now, now).await?;
            changes.mark(table.last);
            changes.mark(table.history);
            Ok(Transition::Opened)
        }
        Some(last) if last.values == values => {
            session.extend_log_last(table, key, now).await?;
            Ok(Transition::Extended)
        }
        Some(last) => {
            let at = now.max(last.end);
            session
                .insert_log(table, key, &last.values, last.begin, at)
                .await?;
            session.put_log_last(table, key, values, at, at).await?;
            changes.mark(table.last);
            changes.mark(table.history);
            Ok(Transition::Appended)
        }
    }
}

// ── Instantiations ──────────────────────────────────────────────

pub const OBJECT_AVAIL: TransitionTable = TransitionTable {
    history: "services_log",
    last: "services_log_last",
    key_columns: &["svc_id"],
    value_columns: &[text("svc_availstatus")],
};

/// Composite instance status: all nine dimensions compared as one tuple.
pub const INSTANCE_STATUS: TransitionTable = TransitionTable {
    history: "svcmon_log",
    last: "svcmon_log_last",
    key_columns: &["svc_id", "node_id", "mon_vmname"],
    value_columns: &[
        text("mon_availstatus"),
        text("mon_overallstatus"),
        text("mon_ipstatus"),
        text("mon_diskstatus"),
        text("mon_fsstatus"),
        text("mon_sharestatus"),
        text("mon_containerstatus"),
        text("mon_appstatus"),
        text("mon_syncstatus"),
    ],
};

pub const RESOURCE_STATUS: TransitionTable = TransitionTable {
    history: "resmon_log",
    last: "resmon_log_last",
    key_columns: &["svc_id", "node_id", "vmname", "rid"],
    value_columns: &[text("res_status"), text("res_log")],
};

pub const HEARTBEAT_STATE: TransitionTable = TransitionTable {
    history: "hbmon_log",
    last: "hbmon_log_last",
    key_columns: &["node_id", "peer_node_id", "hb_id"],
    value_columns: &[text("hb_state"), int("hb_beating")],
};

pub const NODE_FROZEN: TransitionTable = TransitionTable {
    history: "nodes_frozen_log",
    last: "nodes_frozen_log_last",
    key_columns: &["node_id"],
    value_columns: &[int("node_frozen")],
};

pub const ALL_TABLES: [&TransitionTable; 5] = [
    &OBJECT_AVAIL,
    &INSTANCE_STATUS,
    &RESOURCE_STATUS,
    &HEARTBEAT_STATE,
    &NODE_FROZEN,
];
