//! # Alerts — Dashboard Alert Derivation
//!
//! A dashboard alert is a derived row: upserted while its condition holds,
//! deleted once it no longer does. Each alert kind is a small strategy
//! implementing [`AlertKind`].
//!
//! | Kind | `dash_type` | Condition |
//! |------|-------------|-----------|
//! | [`ObjectUnavailable`] | `service unavailable` | avail not `up` nor `n/a` |
//! | [`ObjectDegraded`] | `service degraded` | avail `up`, overall `warn` |
//! | [`ObjectPlacement`] | `service placement` | placement set and not `optimal` |
//! | [`FlexError`] | `flex error` | flex topology, up instances outside `[min, max]` |
//! | [`ActionErrors`] | `action errors` | unacknowledged failed actions on the node |
//!
//! ## Severity
//!
//! Each kind has a [`SeverityTable`]: a default plus per-environment
//! overrides keyed by the object's `env` tag. Tables are configurable.
//!
//! ## Acknowledged unavailability
//!
//! While an acknowledgement window covers the current time, object alerts
//! are deleted instead of raised.

use crate::notify::ChangeSet;
use crate::status::Status;
use crate::store::{AlertRow, ObjectRow, Session};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const DASHBOARD_TABLE: &str = "dashboard";

// ── Severity tables ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityTable {
    pub default: i32,
    #[serde(flatten)]
    pub per_env: BTreeMap<String, i32>,
}

impl SeverityTable {
    pub fn new(default: i32, prd: i32) -> Self {
        Self {
            default,
            per_env: BTreeMap::from([("PRD".to_string(), prd)]),
        }
    }

    pub fn lookup(&self, env: &str) -> i32 {
        self.per_env.get(env).copied().unwrap_or(self.default)
    }
}

/// Severity tables of every alert kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSeverities {
    pub unavailable: SeverityTable,
    pub degraded: SeverityTable,
    pub placement: SeverityTable,
    pub flex: SeverityTable,
    pub action_errors: SeverityTable,
}

impl Default for AlertSeverities {
    fn default() -> Self {
        Self {
            unavailable: SeverityTable::new(3, 4),
            degraded: SeverityTable::new(2, 3),
            placement: SeverityTable::new(0, 1),
            flex: SeverityTable::new(3, 4),
            action_errors: SeverityTable::new(3, 4),
        }
    }
}

// ── Alert kinds ─────────────────────────────────────────────────

pub trait AlertKind: Send + Sync {
    fn alert_type(&self) -> &'static str;
    fn fmt(&self) -> &'static str;
    fn dict(&self) -> Value;
    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable;

    fn row(
        &self,
        object_id: &str,
        node_id: &str,
        env: &str,
        severities: &AlertSeverities,
        now: DateTime<Utc>,
    ) -> AlertRow {
        AlertRow {
            object_id: object_id.to_string(),
            node_id: node_id.to_string(),
            alert_type: self.alert_type().to_string(),
            fmt: self.fmt().to_string(),
            dict: self.dict(),
            severity: self.severities(severities).lookup(env),
            env: env.to_string(),
            created: now,
            updated: now,
        }
    }
}

pub struct ObjectUnavailable {
    pub avail: Status,
}

impl ObjectUnavailable {
    pub fn holds(avail: Status) -> bool {
        !matches!(avail, Status::Up | Status::NotApplicable)
    }
}

impl AlertKind for ObjectUnavailable {
    fn alert_type(&self) -> &'static str {
        "service unavailable"
    }

    fn fmt(&self) -> &'static str {
        "current availability status: %(s)s"
    }

    fn dict(&self) -> Value {
        json!({"s": self.avail.as_str()})
    }

    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable {
        &all.unavailable
    }
}

pub struct ObjectDegraded {
    pub overall: Status,
}

impl ObjectDegraded {
    pub fn holds(avail: Status, overall: Status) -> bool {
        avail == Status::Up && overall == Status::Warn
    }
}

impl AlertKind for ObjectDegraded {
    fn alert_type(&self) -> &'static str {
        "service degraded"
    }

    fn fmt(&self) -> &'static str {
        "current overall status: %(s)s"
    }

    fn dict(&self) -> Value {
        json!({"s": self.overall.as_str()})
    }

    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable {
        &all.degraded
    }
}

pub struct ObjectPlacement {
    pub placement: String,
}

impl ObjectPlacement {
    pub fn holds(placement: &str) -> bool {
        !matches!(placement, "" | "optimal" | "n/a")
    }
}

impl AlertKind for ObjectPlacement {
    fn alert_type(&self) -> &'static str {
        "service placement"
    }

    fn fmt(&self) -> &'static str {
        "placement: %(placement)s"
    }

    fn dict(&self) -> Value {
        json!({"placement": self.placement})
    }

    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable {
        &all.placement
    }
}

/// The instance count is filled in by the store during the threshold check.
pub struct FlexError;

impl AlertKind for FlexError {
    fn alert_type(&self) -> &'static str {
        "flex error"
    }

    fn fmt(&self) -> &'static str {
        "%(n)d instances up, out of [%(smin)d, %(smax)d] range"
    }

    fn dict(&self) -> Value {
        json!({})
    }

    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable {
        &all.flex
    }
}

pub struct ActionErrors {
    pub count: i64,
}

impl AlertKind for ActionErrors {
    fn alert_type(&self) -> &'static str {
        "action errors"
    }

    fn fmt(&self) -> &'static str {
        "%(err)s action errors"
    }

    fn dict(&self) -> Value {
        json!({"err": self.count})
    }

    fn severities<'a>(&self, all: &'a AlertSeverities) -> &'a SeverityTable {
        &all.action_errors
    }
}

// ── Dashboard updates ───────────────────────────────────────────

/// Outcome of one dashboard update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertUpdate {
    Raised,
    Cleared,
}

/// Raise or clear an object-level alert. Deletion is idempotent; a raise
/// refreshes fmt, dict, severity and the update timestamp.
pub async fn update_dashboard_object(
    session: &mut dyn Session,
    obj: &ObjectRow,
    should_delete: bool,
    alert: &dyn AlertKind,
    severities: &AlertSeverities,
    now: DateTime<Utc>,
    changes: &mut ChangeSet,
) -> Result<AlertUpdate> {
    if should_delete || session.unavailability_acked(&obj.object_id, now).await? {
        if session
            .delete_alert(&obj.object_id, "", alert.alert_type())
            .await?
            > 0
        {
            changes.mark(DASHBOARD_TABLE);
        }
        return Ok(AlertUpdate::Cleared);
    }
    let row = alert.row(&obj.object_id, "", &obj.env, severities, now);
    session.upsert_alert(&row).await?;
    changes.mark(DASHBOARD_TABLE);
    Ok(AlertUpdate::Raised)
}

/// Node-scoped variant of [`update_dashboard_object`].
#[allow(clippy::too_many_arguments)]
pub async fn update_dashboard_instance(
    session: &mut dyn Session,
    obj: &ObjectRow,
    node_id: &str,
    should_delete: bool,
    alert: &dyn AlertKind,
    severities: &AlertSeverities,
    now: DateTime<Utc>,
    changes: &mut ChangeSet,
) -> Result<AlertUpdate> {
    if should_delete {
        if session
            .delete_alert(&obj.object_id, node_id, alert.alert_type())
            .await?
            > 0
        {
            changes.mark(DASHBOARD_TABLE);
        }
        return Ok(AlertUpdate::Cleared);
    }
    let row = alert.row(&obj.object_id, node_id, &obj.env, severities, now);
    session.upsert_alert(&row).await?;
    changes.mark(DASHBOARD_TABLE);
    Ok(AlertUpdate::Raised)
}

/// Flex-topology instance count check. The threshold test and the upsert
/// run as one statement; the row is deleted when the range is respected.
pub async fn update_flex_alert(
    session: &mut dyn Session,
    obj: &ObjectRow,
    severities: &AlertSeverities,
    now: DateTime<Utc>,
    changes: &mut ChangeSet,
) -> Result<AlertUpdate> {
    let alert = FlexError;
    let eligible =
        obj.topology == "flex" && !session.unavailability_acked(&obj.object_id, now).await?;
    if eligible {
        let row = alert.row(&obj.object_id, "", &obj.env, severities, now);
        if session
            .upsert_flex_alert_if_violated(&row, obj.flex_min, obj.flex_max)
            .await?
        {
            changes.mark(DASHBOARD_TABLE);
            return Ok(AlertUpdate::Raised);
        }
    }
    if session
        .delete_alert(&obj.object_id, "", alert.alert_type())
        .await?
        > 0
    {
        changes.mark(DASHBOARD_TABLE);
    }
    Ok(AlertUpdate::Cleared)
}

/// Re-derive every object-level alert from the object's current row.
pub async fn refresh_object_alerts(
    session: &mut dyn Session,
    obj: &ObjectRow,
    severities: &AlertSeverities,
    now: DateTime<Utc>,
    changes: &mut ChangeSet,
) -> Result<()> {
    update_dashboard_object(
        session,
        obj,
        !ObjectUnavailable::holds(obj.avail),
        &ObjectUnavailable { avail: obj.avail },
        severities,
        now,
        changes,
    )
    .await?;
    update_dashboard_object(
        session,
        obj,
        !ObjectDegraded::holds(obj.avail, obj.overall),
        &ObjectDegraded {
            overall: obj.overall,
        },
        severities,
        now,
        changes,
    )
    .await?;
    update_dashboard_object(
        session,
        obj,
        !ObjectPlacement::holds(&obj.placement),
        &ObjectPlacement {
            placement: obj.placement.clone(),
        },
        severities,
        now,
        changes,
    )
    .await?;
    update_flex_alert(session, obj, severities, now, changes).await?;
    Ok(())
}
