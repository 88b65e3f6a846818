//! # Merge — Hypervisor + Encapsulated Container Status Algebra
//!
//! A hypervisor instance hosting containers (or VMs) is recorded once per
//! container, each row carrying the combination of the hypervisor's and the
//! container's status on every dimension. Combination is a fixed lookup
//! table: the less healthy side wins, except that a standby state facing an
//! active one yields `warn`.
//!
//! ## Merge Table
//!
//! Rows are the hypervisor status, columns the container status. The last
//! column is used when the container does not report the dimension.
//!
//! | hv \ c | up | down | warn | n/a | undef | stdby up | stdby down | absent |
//! |--------|----|------|------|-----|-------|----------|------------|--------|
//! | up | up | down | warn | up | undef | warn | warn | up |
//! | down | down | down | down | down | undef | down | down | down |
//! | warn | warn | down | warn | warn | undef | warn | warn | warn |
//! | n/a | up | down | warn | n/a | undef | stdby up | stdby down | n/a |
//! | undef | undef | undef | undef | undef | undef | undef | undef | undef |
//! | stdby up | warn | down | warn | stdby up | undef | stdby up | stdby down | stdby up |
//! | stdby down | warn | down | warn | stdby down | undef | stdby down | stdby down | stdby down |
//!
//! ## Frozen
//!
//! Frozen is bit arithmetic rather than table driven: bit 0 is the
//! hypervisor instance, bit 1 the container.

use crate::status::{InstanceStatus, Monitor, ResourceStatus, Status, StatusGroup};
use crate::translog::Field;

use Status::{
    Down as D, NotApplicable as NA, StdbyDown as SD, StdbyUp as SU, Undef as U, Up as UP,
    Warn as W,
};

/// Indexed `[hv.index()][c.index()]`, column 7 = container absent.
pub const MERGE_TABLE: [[Status; 8]; 7] = [
    [UP, D, W, UP, U, W, W, UP],
    [D, D, D, D, U, D, D, D],
    [W, D, W, W, U, W, W, W],
    [UP, D, W, NA, U, SU, SD, NA],
    [U, U, U, U, U, U, U, U],
    [W, D, W, SU, U, SU, SD, SU],
    [W, D, W, SD, U, SD, SD, SD],
];

const ABSENT: usize = 7;

pub fn merge(hv: Status, container: Option<Status>) -> Status {
    let col = container.map(Status::index).unwrap_or(ABSENT);
    MERGE_TABLE[hv.index()][col]
}

pub fn merge_frozen(hv_frozen: bool, encap_frozen: bool) -> u8 {
    (hv_frozen as u8) | ((encap_frozen as u8) << 1)
}

/// The nine instance status dimensions tracked together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusVector {
    pub avail: Status,
    pub overall: Status,
    pub ip: Status,
    pub disk: Status,
    pub fs: Status,
    pub share: Status,
    pub container: Status,
    pub app: Status,
    pub sync: Status,
}

impl StatusVector {
    pub fn from_parts(avail: Status, overall: Status, group: &StatusGroup) -> Self {
        Self {
            avail,
            overall,
            ip: group.ip,
            disk: group.disk,
            fs: group.fs,
            share: group.share,
            container: group.container,
            app: group.app,
            sync: group.sync,
        }
    }

    /// Dimension-wise merge with a container vector, or with "absent".
    pub fn merge(&self, other: Option<&StatusVector>) -> Self {
        let m = |hv: Status, pick: fn(&StatusVector) -> Status| merge(hv, other.map(pick));
        Self {
            avail: m(self.avail, |v| v.avail),
            overall: m(self.overall, |v| v.overall),
            ip: m(self.ip, |v| v.ip),
            disk: m(self.disk, |v| v.disk),
            fs: m(self.fs, |v| v.fs),
            share: m(self.share, |v| v.share),
            container: m(self.container, |v| v.container),
            app: m(self.app, |v| v.app),
            sync: m(self.sync, |v| v.sync),
        }
    }

    /// Values in `svcmon_log` column order.
    pub fn fields(&self) -> Vec<Field> {
        [
            self.avail,
            self.overall,
            self.ip,
            self.disk,
            self.fs,
            self.share,
            self.container,
            self.app,
            self.sync,
        ]
        .iter()
        .map(|s| Field::from(s.as_str()))
        .collect()
    }
}

/// One row to record for an instance: the instance itself, or one of its
/// containers with the hypervisor status folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedInstance {
    /// Container hostname; empty for a plain instance.
    pub vmname: String,
    pub status: StatusVector,
    pub frozen: u8,
    pub monitor: Monitor,
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Scaler or wrapper instance: no rows of its own.
    Scaler,
    Single(MergedInstance),
    Encap {
        /// Resources of the hypervisor itself, recorded with an empty vmname.
        host_resources: Vec<ResourceStatus>,
        containers: Vec<MergedInstance>,
    },
}

pub fn expand(inst: &InstanceStatus) -> Expansion {
    if inst.is_scaler() {
        return Expansion::Scaler;
    }
    let hv = StatusVector::from_parts(inst.avail, inst.overall, &inst.status_group);
    if inst.encap.is_empty() {
        return Expansion::Single(MergedInstance {
            vmname: String::new(),
            status: hv.merge(None),
            frozen: merge_frozen(inst.frozen, false),
            monitor: inst.monitor.clone(),
            resources: inst.resources.clone(),
        });
    }
    let containers = inst
        .encap
        .iter()
        .map(|c| {
            let cv = StatusVector::from_parts(c.avail, c.overall, &c.status_group);
            MergedInstance {
                vmname: c.hostname.clone(),
                status: hv.merge(Some(&cv)),
                frozen: merge_frozen(inst.frozen, c.frozen),
                monitor: inst.monitor.clone(),
                resources: c.resources.clone(),
            }
        })
        .collect();
    Expansion::Encap {
        host_resources: inst.resources.clone(),
        containers,
    }
}
