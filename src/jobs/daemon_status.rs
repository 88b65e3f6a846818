//! # Daemon Status Job — Snapshot Reconciliation
//!
//! Consumes the `daemonStatus` queue. The work key is the posting node's id
//! and the payload its latest cluster status snapshot (v2 or v3).
//!
//! ## Chain
//!
//! | Step | Blocking | Effect |
//! |------|----------|--------|
//! | fetch payload | yes | load the snapshot bytes, stop when gone |
//! | take changes | no | read and clear `<object>@<nodename>` change tokens |
//! | normalize | yes | decode into a [`Snapshot`] |
//! | resolve node | yes | load the caller node, check it appears in its own snapshot |
//! | node frozen | no | node flag + `nodes_frozen_log` |
//! | objects | yes | find-or-create, object status + `services_log` |
//! | instances | yes | merge encap, upsert + `svcmon_log` |
//! | resources | yes | upsert + `resmon_log`, drop vanished rids |
//! | heartbeats | no | v3 only, upsert + `hbmon_log` |
//! | purge stale | no | drop instances the node no longer reports, with their resources and node alerts (full refresh only) |
//! | dashboard | no | re-derive object and action-error alerts |
//! | acknowledge | no | publish the node id on `daemonStatusProcessed` |
//!
//! Objects are never created from a snapshot in which no node runs an
//! instance of them, and an existing object tagged `@purge` without live
//! instance is left untouched, so a stale cached post cannot resurrect a
//! purged object.

use super::{fetch_payload, Job, JobContext, Operation, DAEMON_STATUS};
use crate::alerts::{self, ActionErrors};
use crate::merge::{self, Expansion, MergedInstance};
use crate::queue::{self, QueueKeys};
use crate::status::{ClusterStatus, InstanceStatus, ResourceStatus, Snapshot};
use crate::store::{HeartbeatRow, InstanceKey, InstanceRow, ObjectRow, ResourceRow};
use crate::translog::{self, Field};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Objects carrying this tag are awaiting removal.
pub const PURGE_TAG: &str = "@purge";

#[derive(Debug, Clone, Copy)]
pub enum Step {
    FetchPayload,
    TakeChanges,
    Normalize,
    ResolveNode,
    NodeFrozen,
    Objects,
    Instances,
    Resources,
    Heartbeats,
    PurgeStale,
    Dashboard,
    Acknowledge,
}

/// Resources waiting for the resources step, per recorded instance row.
struct PendingResources {
    object_id: String,
    vmname: String,
    resources: Vec<ResourceStatus>,
}

#[derive(Debug, Default)]
struct Counts {
    objects: usize,
    instances: usize,
    resources: usize,
    heartbeats: usize,
    purged: u64,
}

pub struct DaemonStatusJob {
    keys: QueueKeys,
    node_id: String,
    payload: Option<Vec<u8>>,
    tokens: BTreeSet<String>,
    snapshot: Option<Snapshot>,
    nodename: String,
    cluster_id: String,
    /// Objects refreshed by this run, by name.
    objects: BTreeMap<String, ObjectRow>,
    /// Object ids with an instance on the caller node.
    local_objects: BTreeSet<String>,
    kept: Vec<InstanceKey>,
    pending_resources: Vec<PendingResources>,
    counts: Counts,
}

impl DaemonStatusJob {
    pub fn new(node_id: &str) -> Self {
        Self {
            keys: QueueKeys::for_kind(DAEMON_STATUS),
            node_id: node_id.to_string(),
            payload: None,
            tokens: BTreeSet::new(),
            snapshot: None,
            nodename: String::new(),
            cluster_id: String::new(),
            objects: BTreeMap::new(),
            local_objects: BTreeSet::new(),
            kept: Vec::new(),
            pending_resources: Vec::new(),
            counts: Counts::default(),
        }
    }

    fn has_heartbeats(&self) -> bool {
        self.snapshot.as_ref().is_some_and(Snapshot::has_heartbeats)
    }

    /// Without change tokens the snapshot is a full refresh of the node.
    fn is_full_refresh(&self) -> bool {
        self.tokens.is_empty()
    }

    fn wants_instance(&self, object: &str) -> bool {
        self.tokens.is_empty() || self.tokens.contains(&format!("{}@{}", object, self.nodename))
    }
}

fn normalized(snapshot: &Option<Snapshot>) -> Result<&Snapshot> {
    snapshot.as_ref().context("status snapshot not normalized")
}

#[async_trait]
impl Job for DaemonStatusJob {
    type Step = Step;

    fn name(&self) -> &'static str {
        DAEMON_STATUS
    }

    fn work_key(&self) -> &str {
        &self.node_id
    }

    fn operations(&self) -> Vec<Operation<Self>> {
        vec![
            Operation::blocking("fetch payload", Step::FetchPayload),
            Operation::best_effort("take changes", Step::TakeChanges),
            Operation::blocking("normalize", Step::Normalize),
            Operation::blocking("resolve node", Step::ResolveNode),
            Operation::best_effort("node frozen", Step::NodeFrozen),
            Operation::blocking("objects", Step::Objects),
            Operation::blocking("instances", Step::Instances),
            Operation::blocking("resources", Step::Resources),
            Operation::best_effort("heartbeats", Step::Heartbeats).when(Self::has_heartbeats),
            Operation::best_effort("purge stale", Step::PurgeStale).when(Self::is_full_refresh),
            Operation::best_effort("dashboard", Step::Dashboard),
            Operation::best_effort("acknowledge", Step::Acknowledge),
        ]
    }

    async fn execute(&mut self, step: Step, ctx: &mut JobContext<'_>) -> Result<()> {
        match step {
            Step::FetchPayload => {
                self.payload = fetch_payload(ctx, &self.keys, &self.node_id).await?;
                Ok(())
            }
            Step::TakeChanges => {
                let tokens = queue::take_changes(ctx.deps.kv.as_ref(), &self.keys, &self.node_id)
                    .await
                    .context("taking change tokens")?;
                self.tokens = tokens.into_iter().collect();
                Ok(())
            }
            Step::Normalize => self.normalize(),
            Step::ResolveNode => self.resolve_node(ctx).await,
            Step::NodeFrozen => self.node_frozen(ctx).await,
            Step::Objects => self.update_objects(ctx).await,
            Step::Instances => self.update_instances(ctx).await,
            Step::Resources => self.update_resources(ctx).await,
            Step::Heartbeats => self.update_heartbeats(ctx).await,
            Step::PurgeStale => {
                let n = ctx
                    .session
                    .delete_stale_instances(&self.node_id, &self.kept)
                    .await?;
                if n > 0 {
                    info!(count = n, "stale instances removed");
                    ctx.changes.mark("svcmon");
                    ctx.changes.mark("resmon");
                    ctx.changes.mark("dashboard");
                }
                self.counts.purged = n;
                Ok(())
            }
            Step::Dashboard => self.update_dashboard(ctx).await,
            Step::Acknowledge => {
                ctx.deps
                    .kv
                    .publish(&self.keys.processed, &self.node_id)
                    .await
            }
        }
    }

    fn log_result(&self) {
        info!(
            nodename = %self.nodename,
            objects = self.counts.objects,
            instances = self.counts.instances,
            resources = self.counts.resources,
            heartbeats = self.counts.heartbeats,
            purged = self.counts.purged,
            "daemon status applied"
        );
    }
}

// ── Steps ───────────────────────────────────────────────────────

impl DaemonStatusJob {
    fn normalize(&mut self) -> Result<()> {
        let raw = self.payload.take().context("no payload to normalize")?;
        let snapshot = Snapshot::from_slice(&raw).context("normalizing daemon status")?;
        debug!(version = snapshot.version(), cluster = snapshot.cluster_id(), "status decoded");
        self.snapshot = Some(snapshot);
        Ok(())
    }

    async fn resolve_node(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let snapshot = normalized(&self.snapshot)?;
        let Some(node) = ctx.session.node(&self.node_id).await? else {
            debug!(node_id = %self.node_id, "node not registered, skipping");
            ctx.stop();
            return Ok(());
        };
        if !snapshot.node_names().contains(&node.nodename) {
            // An agent may post before its daemon knows the local node.
            if ctx.session.node_instance_count(&self.node_id).await? == 0 {
                debug!(nodename = %node.nodename, "caller node absent from its first snapshot");
                ctx.stop();
                return Ok(());
            }
            bail!(
                "node '{}' absent from its own status snapshot",
                node.nodename
            );
        }
        self.cluster_id = if node.cluster_id.is_empty() {
            snapshot.cluster_id().to_string()
        } else {
            node.cluster_id
        };
        self.nodename = node.nodename;
        Ok(())
    }

    async fn node_frozen(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let snapshot = normalized(&self.snapshot)?;
        let frozen = snapshot.node_frozen(&self.nodename)?;
        if ctx.session.set_node_frozen(&self.node_id, frozen).await? {
            ctx.changes.mark("nodes");
        }
        translog::record(
            ctx.session,
            &translog::NODE_FROZEN,
            &[self.node_id.clone()],
            &[Field::Int(i64::from(frozen))],
            ctx.now,
            ctx.changes,
        )
        .await?;
        Ok(())
    }

    async fn update_objects(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let snapshot = normalized(&self.snapshot)?;
        for name in snapshot.object_names() {
            let live = snapshot.instance_nodes(&name)?;
            let mut row = if live.is_empty() {
                let Some(row) = ctx.session.find_object(&name, &self.cluster_id).await? else {
                    debug!(object = %name, "no live instance, not creating");
                    continue;
                };
                if ctx.session.object_has_tag(&row.object_id, PURGE_TAG).await? {
                    debug!(object = %name, "purge-tagged object without live instance, skipped");
                    continue;
                }
                row
            } else {
                let app = snapshot
                    .app_from_object_name(&name, &live)
                    .unwrap_or_default();
                let (row, created) = ctx
                    .session
                    .find_or_create_object(&name, &self.cluster_id, &app, ctx.now)
                    .await?;
                if created {
                    info!(object = %name, object_id = %row.object_id, "object created");
                }
                row
            };

            // Deployment settings come from the caller's instance when it has one.
            let source = if live.contains(&self.nodename) {
                Some(self.nodename.as_str())
            } else {
                live.first().map(String::as_str)
            };
            if let Some(node) = source {
                if let Some(inst) = snapshot.instance_status(&name, node)? {
                    apply_instance_settings(&mut row, &inst);
                }
            }

            let status = snapshot.object_status(&name)?;
            if let Some(st) = &status {
                row.avail = st.avail;
                row.overall = st.overall;
                row.placement = st.placement.clone();
                row.frozen = st.frozen;
                row.provisioned = st.provisioned.clone();
            }
            row.updated = ctx.now;
            ctx.session
                .update_object_status(&row)
                .await
                .with_context(|| format!("updating object {}", name))?;
            ctx.changes.mark("services");
            if status.is_some() {
                translog::record(
                    ctx.session,
                    &translog::OBJECT_AVAIL,
                    &[row.object_id.clone()],
                    &[Field::from(row.avail.as_str())],
                    ctx.now,
                    ctx.changes,
                )
                .await?;
            }
            self.counts.objects += 1;
            self.objects.insert(name, row);
        }
        Ok(())
    }

    async fn update_instances(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let snapshot = normalized(&self.snapshot)?;
        for (name, obj) in &self.objects {
            let Some(inst) = snapshot.instance_status(name, &self.nodename)? else {
                continue;
            };
            self.local_objects.insert(obj.object_id.clone());
            if !self.wants_instance(name) {
                continue;
            }
            match merge::expand(&inst) {
                Expansion::Scaler => {
                    let n = ctx
                        .session
                        .delete_instances(&obj.object_id, &self.node_id)
                        .await?;
                    if n > 0 {
                        debug!(object = %name, count = n, "scaler instance rows removed");
                        ctx.changes.mark("svcmon");
                    }
                }
                Expansion::Single(merged) => {
                    let pending =
                        write_instance(ctx, &self.node_id, obj, &inst, merged, &mut self.kept)
                            .await?;
                    self.pending_resources.push(pending);
                    self.counts.instances += 1;
                }
                Expansion::Encap {
                    host_resources,
                    containers,
                } => {
                    self.pending_resources.push(PendingResources {
                        object_id: obj.object_id.clone(),
                        vmname: String::new(),
                        resources: host_resources,
                    });
                    for merged in containers {
                        let pending =
                            write_instance(ctx, &self.node_id, obj, &inst, merged, &mut self.kept)
                                .await?;
                        self.pending_resources.push(pending);
                        self.counts.instances += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_resources(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        for pending in std::mem::take(&mut self.pending_resources) {
            let mut rids = Vec::with_capacity(pending.resources.len());
            for res in &pending.resources {
                ctx.session
                    .upsert_resource(&ResourceRow {
                        object_id: pending.object_id.clone(),
                        node_id: self.node_id.clone(),
                        vmname: pending.vmname.clone(),
                        rid: res.rid.clone(),
                        status: res.status,
                        kind: res.kind.clone(),
                        desc: res.desc.clone(),
                        log: res.log.clone(),
                        monitor: res.monitor,
                        disable: res.disable,
                        optional: res.optional,
                        updated: ctx.now,
                    })
                    .await?;
                translog::record(
                    ctx.session,
                    &translog::RESOURCE_STATUS,
                    &[
                        pending.object_id.clone(),
                        self.node_id.clone(),
                        pending.vmname.clone(),
                        res.rid.clone(),
                    ],
                    &[Field::from(res.status.as_str()), Field::from(res.log.as_str())],
                    ctx.now,
                    ctx.changes,
                )
                .await?;
                rids.push(res.rid.clone());
            }
            let removed = ctx
                .session
                .delete_stale_resources(&pending.object_id, &self.node_id, &pending.vmname, &rids)
                .await?;
            if removed > 0 || !rids.is_empty() {
                ctx.changes.mark("resmon");
            }
            self.counts.resources += rids.len();
        }
        Ok(())
    }

    async fn update_heartbeats(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let snapshot = normalized(&self.snapshot)?;
        let peers: HashMap<String, String> = ctx
            .session
            .cluster_nodes(&self.cluster_id)
            .await?
            .into_iter()
            .map(|n| (n.nodename, n.node_id))
            .collect();
        for hb in snapshot.heartbeats()? {
            let Some(peer_id) = peers.get(&hb.peer) else {
                debug!(peer = %hb.peer, stream = %hb.stream, "heartbeat peer not registered");
                continue;
            };
            ctx.session
                .upsert_heartbeat(&HeartbeatRow {
                    node_id: self.node_id.clone(),
                    peer_node_id: peer_id.clone(),
                    hb_id: hb.stream.clone(),
                    driver: hb.driver.clone(),
                    state: hb.state.clone(),
                    beating: hb.beating,
                    desc: hb.desc.clone(),
                    updated: ctx.now,
                })
                .await?;
            translog::record(
                ctx.session,
                &translog::HEARTBEAT_STATE,
                &[self.node_id.clone(), peer_id.clone(), hb.stream.clone()],
                &[Field::from(hb.state.as_str()), Field::Int(hb.beating)],
                ctx.now,
                ctx.changes,
            )
            .await?;
            ctx.changes.mark("hbmon");
            self.counts.heartbeats += 1;
        }
        Ok(())
    }

    async fn update_dashboard(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let severities = &ctx.deps.config.alerts;
        for obj in self.objects.values() {
            alerts::refresh_object_alerts(ctx.session, obj, severities, ctx.now, ctx.changes)
                .await
                .with_context(|| format!("alerts of object {}", obj.name))?;
            if !self.local_objects.contains(&obj.object_id) {
                continue;
            }
            let count = ctx
                .session
                .action_error_count(&obj.object_id, &self.node_id)
                .await?;
            alerts::update_dashboard_instance(
                ctx.session,
                obj,
                &self.node_id,
                count == 0,
                &ActionErrors { count },
                severities,
                ctx.now,
                ctx.changes,
            )
            .await?;
        }
        Ok(())
    }
}

/// Copy the deployment settings an instance declares onto its object.
fn apply_instance_settings(row: &mut ObjectRow, inst: &InstanceStatus) {
    if let Some(env) = inst.env.as_deref().filter(|e| !e.is_empty()) {
        row.env = env.to_string();
    }
    if row.app.is_empty() {
        if let Some(app) = inst.app.as_deref() {
            row.app = app.to_string();
        }
    }
    row.topology = inst.topology.clone();
    row.flex_min = inst.flex_min;
    row.flex_max = inst.flex_max;
}

async fn write_instance(
    ctx: &mut JobContext<'_>,
    node_id: &str,
    obj: &ObjectRow,
    inst: &InstanceStatus,
    merged: MergedInstance,
    kept: &mut Vec<InstanceKey>,
) -> Result<PendingResources> {
    ctx.session
        .upsert_instance(&InstanceRow {
            object_id: obj.object_id.clone(),
            node_id: node_id.to_string(),
            vmname: merged.vmname.clone(),
            status: merged.status,
            frozen: i32::from(merged.frozen),
            monitor_status: merged.monitor.status.clone(),
            global_expect: merged.monitor.global_expect.clone(),
            topology: inst.topology.clone(),
            updated: ctx.now,
        })
        .await?;
    translog::record(
        ctx.session,
        &translog::INSTANCE_STATUS,
        &[obj.object_id.clone(), node_id.to_string(), merged.vmname.clone()],
        &merged.status.fields(),
        ctx.now,
        ctx.changes,
    )
    .await?;
    ctx.changes.mark("svcmon");
    kept.push(InstanceKey {
        object_id: obj.object_id.clone(),
        vmname: merged.vmname.clone(),
    });
    Ok(PendingResources {
        object_id: obj.object_id.clone(),
        vmname: merged.vmname,
        resources: merged.resources,
    })
}
