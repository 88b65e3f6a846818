//! In-memory [`Store`] used by tests and dry runs.
//!
//! Transactional sessions work on a private copy of every table, swapped in
//! on commit. Concurrent transactional sessions are last-commit-wins for the
//! whole table set, which is fine for serial test scenarios but not a
//! substitute for Postgres under a multi-runner pool.

use super::{
    AlertRow, HeartbeatRow, InstanceKey, InstanceRow, Node, NodeInventory, ObjectRow, ResourceRow,
    Session, Store,
};
use crate::status::Status;
use crate::translog::{Field, LastRow, TransitionTable};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// One closed interval of a transition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub table: &'static str,
    pub key: Vec<String>,
    pub values: Vec<Field>,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

type Key3 = (String, String, String);

#[derive(Debug, Clone, Default)]
struct Tables {
    nodes: BTreeMap<String, Node>,
    inventories: BTreeMap<String, NodeInventory>,
    objects: BTreeMap<String, ObjectRow>,
    tags: BTreeSet<(String, String)>,
    instances: BTreeMap<Key3, InstanceRow>,
    resources: BTreeMap<(String, String, String, String), ResourceRow>,
    heartbeats: BTreeMap<Key3, HeartbeatRow>,
    alerts: BTreeMap<Key3, AlertRow>,
    acks: Vec<(String, DateTime<Utc>, DateTime<Utc>)>,
    action_errors: BTreeMap<(String, String), i64>,
    last: BTreeMap<(&'static str, Vec<String>), LastRow>,
    history: Vec<HistoryRow>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&lock(&self.tables))
    }

    // ── Seeding ─────────────────────────────────────────────────

    pub fn insert_node(&self, node: Node) {
        lock(&self.tables).nodes.insert(node.node_id.clone(), node);
    }

    pub fn insert_object(&self, row: ObjectRow) {
        lock(&self.tables).objects.insert(row.object_id.clone(), row);
    }

    pub fn add_tag(&self, object_id: &str, tag: &str) {
        lock(&self.tables)
            .tags
            .insert((object_id.to_string(), tag.to_string()));
    }

    pub fn add_ack_window(&self, object_id: &str, begin: DateTime<Utc>, end: DateTime<Utc>) {
        lock(&self.tables)
            .acks
            .push((object_id.to_string(), begin, end));
    }

    pub fn set_action_errors(&self, object_id: &str, node_id: &str, count: i64) {
        lock(&self.tables)
            .action_errors
            .insert((object_id.to_string(), node_id.to_string()), count);
    }

    // ── Inspection ──────────────────────────────────────────────

    pub fn nodes(&self) -> Vec<Node> {
        self.read(|t| t.nodes.values().cloned().collect())
    }

    pub fn inventory(&self, node_id: &str) -> Option<NodeInventory> {
        self.read(|t| t.inventories.get(node_id).cloned())
    }

    pub fn objects(&self) -> Vec<ObjectRow> {
        self.read(|t| t.objects.values().cloned().collect())
    }

    pub fn instances(&self) -> Vec<InstanceRow> {
        self.read(|t| t.instances.values().cloned().collect())
    }

    pub fn resources(&self) -> Vec<ResourceRow> {
        self.read(|t| t.resources.values().cloned().collect())
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRow> {
        self.read(|t| t.heartbeats.values().cloned().collect())
    }

    pub fn alerts(&self) -> Vec<AlertRow> {
        self.read(|t| t.alerts.values().cloned().collect())
    }

    pub fn history(&self, table: &TransitionTable) -> Vec<HistoryRow> {
        self.read(|t| {
            t.history
                .iter()
                .filter(|h| h.table == table.history)
                .cloned()
                .collect()
        })
    }

    pub fn last(&self, table: &TransitionTable) -> Vec<(Vec<String>, LastRow)> {
        self.read(|t| {
            t.last
                .iter()
                .filter(|((name, _), _)| *name == table.last)
                .map(|((_, key), row)| (key.clone(), row.clone()))
                .collect()
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn session(&self, with_tx: bool) -> Result<Box<dyn Session>> {
        let tx = with_tx.then(|| lock(&self.tables).clone());
        Ok(Box::new(MemorySession {
            tables: self.tables.clone(),
            tx,
        }))
    }
}

pub struct MemorySession {
    tables: Arc<Mutex<Tables>>,
    tx: Option<Tables>,
}

impl MemorySession {
    fn with<R>(&mut self, f: impl FnOnce(&mut Tables) -> R) -> R {
        match self.tx.as_mut() {
            Some(copy) => f(copy),
            None => f(&mut lock(&self.tables)),
        }
    }
}

fn key3(a: &str, b: &str, c: &str) -> Key3 {
    (a.to_string(), b.to_string(), c.to_string())
}

#[async_trait]
impl Session for MemorySession {
    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(copy) = self.tx {
            *lock(&self.tables) = copy;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn log_last(&mut self, table: &TransitionTable, key: &[String]) -> Result<Option<LastRow>> {
        Ok(self.with(|t| t.last.get(&(table.last, key.to_vec())).cloned()))
    }

    async fn insert_log(
        &mut self,
        table: &TransitionTable,
        key: &[String],
        values: &[Field],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.with(|t| {
            t.history.push(HistoryRow {
                table: table.history,
                key: key.to_vec(),
                values: values.to_vec(),
                begin,
                end,
            })
        });
        Ok(())
    }

    async fn put_log_last(
        &mut self,
        table: &TransitionTable,
        key: &[String],
        values: &[Field],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.with(|t| {
            t.last.insert(
                (table.last, key.to_vec()),
                LastRow {
                    values: values.to_vec(),
                    begin,
                    end,
                },
            )
        });
        Ok(())
    }

    async fn extend_log_last(&mut self, table: &TransitionTable, key: &[String], end: DateTime<Utc>) -> Result<()> {
        self.with(|t| {
            if let Some(row) = t.last.get_mut(&(table.last, key.to_vec())) {
                row.end = row.end.max(end);
            }
        });
        Ok(())
    }

    async fn node(&mut self, node_id: &str) -> Result<Option<Node>> {
        Ok(self.with(|t| t.nodes.get(node_id).cloned()))
    }

    async fn cluster_nodes(&mut self, cluster_id: &str) -> Result<Vec<Node>> {
        Ok(self.with(|t| {
            t.nodes
                .values()
                .filter(|n| n.cluster_id == cluster_id)
                .cloned()
                .collect()
        }))
    }

    async fn set_node_frozen(&mut self, node_id: &str, frozen: bool) -> Result<bool> {
        self.with(|t| {
            let node = t
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| anyhow!("node {} not found", node_id))?;
            let changed = node.frozen != frozen;
            node.frozen = frozen;
            Ok(changed)
        })
    }

    async fn update_node_inventory(&mut self, node_id: &str, inventory: &NodeInventory, _now: DateTime<Utc>) -> Result<()> {
        self.with(|t| {
            if !t.nodes.contains_key(node_id) {
                return Err(anyhow!("node {} not found", node_id));
            }
            t.inventories.insert(node_id.to_string(), inventory.clone());
            Ok(())
        })
    }

    async fn node_instance_count(&mut self, node_id: &str) -> Result<i64> {
        Ok(self.with(|t| t.instances.values().filter(|i| i.node_id == node_id).count() as i64))
    }

    async fn find_object(&mut self, name: &str, cluster_id: &str) -> Result<Option<ObjectRow>> {
        Ok(self.with(|t| {
            t.objects
                .values()
                .find(|o| o.name == name && o.cluster_id == cluster_id)
                .cloned()
        }))
    }

    async fn find_or_create_object(
        &mut self,
        name: &str,
        cluster_id: &str,
        app: &str,
        now: DateTime<Utc>,
    ) -> Result<(ObjectRow, bool)> {
        // Check and insert under the same lock.
        Ok(self.with(|t| {
            if let Some(row) = t
                .objects
                .values()
                .find(|o| o.name == name && o.cluster_id == cluster_id)
            {
                return (row.clone(), false);
            }
            let row = ObjectRow::new(uuid::Uuid::new_v4().to_string(), name, cluster_id, app, now);
            t.objects.insert(row.object_id.clone(), row.clone());
            (row, true)
        }))
    }

    async fn update_object_status(&mut self, row: &ObjectRow) -> Result<()> {
        self.with(|t| t.objects.insert(row.object_id.clone(), row.clone()));
        Ok(())
    }

    async fn object_has_tag(&mut self, object_id: &str, tag: &str) -> Result<bool> {
        Ok(self.with(|t| t.tags.contains(&(object_id.to_string(), tag.to_string()))))
    }

    async fn upsert_instance(&mut self, row: &InstanceRow) -> Result<()> {
        self.with(|t| {
            t.instances
                .insert(key3(&row.object_id, &row.node_id, &row.vmname), row.clone())
        });
        Ok(())
    }

    async fn delete_instances(&mut self, object_id: &str, node_id: &str) -> Result<u64> {
        Ok(self.with(|t| {
            let before = t.instances.len();
            t.instances
                .retain(|_, i| !(i.object_id == object_id && i.node_id == node_id));
            t.resources
                .retain(|_, r| !(r.object_id == object_id && r.node_id == node_id));
            (before - t.instances.len()) as u64
        }))
    }

    async fn delete_stale_instances(&mut self, node_id: &str, keep: &[InstanceKey]) -> Result<u64> {
        let keep: BTreeSet<&InstanceKey> = keep.iter().collect();
        Ok(self.with(|t| {
            let before = t.instances.len();
            let kept = |object_id: &str, vmname: &str| {
                keep.contains(&InstanceKey {
                    object_id: object_id.to_string(),
                    vmname: vmname.to_string(),
                })
            };
            t.instances
                .retain(|_, i| i.node_id != node_id || kept(&i.object_id, &i.vmname));
            t.resources
                .retain(|_, r| r.node_id != node_id || kept(&r.object_id, &r.vmname));
            t.alerts.retain(|_, a| {
                a.node_id != node_id || keep.iter().any(|k| k.object_id == a.object_id)
            });
            (before - t.instances.len()) as u64
        }))
    }

    async fn upsert_resource(&mut self, row: &ResourceRow) -> Result<()> {
        self.with(|t| {
            t.resources.insert(
                (
                    row.object_id.clone(),
                    row.node_id.clone(),
                    row.vmname.clone(),
                    row.rid.clone(),
                ),
                row.clone(),
            )
        });
        Ok(())
    }

    async fn delete_stale_resources(
        &mut self,
        object_id: &str,
        node_id: &str,
        vmname: &str,
        keep_rids: &[String],
    ) -> Result<u64> {
        Ok(self.with(|t| {
            let before = t.resources.len();
            t.resources.retain(|_, r| {
                !(r.object_id == object_id && r.node_id == node_id && r.vmname == vmname)
                    || keep_rids.contains(&r.rid)
            });
            (before - t.resources.len()) as u64
        }))
    }

    async fn upsert_heartbeat(&mut self, row: &HeartbeatRow) -> Result<()> {
        self.with(|t| {
            t.heartbeats
                .insert(key3(&row.node_id, &row.peer_node_id, &row.hb_id), row.clone())
        });
        Ok(())
    }

    async fn upsert_alert(&mut self, row: &AlertRow) -> Result<()> {
        self.with(|t| {
            let key = key3(&row.object_id, &row.node_id, &row.alert_type);
            let created = t.alerts.get(&key).map(|a| a.created).unwrap_or(row.created);
            let mut row = row.clone();
            row.created = created;
            t.alerts.insert(key, row);
        });
        Ok(())
    }

    async fn delete_alert(&mut self, object_id: &str, node_id: &str, alert_type: &str) -> Result<u64> {
        Ok(self.with(|t| {
            t.alerts
                .remove(&key3(object_id, node_id, alert_type))
                .map(|_| 1)
                .unwrap_or(0)
        }))
    }

    async fn upsert_flex_alert_if_violated(&mut self, row: &AlertRow, min: i64, max: i64) -> Result<bool> {
        let n = self.with(|t| {
            t.instances
                .values()
                .filter(|i| i.object_id == row.object_id && i.status.avail == Status::Up)
                .count() as i64
        });
        if !(n < min || (max > 0 && n > max)) {
            return Ok(false);
        }
        let mut row = row.clone();
        if let Some(dict) = row.dict.as_object_mut() {
            dict.insert("n".into(), json!(n));
            dict.insert("smin".into(), json!(min));
            dict.insert("smax".into(), json!(max));
        }
        self.upsert_alert(&row).await?;
        Ok(true)
    }

    async fn unavailability_acked(&mut self, object_id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.with(|t| {
            t.acks
                .iter()
                .any(|(id, begin, end)| id == object_id && *begin <= now && now <= *end)
        }))
    }

    async fn action_error_count(&mut self, object_id: &str, node_id: &str) -> Result<i64> {
        Ok(self.with(|t| {
            t.action_errors
                .get(&(object_id.to_string(), node_id.to_string()))
                .copied()
                .unwrap_or(0)
        }))
    }
}
