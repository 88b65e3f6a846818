//! # System Job — Node Inventory
//!
//! Consumes the `system` queue: the work key is a node id, the payload a
//! JSON document of hardware and OS facts ([`NodeInventory`]). Unknown keys
//! are ignored and missing ones default to empty.

use super::{fetch_payload, Job, JobContext, Operation, SYSTEM};
use crate::queue::QueueKeys;
use crate::store::NodeInventory;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub enum Step {
    FetchPayload,
    Decode,
    UpdateNode,
}

pub struct SystemJob {
    keys: QueueKeys,
    node_id: String,
    payload: Option<Vec<u8>>,
    inventory: Option<NodeInventory>,
    updated: bool,
}

impl SystemJob {
    pub fn new(node_id: &str) -> Self {
        Self {
            keys: QueueKeys::for_kind(SYSTEM),
            node_id: node_id.to_string(),
            payload: None,
            inventory: None,
            updated: false,
        }
    }
}

#[async_trait]
impl Job for SystemJob {
    type Step = Step;

    fn name(&self) -> &'static str {
        SYSTEM
    }

    fn work_key(&self) -> &str {
        &self.node_id
    }

    fn operations(&self) -> Vec<Operation<Self>> {
        vec![
            Operation::blocking("fetch payload", Step::FetchPayload),
            Operation::blocking("decode", Step::Decode),
            Operation::blocking("update node", Step::UpdateNode),
        ]
    }

    async fn execute(&mut self, step: Step, ctx: &mut JobContext<'_>) -> Result<()> {
        match step {
            Step::FetchPayload => {
                self.payload = fetch_payload(ctx, &self.keys, &self.node_id).await?;
                Ok(())
            }
            Step::Decode => {
                let raw = self.payload.take().context("no payload to decode")?;
                let inventory: NodeInventory =
                    serde_json::from_slice(&raw).context("decoding node inventory")?;
                self.inventory = Some(inventory);
                Ok(())
            }
            Step::UpdateNode => {
                let inventory = self.inventory.as_ref().context("inventory not decoded")?;
                if ctx.session.node(&self.node_id).await?.is_none() {
                    debug!(node_id = %self.node_id, "node not registered, skipping");
                    ctx.stop();
                    return Ok(());
                }
                ctx.session
                    .update_node_inventory(&self.node_id, inventory, ctx.now)
                    .await?;
                ctx.changes.mark("nodes");
                self.updated = true;
                Ok(())
            }
        }
    }

    fn log_result(&self) {
        if let Some(inv) = self.inventory.as_ref().filter(|_| self.updated) {
            info!(os = %inv.os_name, release = %inv.os_release, agent = %inv.agent_version, "node inventory updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::{dispatch, Deps, JobOutcome};
    use crate::kv::MemoryKv;
    use crate::metrics::Metrics;
    use crate::notify::RecordingNotifier;
    use crate::queue;
    use crate::store::memory::MemoryStore;
    use crate::store::Node;
    use std::sync::Arc;

    fn setup() -> (MemoryKv, MemoryStore, Arc<RecordingNotifier>, Deps) {
        let kv = MemoryKv::new();
        let store = MemoryStore::new();
        store.insert_node(Node {
            node_id: "nid1".into(),
            nodename: "n1".into(),
            cluster_id: "c1".into(),
            frozen: false,
        });
        let notifier = Arc::new(RecordingNotifier::new());
        let deps = Deps::new(
            Arc::new(kv.clone()),
            Arc::new(store.clone()),
            notifier.clone(),
            Arc::new(Metrics::new()),
            Config::default(),
        );
        (kv, store, notifier, deps)
    }

    #[tokio::test]
    async fn inventory_is_stored() {
        let (kv, store, notifier, deps) = setup();
        let keys = QueueKeys::for_kind(SYSTEM);
        let payload = br#"{"os_name": "Linux", "cpu_threads": 16, "agent_version": "3.0.1", "extra": 1}"#;
        queue::post(&kv, &keys, "nid1", payload, &[]).await.unwrap();

        let outcome = dispatch(SYSTEM, "nid1", &deps).await.unwrap();
        assert_eq!(outcome, JobOutcome::Committed);
        let inv = store.inventory("nid1").unwrap();
        assert_eq!(inv.os_name, "Linux");
        assert_eq!(inv.cpu_threads, 16);
        assert_eq!(inv.os_release, "");
        assert_eq!(notifier.events(), vec!["nodes"]);
    }

    #[tokio::test]
    async fn unregistered_node_is_skipped() {
        let (kv, store, notifier, deps) = setup();
        let keys = QueueKeys::for_kind(SYSTEM);
        queue::post(&kv, &keys, "ghost", b"{}", &[]).await.unwrap();

        let outcome = dispatch(SYSTEM, "ghost", &deps).await.unwrap();
        assert_eq!(outcome, JobOutcome::Stopped);
        assert!(store.inventory("ghost").is_none());
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn invalid_json_fails_the_job() {
        let (kv, _store, _notifier, deps) = setup();
        let keys = QueueKeys::for_kind(SYSTEM);
        queue::post(&kv, &keys, "nid1", b"not json", &[]).await.unwrap();

        let err = dispatch(SYSTEM, "nid1", &deps).await.unwrap_err();
        assert!(format!("{:#}", err).contains("decoding node inventory"));
    }

    #[tokio::test]
    async fn missing_payload_stops() {
        let (_kv, _store, _notifier, deps) = setup();
        let outcome = dispatch(SYSTEM, "nid1", &deps).await.unwrap();
        assert_eq!(outcome, JobOutcome::Stopped);
    }
}
