//! Shared test helpers for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use fleetfeed::config::Config;
use fleetfeed::jobs::{self, Deps, JobOutcome, DAEMON_STATUS};
use fleetfeed::kv::MemoryKv;
use fleetfeed::metrics::Metrics;
use fleetfeed::notify::RecordingNotifier;
use fleetfeed::queue::{self, QueueKeys};
use fleetfeed::store::memory::MemoryStore;
use fleetfeed::store::Node;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

// == In-memory harness =========================================================

/// Base instant of every scenario; [`t`] offsets from it.
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap() + Duration::seconds(secs)
}

/// Memory KV + memory store + recording notifier behind a settable clock.
pub struct Harness {
    pub kv: MemoryKv,
    pub store: MemoryStore,
    pub notifier: Arc<RecordingNotifier>,
    pub deps: Deps,
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let kv = MemoryKv::new();
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let now = Arc::new(Mutex::new(t(0)));
        let clock_now = now.clone();
        let deps = Deps::new(
            Arc::new(kv.clone()),
            Arc::new(store.clone()),
            notifier.clone(),
            Arc::new(Metrics::new()),
            config,
        )
        .with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        Self {
            kv,
            store,
            notifier,
            deps,
            now,
        }
    }

    pub fn set_time(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn register_node(&self, node_id: &str, nodename: &str, cluster_id: &str) {
        self.store.insert_node(Node {
            node_id: node_id.to_string(),
            nodename: nodename.to_string(),
            cluster_id: cluster_id.to_string(),
            frozen: false,
        });
    }

    pub async fn post(&self, kind: &str, work_key: &str, payload: &Value, changes: &[&str]) -> bool {
        let changes: Vec<String> = changes.iter().map(|c| c.to_string()).collect();
        queue::post(
            &self.kv,
            &QueueKeys::for_kind(kind),
            work_key,
            payload.to_string().as_bytes(),
            &changes,
        )
        .await
        .unwrap()
    }

    /// Post a status snapshot and process it at `at`.
    pub async fn apply_status(&self, node_id: &str, payload: &Value, at: DateTime<Utc>) -> JobOutcome {
        self.set_time(at);
        self.post(DAEMON_STATUS, node_id, payload, &[]).await;
        jobs::dispatch(DAEMON_STATUS, node_id, &self.deps)
            .await
            .unwrap()
    }

    pub fn object_id(&self, name: &str) -> String {
        self.store
            .objects()
            .into_iter()
            .find(|o| o.name == name)
            .map(|o| o.object_id)
            .unwrap_or_else(|| panic!("object {} not found", name))
    }
}

// == Payload builders ==========================================================

pub fn v2_status(nodes: Value, services: Value) -> Value {
    json!({
        "version": "2.1",
        "data": {
            "cluster": {"id": "c1", "name": "prod"},
            "nodes": nodes,
            "services": services
        }
    })
}

/// A v2 instance with one filesystem resource, all dimensions at `avail`.
pub fn v2_instance(avail: &str, env: &str) -> Value {
    json!({
        "avail": avail,
        "overall": avail,
        "env": env,
        "status_group": {"fs": avail},
        "resources": {"fs#1": {"status": avail, "type": "fs.ext4", "label": "/srv"}}
    })
}

pub fn v2_object(avail: &str) -> Value {
    json!({"avail": avail, "overall": avail, "placement": "optimal", "frozen": "thawed"})
}

// == Database ==================================================================

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Apply `sql/schema.sql` once per test binary. Every statement is
/// `IF NOT EXISTS`, so reruns against a live database are harmless.
pub async fn ensure_schema() {
    SCHEMA_INIT
        .get_or_init(|| async {
            let pool = sqlx::PgPool::connect(&test_db_url()).await.unwrap();
            let sql = std::fs::read_to_string("sql/schema.sql").unwrap();
            sqlx::raw_sql(&sql)
                .execute(&pool)
                .await
                .unwrap_or_else(|e| panic!("schema failed: {}", e));
            pool.close().await;
        })
        .await;
}

/// Unique suffix so parallel tests never share rows.
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
