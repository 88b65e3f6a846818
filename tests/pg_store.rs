//! PostgreSQL store integration tests.
//!
//! Exercises `PgStore` sessions against a real database: transition-log
//! writes, transaction rollback, node flags, object creation, and the SQL
//! that has no in-memory equivalent (stale purges, alert upserts, the flex
//! threshold statement, acknowledgement windows).
//!
//! # Prerequisites
//!
//! - A running PostgreSQL instance.
//! - `TEST_DATABASE_URL` pointing at a disposable database. The schema in
//!   `sql/schema.sql` is applied on first use.
//!
//! Every test skips when `TEST_DATABASE_URL` is unset. Row ids carry a
//! random suffix, so tests share the database without cleanup.
//!
//! # How to run
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://localhost/fleetfeed_test cargo test --test pg_store
//! ```

mod common;

use common::{t, unique};
use fleetfeed::notify::ChangeSet;
use fleetfeed::store::postgres::PgStore;
use fleetfeed::status::Status;
use fleetfeed::store::{AlertRow, InstanceKey, ResourceRow, Session, Store};
use fleetfeed::translog::{self, Field, Transition, NODE_FROZEN, OBJECT_AVAIL};

macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn store() -> PgStore {
    common::ensure_schema().await;
    PgStore::connect(&common::test_db_url(), 5).await.unwrap()
}

async fn insert_node(store: &PgStore, node_id: &str, nodename: &str, cluster_id: &str) {
    sqlx::query("INSERT INTO nodes (node_id, nodename, cluster_id) VALUES ($1, $2, $3)")
        .bind(node_id)
        .bind(nodename)
        .bind(cluster_id)
        .execute(store.pool())
        .await
        .unwrap();
}

async fn insert_instance(store: &PgStore, svc_id: &str, node_id: &str, vmname: &str, avail: &str) {
    sqlx::query(
        "INSERT INTO svcmon (svc_id, node_id, mon_vmname, mon_availstatus, mon_overallstatus,
           mon_ipstatus, mon_diskstatus, mon_fsstatus, mon_sharestatus, mon_containerstatus,
           mon_appstatus, mon_syncstatus, mon_updated)
         VALUES ($1, $2, $3, $4, $4, 'n/a', 'n/a', 'n/a', 'n/a', 'n/a', 'n/a', 'n/a', $5)",
    )
    .bind(svc_id)
    .bind(node_id)
    .bind(vmname)
    .bind(avail)
    .bind(t(0))
    .execute(store.pool())
    .await
    .unwrap();
}

fn resource(svc_id: &str, node_id: &str, vmname: &str, rid: &str) -> ResourceRow {
    ResourceRow {
        object_id: svc_id.to_string(),
        node_id: node_id.to_string(),
        vmname: vmname.to_string(),
        rid: rid.to_string(),
        status: Status::Up,
        kind: "fs".into(),
        desc: String::new(),
        log: String::new(),
        monitor: false,
        disable: false,
        optional: false,
        updated: t(0),
    }
}

fn alert(svc_id: &str, node_id: &str, alert_type: &str, at: chrono::DateTime<chrono::Utc>) -> AlertRow {
    AlertRow {
        object_id: svc_id.to_string(),
        node_id: node_id.to_string(),
        alert_type: alert_type.to_string(),
        fmt: "%(s)s".into(),
        dict: serde_json::json!({"s": "down"}),
        severity: 3,
        env: "PRD".into(),
        created: at,
        updated: at,
    }
}

async fn count(store: &PgStore, sql: &str, key: &str) -> i64 {
    sqlx::query_scalar(sql)
        .bind(key)
        .fetch_one(store.pool())
        .await
        .unwrap()
}

// == Connectivity ==============================================================

#[tokio::test]
async fn ping_succeeds() {
    require_db!();
    store().await.ping().await.unwrap();
}

// == Transition log ============================================================

#[tokio::test]
async fn translog_closes_interval_on_change() {
    require_db!();
    let store = store().await;
    let key = vec![unique("svc")];
    let mut changes = ChangeSet::default();

    let mut s = store.session(true).await.unwrap();
    let first = translog::record(s.as_mut(), &OBJECT_AVAIL, &key, &[Field::from("up")], t(0), &mut changes)
        .await
        .unwrap();
    let second = translog::record(s.as_mut(), &OBJECT_AVAIL, &key, &[Field::from("up")], t(30), &mut changes)
        .await
        .unwrap();
    let third = translog::record(s.as_mut(), &OBJECT_AVAIL, &key, &[Field::from("down")], t(60), &mut changes)
        .await
        .unwrap();
    s.commit().await.unwrap();
    assert_eq!(first, Transition::Opened);
    assert_eq!(second, Transition::Extended);
    assert_eq!(third, Transition::Appended);

    let mut s = store.session(false).await.unwrap();
    let last = s.log_last(&OBJECT_AVAIL, &key).await.unwrap().unwrap();
    assert_eq!(last.values, vec![Field::from("down")]);
    assert_eq!(last.begin, t(60));

    let closed: Vec<(String, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> =
        sqlx::query_as(
            r#"SELECT svc_availstatus, "begin", "end" FROM services_log WHERE svc_id = $1"#,
        )
        .bind(&key[0])
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(closed, vec![("up".to_string(), t(0), t(60))]);
}

#[tokio::test]
async fn rollback_discards_log_writes() {
    require_db!();
    let store = store().await;
    let key = vec![unique("node")];
    let mut changes = ChangeSet::default();

    let mut s = store.session(true).await.unwrap();
    translog::record(s.as_mut(), &NODE_FROZEN, &key, &[Field::Int(1)], t(0), &mut changes)
        .await
        .unwrap();
    s.rollback().await.unwrap();

    let mut s = store.session(false).await.unwrap();
    assert!(s.log_last(&NODE_FROZEN, &key).await.unwrap().is_none());
}

// == Nodes and objects =========================================================

#[tokio::test]
async fn set_node_frozen_reports_changes_only() {
    require_db!();
    let store = store().await;
    let node_id = unique("nid");
    insert_node(&store, &node_id, "n1", &unique("cluster")).await;

    let mut s = store.session(false).await.unwrap();
    assert!(!s.set_node_frozen(&node_id, false).await.unwrap());
    assert!(s.set_node_frozen(&node_id, true).await.unwrap());
    assert!(s.node(&node_id).await.unwrap().unwrap().frozen);
}

#[tokio::test]
async fn find_or_create_object_is_idempotent() {
    require_db!();
    let store = store().await;
    let name = unique("app");
    let cluster = unique("cluster");

    let mut s = store.session(true).await.unwrap();
    let (a, created) = s.find_or_create_object(&name, &cluster, "web", t(0)).await.unwrap();
    assert!(created);
    let (b, created) = s.find_or_create_object(&name, &cluster, "web", t(10)).await.unwrap();
    assert!(!created);
    s.commit().await.unwrap();
    assert_eq!(a.object_id, b.object_id);

    let mut s = store.session(false).await.unwrap();
    let found = s.find_object(&name, &cluster).await.unwrap().unwrap();
    assert_eq!(found.object_id, a.object_id);
    assert_eq!(found.app, "web");
}

// == Instances and resources ===================================================

#[tokio::test]
async fn stale_purge_keeps_listed_instances_only() {
    require_db!();
    let store = store().await;
    let node_id = unique("nid");
    let (a, b) = (unique("svc"), unique("svc"));
    insert_instance(&store, &a, &node_id, "", "up").await;
    insert_instance(&store, &a, &node_id, "vm1", "up").await;
    insert_instance(&store, &b, &node_id, "", "up").await;

    let mut s = store.session(true).await.unwrap();
    for (svc, vm) in [(&a, ""), (&a, "vm1"), (&b, "")] {
        s.upsert_resource(&resource(svc, &node_id, vm, "fs#1")).await.unwrap();
    }
    s.upsert_alert(&alert(&a, &node_id, "action errors", t(0))).await.unwrap();
    s.upsert_alert(&alert(&b, &node_id, "action errors", t(0))).await.unwrap();
    s.upsert_alert(&alert(&b, "", "service unavailable", t(0))).await.unwrap();
    let keep = [InstanceKey {
        object_id: a.clone(),
        vmname: String::new(),
    }];
    let removed = s.delete_stale_instances(&node_id, &keep).await.unwrap();
    s.commit().await.unwrap();
    assert_eq!(removed, 2);

    let instances: Vec<(String, String)> =
        sqlx::query_as("SELECT svc_id, mon_vmname FROM svcmon WHERE node_id = $1")
            .bind(&node_id)
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(instances, vec![(a.clone(), String::new())]);

    let resources: Vec<(String, String)> =
        sqlx::query_as("SELECT svc_id, vmname FROM resmon WHERE node_id = $1")
            .bind(&node_id)
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(resources, vec![(a.clone(), String::new())]);

    let node_alerts: Vec<String> = sqlx::query_scalar("SELECT svc_id FROM dashboard WHERE node_id = $1")
        .bind(&node_id)
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(node_alerts, vec![a.clone()]);
    // Object-level alerts are not node-scoped and survive.
    assert_eq!(count(&store, "SELECT COUNT(*) FROM dashboard WHERE svc_id = $1", &b).await, 1);
}

#[tokio::test]
async fn stale_resources_with_empty_keep_list_are_all_removed() {
    require_db!();
    let store = store().await;
    let node_id = unique("nid");
    let svc = unique("svc");

    let mut s = store.session(true).await.unwrap();
    for (vm, rid) in [("", "fs#1"), ("", "ip#1"), ("vm1", "fs#1")] {
        s.upsert_resource(&resource(&svc, &node_id, vm, rid)).await.unwrap();
    }
    let removed = s.delete_stale_resources(&svc, &node_id, "", &[]).await.unwrap();
    s.commit().await.unwrap();
    assert_eq!(removed, 2);

    let left: Vec<(String, String)> = sqlx::query_as("SELECT vmname, rid FROM resmon WHERE svc_id = $1")
        .bind(&svc)
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(left, vec![("vm1".to_string(), "fs#1".to_string())]);
}

// == Dashboard =================================================================

#[tokio::test]
async fn upsert_alert_keeps_creation_time() {
    require_db!();
    let store = store().await;
    let svc = unique("svc");

    let mut s = store.session(false).await.unwrap();
    s.upsert_alert(&alert(&svc, "", "service unavailable", t(0))).await.unwrap();
    let mut again = alert(&svc, "", "service unavailable", t(60));
    again.severity = 4;
    s.upsert_alert(&again).await.unwrap();

    let rows: Vec<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>, i32)> = sqlx::query_as(
        "SELECT dash_created, dash_updated, dash_severity FROM dashboard WHERE svc_id = $1",
    )
    .bind(&svc)
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(rows, vec![(t(0), t(60), 4)]);

    assert_eq!(s.delete_alert(&svc, "", "service unavailable").await.unwrap(), 1);
    assert_eq!(s.delete_alert(&svc, "", "service unavailable").await.unwrap(), 0);
}

#[tokio::test]
async fn flex_alert_written_only_out_of_bounds() {
    require_db!();
    let store = store().await;
    let svc = unique("svc");
    insert_instance(&store, &svc, &unique("nid"), "", "up").await;
    insert_instance(&store, &svc, &unique("nid"), "", "down").await;
    let row = alert(&svc, "", "flex error", t(0));

    let mut s = store.session(false).await.unwrap();
    // One instance up, inside [1, 2].
    assert!(!s.upsert_flex_alert_if_violated(&row, 1, 2).await.unwrap());
    assert_eq!(count(&store, "SELECT COUNT(*) FROM dashboard WHERE svc_id = $1", &svc).await, 0);

    // Below the minimum.
    assert!(s.upsert_flex_alert_if_violated(&row, 2, 0).await.unwrap());
    let dict: serde_json::Value = sqlx::query_scalar("SELECT dash_dict FROM dashboard WHERE svc_id = $1")
        .bind(&svc)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(dict, serde_json::json!({"s": "down", "n": 1, "smin": 2, "smax": 0}));

    // A zero maximum is unbounded.
    insert_instance(&store, &svc, &unique("nid"), "", "up").await;
    insert_instance(&store, &svc, &unique("nid"), "", "up").await;
    assert!(!s.upsert_flex_alert_if_violated(&row, 1, 0).await.unwrap());

    // Above the maximum: the existing row is updated in place.
    let mut later = alert(&svc, "", "flex error", t(60));
    later.severity = 4;
    assert!(s.upsert_flex_alert_if_violated(&later, 1, 2).await.unwrap());
    let rows: Vec<(chrono::DateTime<chrono::Utc>, i32, serde_json::Value)> = sqlx::query_as(
        "SELECT dash_created, dash_severity, dash_dict->'n' FROM dashboard WHERE svc_id = $1",
    )
    .bind(&svc)
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(rows, vec![(t(0), 4, serde_json::json!(3))]);
}

#[tokio::test]
async fn unavailability_ack_window_is_inclusive() {
    require_db!();
    let store = store().await;
    let svc = unique("svc");
    sqlx::query("INSERT INTO svcmon_log_ack (svc_id, mon_begin, mon_end) VALUES ($1, $2, $3)")
        .bind(&svc)
        .bind(t(0))
        .bind(t(100))
        .execute(store.pool())
        .await
        .unwrap();

    let mut s = store.session(false).await.unwrap();
    assert!(s.unavailability_acked(&svc, t(0)).await.unwrap());
    assert!(s.unavailability_acked(&svc, t(100)).await.unwrap());
    assert!(!s.unavailability_acked(&svc, t(101)).await.unwrap());
    assert!(!s.unavailability_acked(&svc, t(-1)).await.unwrap());
    assert!(!s.unavailability_acked(&unique("svc"), t(50)).await.unwrap());
}
