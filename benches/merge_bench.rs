use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fleetfeed::merge;
use fleetfeed::status::{ClusterStatus, Snapshot, Status};
use serde_json::{json, Map, Value};

const NODES: usize = 4;
const OBJECTS: usize = 200;

fn v2_payload() -> Vec<u8> {
    let mut nodes = Map::new();
    for n in 0..NODES {
        let mut status = Map::new();
        for o in 0..OBJECTS {
            let mut inst = json!({
                "avail": "up",
                "overall": "warn",
                "status_group": {"ip": "up", "fs": "up", "app": "warn"},
                "resources": {
                    "ip#1": {"status": "up", "type": "ip"},
                    "fs#1": {"status": "up", "type": "fs.ext4"},
                    "app#1": {"status": "warn", "type": "app.simple", "log": "slow"}
                }
            });
            if o % 10 == 0 {
                inst["encap"] = json!({
                    "container#1": {"hostname": format!("vm{}a", o), "avail": "up", "frozen": 0},
                    "container#2": {"hostname": format!("vm{}b", o), "avail": "down", "frozen": 1}
                });
            }
            status.insert(format!("svc{}", o), inst);
        }
        nodes.insert(
            format!("n{}", n),
            json!({"frozen": 0, "services": {"status": status}}),
        );
    }
    let services: Map<String, Value> = (0..OBJECTS)
        .map(|o| (format!("svc{}", o), json!({"avail": "up", "overall": "warn"})))
        .collect();
    serde_json::to_vec(&json!({
        "version": "2.1",
        "data": {"cluster": {"id": "c1", "name": "bench"}, "nodes": nodes, "services": services}
    }))
    .unwrap()
}

fn v3_payload() -> Vec<u8> {
    let mut nodes = Map::new();
    for n in 0..NODES {
        let instances: Map<String, Value> = (0..OBJECTS)
            .map(|o| {
                let inst = json!({
                    "status": {
                        "avail": "up",
                        "overall": "up",
                        "resources": {"fs#1": {"status": "up", "type": "fs.ext4"}}
                    },
                    "monitor": {"state": "idle", "global_expect": "none"},
                    "config": {"topology": "failover"}
                });
                (format!("svc{}", o), inst)
            })
            .collect();
        nodes.insert(
            format!("n{}", n),
            json!({"status": {"frozen_at": "0001-01-01T00:00:00Z"}, "instance": instances}),
        );
    }
    serde_json::to_vec(&json!({
        "version": "3.0",
        "data": {"cluster": {"config": {"id": "c3", "name": "bench"}, "node": nodes, "object": {}}}
    }))
    .unwrap()
}

fn bench_decode_v2(c: &mut Criterion) {
    let raw = v2_payload();
    c.bench_function("Snapshot::from_slice(v2, 4x200)", |b| {
        b.iter(|| Snapshot::from_slice(black_box(&raw)).unwrap());
    });
}

fn bench_decode_v3(c: &mut Criterion) {
    let raw = v3_payload();
    c.bench_function("Snapshot::from_slice(v3, 4x200)", |b| {
        b.iter(|| Snapshot::from_slice(black_box(&raw)).unwrap());
    });
}

fn bench_expand_all(c: &mut Criterion) {
    let snapshot = Snapshot::from_slice(&v2_payload()).unwrap();
    let instances: Vec<_> = snapshot
        .object_names()
        .iter()
        .filter_map(|o| snapshot.instance_status(o, "n0").unwrap())
        .collect();
    c.bench_function("merge::expand(200 instances)", |b| {
        b.iter(|| {
            for inst in &instances {
                black_box(merge::expand(black_box(inst)));
            }
        });
    });
}

fn bench_merge_table(c: &mut Criterion) {
    c.bench_function("merge::merge(all pairs)", |b| {
        b.iter(|| {
            for hv in Status::ALL {
                for c in Status::ALL {
                    black_box(merge::merge(black_box(hv), Some(black_box(c))));
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_decode_v2,
    bench_decode_v3,
    bench_expand_all,
    bench_merge_table
);
criterion_main!(benches);
