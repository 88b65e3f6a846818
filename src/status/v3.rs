//! Version 3 payloads: everything nested under `data.cluster`, heartbeat
//! streams under `data.daemon`.

use super::parse;
use super::tree::Tree;
use super::{
    ClusterStatus, HeartbeatStatus, InstanceStatus, Monitor, ObjectStatus, Status, StatusResult,
};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct V3Status {
    version: String,
    cluster_id: String,
    cluster_name: String,
    data: Value,
}

impl V3Status {
    pub fn parse(version: String, data: Value) -> StatusResult<V3Status> {
        let root = Tree::root(&data, "data");
        let cluster = root.child("cluster")?;
        let (cluster_id, cluster_name) = match cluster.opt_child("config")? {
            Some(config) => (
                config.opt_string("id")?.unwrap_or_default(),
                config.opt_string("name")?.unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        cluster.child("node")?.map()?;
        if let Some(objects) = cluster.opt_child("object")? {
            objects.map()?;
        }
        Ok(V3Status {
            version,
            cluster_id,
            cluster_name,
            data,
        })
    }

    fn cluster(&self) -> StatusResult<Tree<'_>> {
        Tree::root(&self.data, "data").child("cluster")
    }

    fn node(&self, node: &str) -> StatusResult<Tree<'_>> {
        self.cluster()?.child("node")?.child(node)
    }
}

impl ClusterStatus for V3Status {
    fn version(&self) -> &str {
        &self.version
    }

    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn node_names(&self) -> Vec<String> {
        self.cluster()
            .and_then(|c| c.child("node"))
            .and_then(|n| n.keys())
            .unwrap_or_default()
    }

    fn object_names(&self) -> Vec<String> {
        let declared = self
            .cluster()
            .and_then(|c| c.opt_child("object"))
            .ok()
            .flatten()
            .and_then(|o| o.keys().ok())
            .unwrap_or_default();
        let mut instances = Vec::new();
        for node in self.node_names() {
            let keys = self
                .node(&node)
                .and_then(|n| n.opt_child("instance"))
                .ok()
                .flatten()
                .and_then(|i| i.keys().ok());
            instances.extend(keys.unwrap_or_default());
        }
        super::sorted_union(declared, instances)
    }

    fn node_frozen(&self, node: &str) -> StatusResult<bool> {
        match self.node(node)?.opt_child("status")? {
            Some(status) => parse::frozen_at(&status),
            None => Ok(false),
        }
    }

    fn object_status(&self, name: &str) -> StatusResult<Option<ObjectStatus>> {
        let Some(objects) = self.cluster()?.opt_child("object")? else {
            return Ok(None);
        };
        let Some(obj) = objects.opt_child(name)? else {
            return Ok(None);
        };
        obj.map()?;
        let placement = match obj.opt_string("placement_state")? {
            Some(p) => p,
            None => obj.opt_string("placement")?.unwrap_or_default(),
        };
        Ok(Some(ObjectStatus {
            avail: obj.opt_status("avail")?.unwrap_or(Status::Undef),
            overall: obj.opt_status("overall")?.unwrap_or(Status::Undef),
            placement,
            frozen: parse::object_frozen(&obj)?,
            provisioned: parse::provisioned(&obj)?,
        }))
    }

    fn instance_status(&self, object: &str, node: &str) -> StatusResult<Option<InstanceStatus>> {
        let Some(instances) = self.node(node)?.opt_child("instance")? else {
            return Ok(None);
        };
        let Some(inst) = instances.opt_child(object)? else {
            return Ok(None);
        };
        // Instances announced by config only, with no status yet, are not
        // running here.
        let Some(status) = inst.opt_child("status")? else {
            return Ok(None);
        };
        status.map()?;
        let monitor = match inst.opt_child("monitor")? {
            Some(m) => Monitor {
                status: m.opt_string("state")?.unwrap_or_default(),
                global_expect: m.opt_string("global_expect")?.unwrap_or_default(),
            },
            None => Monitor::default(),
        };
        let mut out = InstanceStatus {
            avail: status.opt_status("avail")?.unwrap_or(Status::Undef),
            overall: status.opt_status("overall")?.unwrap_or(Status::Undef),
            status_group: parse::status_group(&status)?,
            frozen: parse::frozen_at(&status)?,
            monitor,
            resources: parse::resources(&status)?,
            encap: parse::encap(&status, parse::frozen_at)?,
            app: None,
            env: None,
            topology: "failover".to_string(),
            flex_min: 0,
            flex_max: 0,
            scale: None,
            slave: false,
        };
        if let Some(config) = inst.opt_child("config")? {
            out.app = config.opt_string("app")?;
            out.env = config.opt_string("env")?;
            if let Some(topology) = config.opt_string("topology")? {
                out.topology = topology;
            }
            out.flex_min = config.opt_i64("flex_min")?.unwrap_or(0);
            out.flex_max = config.opt_i64("flex_max")?.unwrap_or(0);
            out.scale = config.opt_i64("scale")?;
        }
        out.slave = status.opt_bool("slave")?.unwrap_or(false);
        Ok(Some(out))
    }

    /// One entry per (stream, peer). A stream that is not running reports
    /// every peer as `beating = 2`.
    fn heartbeats(&self) -> StatusResult<Vec<HeartbeatStatus>> {
        let root = Tree::root(&self.data, "data");
        let Some(daemon) = root.opt_child("daemon")? else {
            return Ok(Vec::new());
        };
        let Some(hb) = daemon.opt_child("heartbeat")? else {
            return Ok(Vec::new());
        };
        let Some(streams) = hb.opt_child("streams")? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for stream in streams.items()? {
            let id = stream.child("id")?.str()?.to_string();
            let driver = stream.opt_string("type")?.unwrap_or_default();
            let state = stream.opt_string("state")?.unwrap_or_default();
            let desc = stream.opt_string("desc")?.unwrap_or_default();
            let Some(peers) = stream.opt_child("peers")? else {
                continue;
            };
            for peer in peers.keys()? {
                let detail = peers.child(&peer)?;
                let beating = if state != "running" {
                    2
                } else if detail.opt_bool("is_beating")?.unwrap_or(false) {
                    1
                } else {
                    0
                };
                out.push(HeartbeatStatus {
                    stream: id.clone(),
                    peer,
                    driver: driver.clone(),
                    state: state.clone(),
                    beating,
                    desc: desc.clone(),
                });
            }
        }
        Ok(out)
    }
}
