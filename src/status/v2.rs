//! Version 2 payloads: flat `nodes` / `services` maps.

use super::parse;
use super::tree::Tree;
use super::{
    sorted_union, ClusterStatus, HeartbeatStatus, InstanceStatus, Monitor, ObjectStatus, Status,
    StatusResult,
};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct V2Status {
    version: String,
    cluster_id: String,
    cluster_name: String,
    data: Value,
}

impl V2Status {
    /// Validate the envelope shape and keep the data tree for lazy lookups.
    pub fn parse(version: String, data: Value) -> StatusResult<V2Status> {
        let root = Tree::root(&data, "data");
        root.map()?;
        let (cluster_id, cluster_name) = match root.opt_child("cluster")? {
            Some(cluster) => (
                cluster.opt_string("id")?.unwrap_or_default(),
                cluster.opt_string("name")?.unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        root.child("nodes")?.map()?;
        if let Some(services) = root.opt_child("services")? {
            services.map()?;
        }
        Ok(V2Status {
            version,
            cluster_id,
            cluster_name,
            data,
        })
    }

    fn root(&self) -> Tree<'_> {
        Tree::root(&self.data, "data")
    }

    fn node(&self, node: &str) -> StatusResult<Tree<'_>> {
        self.root().child("nodes")?.child(node)
    }

    fn instance_map(&self, node: &str) -> StatusResult<Option<Tree<'_>>> {
        let Some(services) = self.node(node)?.opt_child("services")? else {
            return Ok(None);
        };
        services.opt_child("status")
    }
}

impl ClusterStatus for V2Status {
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
        self.root()
            .child("nodes")
            .and_then(|n| n.keys())
            .unwrap_or_default()
    }

    fn object_names(&self) -> Vec<String> {
        let declared = self
            .root()
            .opt_child("services")
            .ok()
            .flatten()
            .and_then(|s| s.keys().ok())
            .unwrap_or_default();
        let mut instances = Vec::new();
        for node in self.node_names() {
            if let Ok(Some(map)) = self.instance_map(&node) {
                instances.extend(map.keys().unwrap_or_default());
            }
        }
        sorted_union(declared, instances)
    }

    fn node_frozen(&self, node: &str) -> StatusResult<bool> {
        parse::frozen_flag(&self.node(node)?)
    }

    fn object_status(&self, name: &str) -> StatusResult<Option<ObjectStatus>> {
        let Some(services) = self.root().opt_child("services")? else {
            return Ok(None);
        };
        let Some(obj) = services.opt_child(name)? else {
            return Ok(None);
        };
        obj.map()?;
        Ok(Some(ObjectStatus {
            avail: obj.opt_status("avail")?.unwrap_or(Status::Undef),
            overall: obj.opt_status("overall")?.unwrap_or(Status::Undef),
            placement: obj.opt_string("placement")?.unwrap_or_default(),
            frozen: parse::object_frozen(&obj)?,
            provisioned: parse::provisioned(&obj)?,
        }))
    }

    fn instance_status(&self, object: &str, node: &str) -> StatusResult<Option<InstanceStatus>> {
        let Some(map) = self.instance_map(node)? else {
            return Ok(None);
        };
        let Some(inst) = map.opt_child(object)? else {
            return Ok(None);
        };
        inst.map()?;
        let monitor = match inst.opt_child("monitor")? {
            Some(m) => Monitor {
                status: m.opt_string("status")?.unwrap_or_default(),
                global_expect: m.opt_string("global_expect")?.unwrap_or_default(),
            },
            None => Monitor::default(),
        };
        Ok(Some(InstanceStatus {
            avail: inst.opt_status("avail")?.unwrap_or(Status::Undef),
            overall: inst.opt_status("overall")?.unwrap_or(Status::Undef),
            status_group: parse::status_group(&inst)?,
            frozen: parse::frozen_flag(&inst)?,
            monitor,
            resources: parse::resources(&inst)?,
            encap: parse::encap(&inst, parse::frozen_flag)?,
            app: inst.opt_string("app")?,
            env: inst.opt_string("env")?,
            topology: inst
                .opt_string("topology")?
                .unwrap_or_else(|| "failover".to_string()),
            flex_min: inst.opt_i64("flex_min")?.unwrap_or(0),
            flex_max: inst.opt_i64("flex_max")?.unwrap_or(0),
            scale: inst.opt_i64("scale")?,
            slave: inst.opt_bool("slave")?.unwrap_or(false),
        }))
    }

    /// v2 agents do not report per-stream heartbeat detail.
    fn heartbeats(&self) -> StatusResult<Vec<HeartbeatStatus>> {
        Ok(Vec::new())
    }
}
