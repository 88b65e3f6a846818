//! Parsing shared by both payload generations: resources, containers,
//! status groups, and the frozen encodings.

use super::tree::Tree;
use super::{EncapStatus, ResourceStatus, Status, StatusError, StatusGroup, StatusResult};
use chrono::{DateTime, Datelike};
use serde_json::Value;

pub(crate) fn status_group(node: &Tree<'_>) -> StatusResult<StatusGroup> {
    let Some(group) = node.opt_child("status_group")? else {
        return Ok(StatusGroup::default());
    };
    let dim = |key: &str| -> StatusResult<Status> {
        Ok(group.opt_status(key)?.unwrap_or(Status::NotApplicable))
    };
    Ok(StatusGroup {
        ip: dim("ip")?,
        disk: dim("disk")?,
        fs: dim("fs")?,
        share: dim("share")?,
        container: dim("container")?,
        app: dim("app")?,
        sync: dim("sync")?,
    })
}

/// Resource log lines, accepted as a string, a list of strings, or a list
/// of `{level, message}` entries. Joined with newlines.
fn resource_log(node: &Tree<'_>) -> StatusResult<String> {
    let Some(log) = node.opt_child("log")? else {
        return Ok(String::new());
    };
    if let Value::String(s) = log.value() {
        return Ok(s.clone());
    }
    let mut lines = Vec::new();
    for entry in log.items()? {
        match entry.value() {
            Value::String(s) => lines.push(s.clone()),
            Value::Object(_) => {
                let level = entry.opt_str("level")?.unwrap_or("info");
                let message = entry.opt_str("message")?.unwrap_or_default();
                lines.push(format!("{}: {}", level, message));
            }
            _ => {
                return Err(StatusError::WrongType {
                    path: entry.path().to_string(),
                    expected: "string or log entry",
                })
            }
        }
    }
    Ok(lines.join("\n"))
}

pub(crate) fn resources(node: &Tree<'_>) -> StatusResult<Vec<ResourceStatus>> {
    let Some(map) = node.opt_child("resources")? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for rid in map.keys()? {
        let res = map.child(&rid)?;
        res.map()?;
        out.push(ResourceStatus {
            status: res.opt_status("status")?.unwrap_or(Status::Undef),
            kind: res.opt_string("type")?.unwrap_or_default(),
            desc: match res.opt_string("label")? {
                Some(label) => label,
                None => res.opt_string("desc")?.unwrap_or_default(),
            },
            log: resource_log(&res)?,
            monitor: res.opt_bool("monitor")?.unwrap_or(false),
            disable: res.opt_bool("disable")?.unwrap_or(false),
            optional: res.opt_bool("optional")?.unwrap_or(false),
            rid,
        });
    }
    out.sort_by(|a, b| a.rid.cmp(&b.rid));
    Ok(out)
}

/// Encapsulated containers of an instance. `frozen` decodes the container
/// frozen indicator, which differs per payload generation.
pub(crate) fn encap(
    node: &Tree<'_>,
    frozen: impl Fn(&Tree<'_>) -> StatusResult<bool>,
) -> StatusResult<Vec<EncapStatus>> {
    let Some(map) = node.opt_child("encap")? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for rid in map.keys()? {
        let container = map.child(&rid)?;
        container.map()?;
        out.push(EncapStatus {
            hostname: container
                .opt_string("hostname")?
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| rid.clone()),
            avail: container.opt_status("avail")?.unwrap_or(Status::Undef),
            overall: container.opt_status("overall")?.unwrap_or(Status::Undef),
            status_group: status_group(&container)?,
            frozen: frozen(&container)?,
            resources: resources(&container)?,
            rid,
        });
    }
    out.sort_by(|a, b| a.rid.cmp(&b.rid));
    Ok(out)
}

/// v2 frozen indicator: a boolean or a freeze epoch, zero meaning thawed.
pub(crate) fn frozen_flag(node: &Tree<'_>) -> StatusResult<bool> {
    Ok(node.opt_flag("frozen")?.unwrap_or(false))
}

/// v3 frozen indicator: an RFC3339 `frozen_at` timestamp. Absent, empty or
/// the zero time (year 1) means thawed.
pub(crate) fn frozen_at(node: &Tree<'_>) -> StatusResult<bool> {
    let Some(at) = node.opt_child("frozen_at")? else {
        return Ok(false);
    };
    let s = at.str()?;
    if s.is_empty() {
        return Ok(false);
    }
    let ts = DateTime::parse_from_rfc3339(s).map_err(|_| StatusError::BadTimestamp {
        path: at.path().to_string(),
        value: s.to_string(),
    })?;
    Ok(ts.year() > 1)
}

/// Object-level frozen state: `"frozen"`/`"thawed"` strings, booleans, or
/// freeze epochs depending on the agent.
pub(crate) fn object_frozen(node: &Tree<'_>) -> StatusResult<bool> {
    let Some(frozen) = node.opt_child("frozen")? else {
        return Ok(false);
    };
    match frozen.value() {
        Value::String(s) => Ok(s == "frozen"),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        _ => Err(StatusError::WrongType {
            path: frozen.path().to_string(),
            expected: "string, boolean or number",
        }),
    }
}

/// Provisioned state normalized to `"true"`, `"false"`, `"mixed"` or `"n/a"`.
pub(crate) fn provisioned(node: &Tree<'_>) -> StatusResult<String> {
    let Some(p) = node.opt_child("provisioned")? else {
        return Ok("n/a".to_string());
    };
    match p.value() {
        Value::Bool(true) => Ok("true".to_string()),
        Value::Bool(false) => Ok("false".to_string()),
        Value::String(s) => Ok(s.clone()),
        _ => Err(StatusError::WrongType {
            path: p.path().to_string(),
            expected: "boolean or string",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_group_defaults_to_not_applicable() {
        let v = json!({"status_group": {"ip": "up"}});
        let g = status_group(&Tree::root(&v, "i")).unwrap();
        assert_eq!(g.ip, Status::Up);
        assert_eq!(g.disk, Status::NotApplicable);
        assert_eq!(g.sync, Status::NotApplicable);
    }

    #[test]
    fn resources_accept_both_log_styles() {
        let v = json!({"resources": {
            "ip#1": {"status": "up", "type": "ip.host", "label": "10.0.0.1", "log": ["warn: arp"]},
            "fs#1": {"status": "warn", "type": "fs.flag", "log": [{"level": "error", "message": "full"}]}
        }});
        let res = resources(&Tree::root(&v, "i")).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].rid, "fs#1");
        assert_eq!(res[0].log, "error: full");
        assert_eq!(res[1].rid, "ip#1");
        assert_eq!(res[1].desc, "10.0.0.1");
        assert_eq!(res[1].log, "warn: arp");
    }

    #[test]
    fn resources_bad_log_entry_reports_path() {
        let v = json!({"resources": {"ip#1": {"log": [42]}}});
        let err = resources(&Tree::root(&v, "i")).unwrap_err();
        assert_eq!(
            err,
            StatusError::WrongType {
                path: "i.resources.ip#1.log[0]".into(),
                expected: "string or log entry"
            }
        );
    }

    #[test]
    fn frozen_at_handles_zero_time_and_garbage() {
        let zero = json!({"frozen_at": "0001-01-01T00:00:00Z"});
        assert!(!frozen_at(&Tree::root(&zero, "s")).unwrap());
        let set = json!({"frozen_at": "2024-03-01T10:00:00+01:00"});
        assert!(frozen_at(&Tree::root(&set, "s")).unwrap());
        let bad = json!({"frozen_at": "yesterday"});
        assert_eq!(
            frozen_at(&Tree::root(&bad, "s")).unwrap_err(),
            StatusError::BadTimestamp {
                path: "s.frozen_at".into(),
                value: "yesterday".into()
            }
        );
    }

    #[test]
    fn encap_hostname_falls_back_to_rid() {
        let v = json!({"encap": {"container#1": {"avail": "up", "frozen": 0}}});
        let e = encap(&Tree::root(&v, "i"), frozen_flag).unwrap();
        assert_eq!(e[0].hostname, "container#1");
        assert!(!e[0].frozen);
    }

    #[test]
    fn provisioned_normalizes_booleans() {
        let v = json!({"provisioned": true});
        assert_eq!(provisioned(&Tree::root(&v, "o")).unwrap(), "true");
        let v = json!({});
        assert_eq!(provisioned(&Tree::root(&v, "o")).unwrap(), "n/a");
    }
}
