//! Path-tracking accessors over `serde_json::Value`.
//!
//! Every lookup remembers where it came from so a shape mismatch reports
//! `data.nodes.n1.frozen` instead of a bare "invalid type".

use super::{Status, StatusError, StatusResult};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub(crate) struct Tree<'a> {
    value: &'a Value,
    path: String,
}

impl<'a> Tree<'a> {
    pub(crate) fn root(value: &'a Value, path: &str) -> Tree<'a> {
        Tree {
            value,
            path: path.to_string(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn value(&self) -> &'a Value {
        self.value
    }

    fn join(&self, key: &str) -> String {
        format!("{}.{}", self.path, key)
    }

    fn wrong_type(&self, expected: &'static str) -> StatusError {
        StatusError::WrongType {
            path: self.path.clone(),
            expected,
        }
    }

    pub(crate) fn map(&self) -> StatusResult<&'a Map<String, Value>> {
        self.value.as_object().ok_or_else(|| self.wrong_type("object"))
    }

    pub(crate) fn keys(&self) -> StatusResult<Vec<String>> {
        Ok(self.map()?.keys().cloned().collect())
    }

    /// Required child. Absent or `null` is reported as missing.
    pub(crate) fn child(&self, key: &str) -> StatusResult<Tree<'a>> {
        self.opt_child(key)?.ok_or_else(|| StatusError::Missing {
            path: self.join(key),
        })
    }

    /// Optional child: `None` when absent or `null`.
    pub(crate) fn opt_child(&self, key: &str) -> StatusResult<Option<Tree<'a>>> {
        match self.map()?.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(Tree {
                value,
                path: self.join(key),
            })),
        }
    }

    pub(crate) fn str(&self) -> StatusResult<&'a str> {
        self.value.as_str().ok_or_else(|| self.wrong_type("string"))
    }

    pub(crate) fn items(&self) -> StatusResult<Vec<Tree<'a>>> {
        let array = self.value.as_array().ok_or_else(|| self.wrong_type("array"))?;
        Ok(array
            .iter()
            .enumerate()
            .map(|(i, value)| Tree {
                value,
                path: format!("{}[{}]", self.path, i),
            })
            .collect())
    }

    pub(crate) fn opt_str(&self, key: &str) -> StatusResult<Option<&'a str>> {
        self.opt_child(key)?.map(|n| n.str()).transpose()
    }

    pub(crate) fn opt_string(&self, key: &str) -> StatusResult<Option<String>> {
        Ok(self.opt_str(key)?.map(str::to_string))
    }

    pub(crate) fn opt_status(&self, key: &str) -> StatusResult<Option<Status>> {
        Ok(self.opt_str(key)?.map(Status::parse))
    }

    pub(crate) fn opt_bool(&self, key: &str) -> StatusResult<Option<bool>> {
        self.opt_child(key)?
            .map(|n| n.value.as_bool().ok_or_else(|| n.wrong_type("boolean")))
            .transpose()
    }

    pub(crate) fn opt_i64(&self, key: &str) -> StatusResult<Option<i64>> {
        self.opt_child(key)?
            .map(|n| match n.value {
                Value::Number(num) => num
                    .as_i64()
                    .or_else(|| num.as_f64().map(|f| f as i64))
                    .ok_or_else(|| n.wrong_type("integer")),
                _ => Err(n.wrong_type("integer")),
            })
            .transpose()
    }

    /// Flag encoded as a boolean or a number (non-zero means set).
    pub(crate) fn opt_flag(&self, key: &str) -> StatusResult<Option<bool>> {
        self.opt_child(key)?
            .map(|n| match n.value {
                Value::Bool(b) => Ok(*b),
                Value::Number(num) => Ok(num.as_f64().map(|f| f != 0.0).unwrap_or(false)),
                _ => Err(n.wrong_type("boolean or number")),
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn child_reports_full_path_when_missing() {
        let v = json!({"nodes": {"n1": {}}});
        let root = Tree::root(&v, "data");
        let err = root
            .child("nodes")
            .unwrap()
            .child("n1")
            .unwrap()
            .child("frozen")
            .unwrap_err();
        assert_eq!(
            err,
            StatusError::Missing {
                path: "data.nodes.n1.frozen".into()
            }
        );
    }

    #[test]
    fn null_child_counts_as_absent() {
        let v = json!({"app": null});
        let root = Tree::root(&v, "x");
        assert_eq!(root.opt_str("app").unwrap(), None);
    }

    #[test]
    fn wrong_type_names_expected_type() {
        let v = json!({"avail": 3});
        let root = Tree::root(&v, "inst");
        let err = root.opt_status("avail").unwrap_err();
        assert_eq!(
            err,
            StatusError::WrongType {
                path: "inst.avail".into(),
                expected: "string"
            }
        );
    }

    #[test]
    fn items_index_paths() {
        let v = json!({"streams": [{"id": 1}]});
        let root = Tree::root(&v, "d");
        let items = root.child("streams").unwrap().items().unwrap();
        let err = items[0].opt_str("id").unwrap_err();
        assert!(matches!(err, StatusError::WrongType { ref path, .. } if path == "d.streams[0].id"));
    }

    #[test]
    fn flag_accepts_bool_and_numbers() {
        let v = json!({"a": true, "b": 0, "c": 1700000000.5, "d": "yes"});
        let root = Tree::root(&v, "f");
        assert_eq!(root.opt_flag("a").unwrap(), Some(true));
        assert_eq!(root.opt_flag("b").unwrap(), Some(false));
        assert_eq!(root.opt_flag("c").unwrap(), Some(true));
        assert!(root.opt_flag("d").is_err());
        assert_eq!(root.opt_flag("missing").unwrap(), None);
    }
}
