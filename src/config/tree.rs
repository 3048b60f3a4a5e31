//! Read-only configuration trees addressed by dotted paths.

use std::time::Duration;

use serde_json::{Map, Value};

/// A nested key/value tree loaded from one labelled configuration entry.
///
/// Paths use `.` as separator (`nova.flavor`, `tests.ssh.username`). Explicit
/// `null` values are treated the same as absent keys.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    /// Wraps an already parsed value.
    #[must_use]
    pub const fn new(root: Value) -> Self {
        Self { root }
    }

    /// Returns a tree with an empty mapping at its root.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    /// Borrows the underlying value.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.root
    }

    /// Consumes the tree, returning the underlying value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.root
    }

    /// Looks up the value at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |node, segment| node.as_object()?.get(segment))
            .filter(|value| !value.is_null())
    }

    /// Returns `true` when `path` resolves to a non-null value.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Looks up a string at `path`.
    #[must_use]
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Looks up an unsigned integer at `path`.
    #[must_use]
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    /// Looks up a boolean at `path`.
    #[must_use]
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Looks up a non-negative number of seconds at `path`.
    #[must_use]
    pub fn get_secs(&self, path: &str) -> Option<Duration> {
        self.get(path)
            .and_then(Value::as_f64)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Clones the subtree rooted at `path`.
    #[must_use]
    pub fn subtree(&self, path: &str) -> Option<Self> {
        self.get(path).cloned().map(Self::new)
    }

    /// Replaces or inserts the value at `path`, creating intermediate
    /// mappings as required. Non-mapping intermediate values are replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut node = &mut self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            if segments.peek().is_none() {
                map.insert(segment.to_owned(), value);
                return;
            }
            node = map
                .entry(segment.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for ConfigTree {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Resolves a timeout declared in two trees as the greater of both values,
/// falling back to `default` when neither declares it.
#[must_use]
pub fn max_timeout(
    image: &ConfigTree,
    environment: &ConfigTree,
    path: &str,
    default: Duration,
) -> Duration {
    match (image.get_secs(path), environment.get_secs(path)) {
        (Some(first), Some(second)) => first.max(second),
        (Some(value), None) | (None, Some(value)) => value,
        (None, None) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn tree() -> ConfigTree {
        ConfigTree::new(json!({
            "nova": {"flavor": "m1.small", "active_timeout": 42, "missing": null},
            "tests": {"ssh": {"username": "cirros", "port": 2222}},
            "glance": {"protected": true},
        }))
    }

    #[test]
    fn resolves_dotted_paths() {
        let tree = tree();
        assert_eq!(tree.get_str("nova.flavor"), Some("m1.small"));
        assert_eq!(tree.get_u64("tests.ssh.port"), Some(2222));
        assert_eq!(tree.get_bool("glance.protected"), Some(true));
        assert_eq!(tree.get_str("tests.ssh.username"), Some("cirros"));
    }

    #[rstest]
    #[case("nova.missing")]
    #[case("nova.flavor.name")]
    #[case("absent")]
    #[case("tests.ssh.key")]
    fn missing_and_null_paths_are_absent(#[case] path: &str) {
        assert!(!tree().contains(path), "{path} should be absent");
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut tree = ConfigTree::empty();
        tree.set("glance.filename", json!("disk.img"));
        tree.set("glance.tags", json!(["a"]));
        assert_eq!(tree.get_str("glance.filename"), Some("disk.img"));
        assert_eq!(tree.get("glance.tags"), Some(&json!(["a"])));
    }

    #[rstest]
    #[case(json!({"t": 5}), json!({"t": 9}), 9)]
    #[case(json!({"t": 12}), json!({"t": 9}), 12)]
    #[case(json!({"t": 7}), json!({}), 7)]
    #[case(json!({}), json!({"t": 8}), 8)]
    #[case(json!({}), json!({}), 360)]
    fn effective_timeout_is_maximum_or_default(
        #[case] image: Value,
        #[case] environment: Value,
        #[case] expected: u64,
    ) {
        let resolved = max_timeout(
            &ConfigTree::new(image),
            &ConfigTree::new(environment),
            "t",
            Duration::from_secs(360),
        );
        assert_eq!(resolved, Duration::from_secs(expected));
    }
}
