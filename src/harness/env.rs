//! Flattening of configuration trees into adapter environment variables.

use std::collections::BTreeMap;

use serde_json::Value;

/// Prefix of every variable exported to adapters.
pub const ENV_PREFIX: &str = "VETTER";

/// Flattens `value` into `PREFIX_KEY_SUBKEY` variables.
///
/// Keys are upper-cased, list elements share their parent's name (later
/// elements win), and nulls are dropped.
#[must_use]
pub fn unwrap_config(prefix: &str, value: &Value) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    unwrap_into(prefix, value, &mut flat);
    flat
}

fn unwrap_into(prefix: &str, value: &Value, flat: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                unwrap_into(&format!("{prefix}_{}", key.to_uppercase()), child, flat);
            }
        }
        Value::Array(items) => {
            for item in items {
                unwrap_into(prefix, item, flat);
            }
        }
        Value::Null => {}
        Value::String(text) => {
            flat.insert(prefix.to_owned(), text.clone());
        }
        other => {
            flat.insert(prefix.to_owned(), other.to_string());
        }
    }
}

/// Builds the variables passed to every adapter: session facts, then SSH
/// fields, then user variables, later sources overriding earlier ones.
#[must_use]
pub fn adapter_environment(
    session: &BTreeMap<String, String>,
    ssh: Option<&BTreeMap<String, String>>,
    user: Option<&Value>,
) -> BTreeMap<String, String> {
    let prefixed = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(key, value)| (format!("{ENV_PREFIX}_{}", key.to_uppercase()), value.clone()))
            .collect::<Vec<_>>()
    };

    let mut env = BTreeMap::new();
    env.extend(prefixed(session));
    if let Some(ssh) = ssh {
        env.extend(prefixed(ssh));
    }
    if let Some(user) = user {
        env.extend(unwrap_config(ENV_PREFIX, user));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_mappings_become_upper_case_paths() {
        let flat = unwrap_config("VETTER", &json!({"db": {"host": "x", "port": 5432}, "gone": null}));
        assert_eq!(flat.get("VETTER_DB_HOST").map(String::as_str), Some("x"));
        assert_eq!(flat.get("VETTER_DB_PORT").map(String::as_str), Some("5432"));
        assert!(!flat.contains_key("VETTER_GONE"));
    }

    #[test]
    fn list_elements_merge_into_the_same_prefix() {
        let flat = unwrap_config("VETTER", &json!([{"a": 1}, {"b": true}]));
        assert_eq!(flat.get("VETTER_A").map(String::as_str), Some("1"));
        assert_eq!(flat.get("VETTER_B").map(String::as_str), Some("true"));
    }

    #[test]
    fn user_variables_override_session_facts() {
        let session = BTreeMap::from([(String::from("main_ip"), String::from("10.0.0.1"))]);
        let ssh = BTreeMap::from([(String::from("ssh_port"), String::from("22"))]);
        let env = adapter_environment(&session, Some(&ssh), Some(&json!({"main_ip": "override"})));
        assert_eq!(env.get("VETTER_MAIN_IP").map(String::as_str), Some("override"));
        assert_eq!(env.get("VETTER_SSH_PORT").map(String::as_str), Some("22"));
    }
}
