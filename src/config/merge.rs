//! Field-by-field merge of two partial configuration sections.
//!
//! The first source is the image section and the second the environment
//! section. Each known field has a fixed [`MergePolicy`]; everything else is
//! second-source-wins. Merging never mutates its inputs, so the same pair of
//! trees always produces the same [`MergedConfig`].

use serde_json::{Map, Value};
use thiserror::Error;

use super::tree::ConfigTree;

/// Rule used to combine one field present in either source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergePolicy {
    /// First source wins when present, else second.
    First,
    /// Second source wins when present, else first.
    Second,
    /// Greater of the two values; logical OR for booleans.
    Max,
    /// Concatenation: first source elements, then second source elements.
    MergeList,
    /// Shallow merge with the second source overwriting colliding keys.
    MergeDict,
}

/// Policy table applied to the `glance` upload section.
pub const GLANCE_POLICIES: &[(&str, MergePolicy)] = &[
    ("api_version", MergePolicy::Second),
    ("upload_timeout", MergePolicy::Max),
    ("properties", MergePolicy::MergeDict),
    ("tags", MergePolicy::MergeList),
    ("endpoint", MergePolicy::Second),
    ("disk_format", MergePolicy::Second),
    ("container_format", MergePolicy::Second),
    ("protected", MergePolicy::Max),
    ("min_disk", MergePolicy::Max),
    ("min_ram", MergePolicy::Max),
];

/// Errors raised when two sections cannot be combined.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum MergeError {
    /// Raised when a section is present but is not a mapping.
    #[error("section `{section}` must be a mapping, found {found}")]
    NotAMapping {
        /// Name of the offending section.
        section: String,
        /// Kind of value found instead.
        found: &'static str,
    },
    /// Raised when a field does not have the shape its policy requires.
    #[error("field `{field}` must be {expected}, found {found}")]
    TypeMismatch {
        /// Name of the offending field.
        field: String,
        /// Kind of value the policy requires.
        expected: &'static str,
        /// Kind of value found.
        found: &'static str,
    },
    /// Raised when `max` is applied to values that cannot be compared.
    #[error("field `{field}` cannot take the maximum of {first} and {second}")]
    Incomparable {
        /// Name of the offending field.
        field: String,
        /// Kind of the first value.
        first: &'static str,
        /// Kind of the second value.
        second: &'static str,
    },
}

/// Read-only result of merging two sections.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedConfig {
    tree: ConfigTree,
}

impl MergedConfig {
    /// Borrows the merged tree.
    #[must_use]
    pub const fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    /// Looks up a merged field by dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.tree.get(path)
    }

    /// Consumes the merge result.
    #[must_use]
    pub fn into_tree(self) -> ConfigTree {
        self.tree
    }
}

/// Merges the `section` mapping of `first` and `second` using `policies`.
///
/// A missing section on either side is treated as empty.
///
/// # Errors
///
/// Returns [`MergeError`] when a section is not a mapping or a field does not
/// fit its policy.
pub fn merge_section(
    first: &ConfigTree,
    second: &ConfigTree,
    section: &str,
    policies: &[(&str, MergePolicy)],
) -> Result<MergedConfig, MergeError> {
    let first_map = section_map(first, section)?;
    let second_map = section_map(second, section)?;
    merge_maps(&first_map, &second_map, policies)
}

/// Merges the `glance` sections of an image and an environment entry.
///
/// # Errors
///
/// See [`merge_section`].
pub fn merge_glance(
    image: &ConfigTree,
    environment: &ConfigTree,
) -> Result<MergedConfig, MergeError> {
    merge_section(image, environment, "glance", GLANCE_POLICIES)
}

/// Merges two mappings field by field.
///
/// # Errors
///
/// Returns [`MergeError`] when a field does not fit its policy.
pub fn merge_maps(
    first: &Map<String, Value>,
    second: &Map<String, Value>,
    policies: &[(&str, MergePolicy)],
) -> Result<MergedConfig, MergeError> {
    let mut merged = Map::new();
    let keys = first
        .keys()
        .chain(second.keys().filter(|key| !first.contains_key(*key)));

    for key in keys {
        let policy = policy_for(policies, key);
        let left = first.get(key).filter(|value| !value.is_null());
        let right = second.get(key).filter(|value| !value.is_null());
        if let Some(value) = merge_field(key, policy, left, right)? {
            merged.insert(key.clone(), value);
        }
    }

    Ok(MergedConfig {
        tree: ConfigTree::new(Value::Object(merged)),
    })
}

fn policy_for(policies: &[(&str, MergePolicy)], key: &str) -> MergePolicy {
    policies
        .iter()
        .find(|(name, _)| *name == key)
        .map_or(MergePolicy::Second, |(_, policy)| *policy)
}

fn section_map(tree: &ConfigTree, section: &str) -> Result<Map<String, Value>, MergeError> {
    match tree.get(section) {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(MergeError::NotAMapping {
            section: section.to_owned(),
            found: kind_of(other),
        }),
    }
}

fn merge_field(
    field: &str,
    policy: MergePolicy,
    first: Option<&Value>,
    second: Option<&Value>,
) -> Result<Option<Value>, MergeError> {
    let merged = match policy {
        MergePolicy::First => first.or(second).cloned(),
        MergePolicy::Second => second.or(first).cloned(),
        MergePolicy::Max => max_of(field, first, second)?,
        MergePolicy::MergeList => {
            let mut items = list_of(field, first)?;
            items.extend(list_of(field, second)?);
            (first.is_some() || second.is_some()).then_some(Value::Array(items))
        }
        MergePolicy::MergeDict => {
            let mut entries = dict_of(field, first)?;
            entries.extend(dict_of(field, second)?);
            (first.is_some() || second.is_some()).then_some(Value::Object(entries))
        }
    };
    Ok(merged)
}

fn max_of(
    field: &str,
    first: Option<&Value>,
    second: Option<&Value>,
) -> Result<Option<Value>, MergeError> {
    let (left, right) = match (first, second) {
        (Some(left), Some(right)) => (left, right),
        (Some(value), None) | (None, Some(value)) => {
            return if value.is_number() || value.is_boolean() {
                Ok(Some(value.clone()))
            } else {
                Err(MergeError::TypeMismatch {
                    field: field.to_owned(),
                    expected: "a number or boolean",
                    found: kind_of(value),
                })
            };
        }
        (None, None) => return Ok(None),
    };

    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Some(Value::Bool(*a || *b))),
        (Value::Number(a), Value::Number(b)) => {
            let greater = match (a.as_u64(), b.as_u64()) {
                (Some(x), Some(y)) => x >= y,
                _ => a.as_f64().unwrap_or(f64::NAN) >= b.as_f64().unwrap_or(f64::NAN),
            };
            Ok(Some(if greater { left.clone() } else { right.clone() }))
        }
        _ => Err(MergeError::Incomparable {
            field: field.to_owned(),
            first: kind_of(left),
            second: kind_of(right),
        }),
    }
}

fn list_of(field: &str, value: Option<&Value>) -> Result<Vec<Value>, MergeError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(MergeError::TypeMismatch {
            field: field.to_owned(),
            expected: "a list",
            found: kind_of(other),
        }),
    }
}

fn dict_of(field: &str, value: Option<&Value>) -> Result<Map<String, Value>, MergeError> {
    match value {
        None => Ok(Map::new()),
        Some(Value::Object(entries)) => Ok(entries.clone()),
        Some(other) => Err(MergeError::TypeMismatch {
            field: field.to_owned(),
            expected: "a mapping",
            found: kind_of(other),
        }),
    }
}

pub(crate) const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
