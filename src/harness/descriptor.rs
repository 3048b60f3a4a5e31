//! Test descriptors and the per-image test plan.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Map, Value};

use crate::config::{ConfigTree, max_timeout};
use crate::probe::DEFAULT_PORT_WAIT_TIMEOUT;

use super::HarnessError;

/// Default limit for one test descriptor.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Adapter that executes a test path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdapterKind {
    /// `python3 -m pytest <path>`.
    Pytest,
    /// Executable file, or every executable under a directory.
    Shell,
}

impl AdapterKind {
    const ALL: [Self; 2] = [Self::Pytest, Self::Shell];

    /// Key naming the adapter in a descriptor.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Pytest => "pytest",
            Self::Shell => "shell",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One entry of `tests.tests_list`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestDescriptor {
    /// Adapter selected by the descriptor.
    pub kind: AdapterKind,
    /// Test file or directory.
    pub path: Utf8PathBuf,
    /// Limit for the whole adapter run.
    pub timeout: Duration,
}

impl TestDescriptor {
    /// Parses a descriptor such as `{shell: ./tests, timeout: 60}`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidDescriptor`] when the descriptor names
    /// no adapter, more than one adapter, or has malformed fields. `index`
    /// is reported in the error.
    pub fn parse(index: usize, value: &Value) -> Result<Self, HarnessError> {
        let invalid = |message: String| HarnessError::InvalidDescriptor { index, message };
        let Value::Object(fields) = value else {
            return Err(invalid(String::from("descriptor must be a mapping")));
        };

        let mut kinds = AdapterKind::ALL
            .into_iter()
            .filter(|kind| fields.contains_key(kind.key()));
        let kind = match (kinds.next(), kinds.next()) {
            (Some(kind), None) => kind,
            (None, _) => return Err(invalid(String::from("no known adapter (pytest or shell)"))),
            (Some(_), Some(_)) => {
                return Err(invalid(String::from("more than one adapter configured")));
            }
        };

        let path = match fields.get(kind.key()) {
            Some(Value::String(path)) if !path.trim().is_empty() => Utf8PathBuf::from(path),
            _ => return Err(invalid(format!("{kind} path must be a non-empty string"))),
        };

        Ok(Self {
            kind,
            path,
            timeout: descriptor_timeout(fields).map_err(invalid)?,
        })
    }
}

fn descriptor_timeout(fields: &Map<String, Value>) -> Result<Duration, String> {
    match fields.get("timeout") {
        None | Some(Value::Null) => Ok(DEFAULT_TEST_TIMEOUT),
        Some(value) => value
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| String::from("timeout must be a positive number of seconds")),
    }
}

/// Everything the harness reads from the image's `tests` section.
#[derive(Clone, Debug, PartialEq)]
pub struct TestPlan {
    /// Descriptors in declared order.
    pub tests: Vec<TestDescriptor>,
    /// User-declared variables, flattened before export.
    pub environment_variables: Option<Value>,
    /// Port that must accept connections before tests run.
    pub wait_for_port: Option<u16>,
    /// Limit for the port wait.
    pub port_wait_timeout: Duration,
}

impl TestPlan {
    /// Reads the plan from the image entry; the port wait limit is the
    /// larger of the image and environment values.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidDescriptor`] or
    /// [`HarnessError::InvalidConfig`] for malformed entries.
    pub fn from_config(image: &ConfigTree, environment: &ConfigTree) -> Result<Self, HarnessError> {
        let tests = match image.get("tests.tests_list") {
            None => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| TestDescriptor::parse(index + 1, entry))
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(HarnessError::InvalidConfig(String::from(
                    "tests.tests_list must be a list",
                )));
            }
        };

        let wait_for_port = match image.get("tests.wait_for_port") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| {
                        HarnessError::InvalidConfig(String::from(
                            "tests.wait_for_port must be a port number",
                        ))
                    })?,
            ),
        };

        Ok(Self {
            tests,
            environment_variables: image.get("tests.environment_variables").cloned(),
            wait_for_port,
            port_wait_timeout: max_timeout(
                image,
                environment,
                "tests.port_wait_timeout",
                DEFAULT_PORT_WAIT_TIMEOUT,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn parses_shell_descriptor_with_default_timeout() {
        let descriptor = TestDescriptor::parse(1, &json!({"shell": "./tests/shell"}))
            .unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(descriptor.kind, AdapterKind::Shell);
        assert_eq!(descriptor.path, Utf8PathBuf::from("./tests/shell"));
        assert_eq!(descriptor.timeout, DEFAULT_TEST_TIMEOUT);
    }

    #[test]
    fn explicit_timeout_is_kept() {
        let descriptor = TestDescriptor::parse(1, &json!({"pytest": "t.py", "timeout": 30}))
            .unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(descriptor.kind, AdapterKind::Pytest);
        assert_eq!(descriptor.timeout, Duration::from_secs(30));
    }

    #[rstest]
    #[case::two_adapters(json!({"pytest": "a.py", "shell": "b.sh"}))]
    #[case::no_adapter(json!({"timeout": 5}))]
    #[case::not_a_mapping(json!("shell"))]
    #[case::empty_path(json!({"shell": ""}))]
    #[case::bad_timeout(json!({"shell": "x", "timeout": -1}))]
    fn rejects_malformed_descriptors(#[case] value: Value) {
        let err = TestDescriptor::parse(3, &value).expect_err("descriptor should be rejected");
        assert!(matches!(err, HarnessError::InvalidDescriptor { index: 3, .. }));
    }

    #[test]
    fn plan_reads_tests_section() {
        let image = ConfigTree::new(json!({
            "tests": {
                "wait_for_port": 22,
                "port_wait_timeout": 30,
                "environment_variables": {"foo": "bar"},
                "tests_list": [{"shell": "a"}, {"pytest": "b"}],
            }
        }));
        let environment = ConfigTree::new(json!({"tests": {"port_wait_timeout": 90}}));

        let plan = TestPlan::from_config(&image, &environment)
            .unwrap_or_else(|err| panic!("plan: {err}"));

        assert_eq!(plan.tests.len(), 2);
        assert_eq!(plan.wait_for_port, Some(22));
        assert_eq!(plan.port_wait_timeout, Duration::from_secs(90));
        assert_eq!(plan.environment_variables, Some(json!({"foo": "bar"})));
    }

    #[test]
    fn plan_defaults_when_section_is_sparse() {
        let plan = TestPlan::from_config(&ConfigTree::new(json!({"tests": {}})), &ConfigTree::empty())
            .unwrap_or_else(|err| panic!("plan: {err}"));
        assert!(plan.tests.is_empty());
        assert_eq!(plan.wait_for_port, None);
        assert_eq!(plan.port_wait_timeout, DEFAULT_PORT_WAIT_TIMEOUT);
    }
}
