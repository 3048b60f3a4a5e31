//! Offline checks of every entry in the configuration files.
//!
//! Loading a file only checks that it maps labels to mappings. Validation
//! resolves each entry the way a run would, without any remote call, and
//! collects every problem instead of stopping at the first.

use std::fmt;

use thiserror::Error;

use crate::config::{ConfigFile, ConfigKind, ConfigTree};
use crate::harness::TestPlan;
use crate::session::{SessionPlan, check_glance, ssh_settings};

/// Image reference used to resolve test environments without an image file.
const PLACEHOLDER_IMAGE: &str = "validate";

/// A configuration entry that would fail at run time.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind} entry `{label}`: {message}")]
pub struct InvalidEntry {
    /// Kind of file the entry belongs to.
    pub kind: &'static str,
    /// Label of the entry.
    pub label: String,
    /// Human-readable error message.
    pub message: String,
}

/// Every invalid entry found across the checked files.
#[derive(Debug, Default)]
pub struct Validation {
    /// Invalid entries in file order.
    pub invalid: Vec<InvalidEntry>,
}

impl Validation {
    /// Whether every entry resolved.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }

    /// Checks every entry of `file` and records the failures.
    pub fn check(&mut self, file: &ConfigFile) {
        for label in file.labels() {
            let outcome = file
                .entry(label)
                .map_err(|err| err.to_string())
                .and_then(|entry| check_entry(file.kind(), &entry));
            if let Err(message) = outcome {
                self.invalid.push(InvalidEntry {
                    kind: file.kind().describe(),
                    label: label.to_owned(),
                    message,
                });
            }
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invalid configuration entries", self.invalid.len())?;
        for entry in &self.invalid {
            write!(f, "\n  {entry}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Validation {}

/// Checks every entry of each file.
#[must_use]
pub fn validate(files: &[ConfigFile]) -> Validation {
    let mut validation = Validation::default();
    for file in files {
        validation.check(file);
    }
    validation
}

fn check_entry(kind: ConfigKind, entry: &ConfigTree) -> Result<(), String> {
    match kind {
        ConfigKind::Images => check_image(entry),
        ConfigKind::TestEnvironments => check_test_environment(entry),
        ConfigKind::UploadEnvironments => {
            check_glance(&ConfigTree::empty(), entry).map_err(|err| err.to_string())
        }
    }
}

fn check_image(image: &ConfigTree) -> Result<(), String> {
    check_glance(image, &ConfigTree::empty()).map_err(|err| err.to_string())?;
    if image.contains("tests") {
        TestPlan::from_config(image, &ConfigTree::empty()).map_err(|err| err.to_string())?;
        ssh_settings(image).map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn check_test_environment(environment: &ConfigTree) -> Result<(), String> {
    check_glance(&ConfigTree::empty(), environment).map_err(|err| err.to_string())?;
    SessionPlan::from_config(
        &ConfigTree::empty(),
        environment,
        Some(PLACEHOLDER_IMAGE),
        None,
    )
    .map(drop)
    .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn file(kind: ConfigKind, contents: &str) -> ConfigFile {
        ConfigFile::parse(kind, Utf8PathBuf::from(kind.file_name()), contents)
            .unwrap_or_else(|err| panic!("parse: {err}"))
    }

    #[test]
    fn well_formed_files_are_valid() {
        let images = file(
            ConfigKind::Images,
            "xenial:\n  filename: xenial.qcow2\n  glance:\n    name: xenial\n    min_disk: 4\n  tests:\n    ssh:\n      username: ubuntu\n    tests_list:\n      - shell: ./check.sh\n",
        );
        let environments = file(
            ConfigKind::TestEnvironments,
            "lab:\n  nova:\n    flavor: m1.small\n    nics:\n      - net_id: net-1\n",
        );
        let uploads = file(
            ConfigKind::UploadEnvironments,
            "prod:\n  glance:\n    public: true\n",
        );

        let validation = validate(&[images, environments, uploads]);
        assert!(validation.is_valid(), "{validation}");
    }

    #[test]
    fn every_invalid_entry_is_reported() {
        let images = file(
            ConfigKind::Images,
            "good:\n  filename: a.qcow2\nbad_tags:\n  glance:\n    tags: image\nbad_port:\n  tests:\n    wait_for_port: http\n",
        );
        let environments = file(
            ConfigKind::TestEnvironments,
            "no_flavor:\n  nova: {}\nbad_regexp:\n  nova:\n    flavor: f\n    main_nic_regexp: '(unclosed'\nnot_a_mapping: 3\n",
        );

        let validation = validate(&[images, environments]);

        let mut labels: Vec<_> = validation
            .invalid
            .iter()
            .map(|entry| (entry.kind, entry.label.as_str()))
            .collect();
        labels.sort_unstable();
        assert_eq!(
            labels,
            vec![
                ("images", "bad_port"),
                ("images", "bad_tags"),
                ("test environments", "bad_regexp"),
                ("test environments", "no_flavor"),
                ("test environments", "not_a_mapping"),
            ]
        );
        let rendered = validation.to_string();
        assert!(rendered.starts_with("5 invalid configuration entries"), "{rendered}");
        assert!(rendered.contains("main_nic_regexp"), "{rendered}");
    }

    #[test]
    fn upload_environment_with_wrong_flag_type_is_invalid() {
        let uploads = file(
            ConfigKind::UploadEnvironments,
            "prod:\n  glance:\n    protected: 'yes'\n",
        );
        let validation = validate(&[uploads]);
        assert_eq!(validation.invalid.len(), 1);
    }
}
