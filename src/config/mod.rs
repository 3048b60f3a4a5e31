//! Configuration: labelled YAML trees, their merge rules, and tool settings.

mod loader;
mod merge;
mod settings;
mod tree;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use loader::{ConfigFile, ConfigKind, SEARCH_DIRS};
pub(crate) use loader::read_config;
pub use merge::{
    GLANCE_POLICIES, MergeError, MergePolicy, MergedConfig, merge_glance, merge_maps,
    merge_section,
};
pub use settings::{DEFAULT_HTTP_TIMEOUT_SECS, VetterSettings};
pub use tree::{ConfigTree, max_timeout};

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Raised when no candidate configuration file exists.
    #[error("{kind} configuration not found; searched: {}", display_paths(.searched))]
    ConfigNotFound {
        /// Kind of configuration file that was looked up.
        kind: &'static str,
        /// Paths that were checked, in order.
        searched: Vec<Utf8PathBuf>,
    },
    /// Raised when a label is absent from a loaded file.
    #[error("label `{label}` not found in {kind} configuration {path}")]
    LabelNotFound {
        /// Requested label.
        label: String,
        /// Kind of configuration file that was searched.
        kind: &'static str,
        /// File that was searched.
        path: Utf8PathBuf,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when YAML parsing fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a file or entry has an unexpected shape.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when a field is present but has the wrong type or value.
    #[error("invalid configuration field {field}: {message}")]
    InvalidField {
        /// Dotted path of the offending field.
        field: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when two sections cannot be merged.
    #[error("configuration merge failed: {0}")]
    Merge(#[from] MergeError),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Settings(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Settings(value.to_string())
    }
}

fn display_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
