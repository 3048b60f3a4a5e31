//! Discovery and loading of the labelled YAML configuration files.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::{Map, Value};
use tracing::debug;

use super::ConfigError;
use super::merge::kind_of;
use super::tree::ConfigTree;

/// Directories searched, in order, when no explicit path is given.
pub const SEARCH_DIRS: [&str; 3] = [".", "./vetter", "/etc/vetter"];

/// The labelled configuration files understood by the tool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigKind {
    /// Image definitions, keyed by image label.
    Images,
    /// Test environments, keyed by environment label.
    TestEnvironments,
    /// Upload environments, keyed by environment label.
    UploadEnvironments,
}

impl ConfigKind {
    /// File name looked up in each search directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Images => "images.yaml",
            Self::TestEnvironments => "test.yaml",
            Self::UploadEnvironments => "upload.yaml",
        }
    }

    /// Human-readable description used in error messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::TestEnvironments => "test environments",
            Self::UploadEnvironments => "upload environments",
        }
    }
}

/// A parsed configuration file mapping labels to trees.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigFile {
    kind: ConfigKind,
    path: Utf8PathBuf,
    entries: Map<String, Value>,
}

impl ConfigFile {
    /// Loads `kind` from `explicit` when given, else from the first search
    /// directory containing its file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ConfigNotFound`] when the explicit path does not
    /// exist or no candidate is found, and [`ConfigError::Io`] or
    /// [`ConfigError::Parse`] when reading fails.
    pub fn load(kind: ConfigKind, explicit: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<Utf8PathBuf> = explicit.map_or_else(
            || {
                SEARCH_DIRS
                    .iter()
                    .map(|dir| Utf8Path::new(dir).join(kind.file_name()))
                    .collect()
            },
            |path| vec![path.to_path_buf()],
        );
        Self::load_first(kind, &candidates)
    }

    /// Loads `kind` from the first existing path in `candidates`.
    ///
    /// # Errors
    ///
    /// See [`ConfigFile::load`].
    pub fn load_first(kind: ConfigKind, candidates: &[Utf8PathBuf]) -> Result<Self, ConfigError> {
        for candidate in candidates {
            if path_exists(candidate)? {
                debug!(path = %candidate, kind = kind.describe(), "loading configuration");
                let contents = read_config(candidate)?;
                return Self::parse(kind, candidate.clone(), &contents);
            }
        }
        Err(ConfigError::ConfigNotFound {
            kind: kind.describe(),
            searched: candidates.to_vec(),
        })
    }

    /// Parses YAML `contents` read from `path`.
    ///
    /// An empty document is an empty set of labels.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid YAML and
    /// [`ConfigError::InvalidStructure`] when the document is not a mapping.
    pub fn parse(kind: ConfigKind, path: Utf8PathBuf, contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self {
                kind,
                path,
                entries: Map::new(),
            });
        }

        let value: Value = serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;

        match value {
            Value::Object(entries) => Ok(Self {
                kind,
                path,
                entries,
            }),
            Value::Null => Ok(Self {
                kind,
                path,
                entries: Map::new(),
            }),
            other => Err(ConfigError::InvalidStructure {
                path,
                message: format!("top level must be a mapping of labels, found {}", kind_of(&other)),
            }),
        }
    }

    /// Path the file was loaded from.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Kind of the file.
    #[must_use]
    pub const fn kind(&self) -> ConfigKind {
        self.kind
    }

    /// Iterates over the labels declared in the file.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Returns the tree stored under `label`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LabelNotFound`] when the label is missing and
    /// [`ConfigError::InvalidStructure`] when its entry is not a mapping.
    pub fn entry(&self, label: &str) -> Result<ConfigTree, ConfigError> {
        match self.entries.get(label) {
            Some(value @ Value::Object(_)) => Ok(ConfigTree::new(value.clone())),
            Some(other) => Err(ConfigError::InvalidStructure {
                path: self.path.clone(),
                message: format!("entry `{label}` must be a mapping, found {}", kind_of(other)),
            }),
            None => Err(ConfigError::LabelNotFound {
                label: label.to_owned(),
                kind: self.kind.describe(),
                path: self.path.clone(),
            }),
        }
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), ConfigError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| ConfigError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn path_exists(path: &Utf8Path) -> Result<bool, ConfigError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => Ok(dir.is_file(file_name)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ConfigError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

/// Reads a UTF-8 text file referenced from configuration.
pub(crate) fn read_config(path: &Utf8Path) -> Result<String, ConfigError> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.read_to_string(file_name).map_err(|err| ConfigError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
