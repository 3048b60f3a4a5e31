//! Session inputs resolved from the image and environment entries before any
//! remote call is made.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ConfigError, ConfigTree, merge_glance, read_config};
use crate::control_plane::{ImageUpload, NicRequest};

use super::ssh::{DEFAULT_SSH_PORT, SshSettings};
use super::{FlavorError, ProvisionError, SessionTimeouts};

/// Prefix of every resource name created by the tool.
pub const NAME_PREFIX: &str = "VETTER";

/// Generates a fresh `VETTER-<uuid>` resource name.
#[must_use]
pub fn resource_name() -> String {
    format!("{NAME_PREFIX}-{}", Uuid::new_v4())
}

/// Where the session's boot image comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageSource {
    /// Upload a local file as a new image.
    Upload(ImageUpload),
    /// Reuse an image that already exists.
    Existing(String),
}

/// How the compute flavor is identified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlavorSpec {
    /// Exact flavor identifier.
    Id(String),
    /// Identifier or name; the identifier lookup is tried first.
    Name(String),
}

impl FlavorSpec {
    /// Reads `nova.flavor_id` / `nova.flavor` from the environment entry.
    ///
    /// # Errors
    ///
    /// Returns [`FlavorError::Conflicting`] when both are set and
    /// [`FlavorError::Missing`] when neither is.
    pub fn from_environment(environment: &ConfigTree) -> Result<Self, FlavorError> {
        match (
            scalar(environment, "nova.flavor_id"),
            scalar(environment, "nova.flavor"),
        ) {
            (Some(_), Some(_)) => Err(FlavorError::Conflicting),
            (Some(id), None) => Ok(Self::Id(id)),
            (None, Some(name)) => Ok(Self::Name(name)),
            (None, None) => Err(FlavorError::Missing),
        }
    }
}

/// Everything a [`super::ProvisioningSession`] needs to run.
#[derive(Clone, Debug)]
pub struct SessionPlan {
    /// Name shared by the created keypair and instance.
    pub name: String,
    /// Boot image source.
    pub image: ImageSource,
    /// Compute flavor.
    pub flavor: FlavorSpec,
    /// Requested interfaces.
    pub nics: Vec<NicRequest>,
    /// Attach a config drive.
    pub config_drive: bool,
    /// User data passed to the instance.
    pub user_data: Option<String>,
    /// Availability zone override.
    pub availability_zone: Option<String>,
    /// Network-name filter used to pick the primary IP.
    pub main_nic_regexp: Option<Regex>,
    /// SSH settings, when the image declares `tests.ssh`.
    pub ssh: Option<SshSettings>,
    /// Per-step limits.
    pub timeouts: SessionTimeouts,
}

impl SessionPlan {
    /// Resolves a plan from the image entry and the test environment entry.
    ///
    /// `existing_image` replaces the upload with a reference to an existing
    /// image; `input` overrides the image entry's `filename`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] for invalid or missing fields and
    /// [`ProvisionError::Flavor`] when the flavor selection is invalid.
    pub fn from_config(
        image: &ConfigTree,
        environment: &ConfigTree,
        existing_image: Option<&str>,
        input: Option<&Utf8Path>,
    ) -> Result<Self, ProvisionError> {
        let name = resource_name();
        let image_source = match existing_image {
            Some(id) => ImageSource::Existing(id.to_owned()),
            None => ImageSource::Upload(image_upload(&name, image, environment, input)?),
        };
        let flavor = FlavorSpec::from_environment(environment)?;
        let main_nic_regexp = scalar(environment, "nova.main_nic_regexp")
            .map(|pattern| {
                Regex::new(&pattern)
                    .map_err(|err| invalid("nova.main_nic_regexp", err.to_string()))
            })
            .transpose()?;

        Ok(Self {
            name,
            image: image_source,
            flavor,
            nics: nics(environment)?,
            config_drive: flag(environment, "nova.config_drive")?.unwrap_or(false),
            user_data: user_data(environment)?,
            availability_zone: scalar(environment, "nova.availability_zone"),
            main_nic_regexp,
            ssh: ssh_settings(image)?,
            timeouts: SessionTimeouts::resolve(image, environment),
        })
    }
}

/// Builds an upload request from the merged `glance` sections.
///
/// The image file is the image entry's `filename` unless `input` is given.
///
/// # Errors
///
/// Returns [`ConfigError::Merge`] when the sections cannot be merged,
/// [`ConfigError::MissingField`] when the file name is missing and
/// [`ConfigError::InvalidField`] when a field has the wrong type.
pub fn image_upload(
    name: &str,
    image: &ConfigTree,
    environment: &ConfigTree,
    input: Option<&Utf8Path>,
) -> Result<ImageUpload, ConfigError> {
    let filename = match input {
        Some(path) => path.to_path_buf(),
        None => image
            .get_str("filename")
            .map(Utf8PathBuf::from)
            .ok_or_else(|| ConfigError::MissingField(String::from("filename")))?,
    };
    upload_request(name, filename, image, environment)
}

/// Checks the merged `glance` sections without requiring an image file.
pub(crate) fn check_glance(image: &ConfigTree, environment: &ConfigTree) -> Result<(), ConfigError> {
    upload_request("", Utf8PathBuf::new(), image, environment).map(drop)
}

fn upload_request(
    name: &str,
    filename: Utf8PathBuf,
    image: &ConfigTree,
    environment: &ConfigTree,
) -> Result<ImageUpload, ConfigError> {
    let merged = merge_glance(image, environment)?.into_tree();

    let properties = match merged.get("properties") {
        None => BTreeMap::new(),
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(_) => return Err(invalid("glance.properties", "must be a mapping")),
    };
    let tags = match merged.get("tags") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(render_scalar).collect(),
        Some(_) => return Err(invalid("glance.tags", "must be a list")),
    };

    Ok(ImageUpload {
        name: name.to_owned(),
        filename,
        disk_format: merged
            .get_str("disk_format")
            .unwrap_or("qcow2")
            .to_owned(),
        container_format: merged
            .get_str("container_format")
            .unwrap_or("bare")
            .to_owned(),
        min_disk: in_glance(number(&merged, "min_disk"))?.unwrap_or(0),
        min_ram: in_glance(number(&merged, "min_ram"))?.unwrap_or(0),
        protected: in_glance(flag(&merged, "protected"))?.unwrap_or(false),
        public: in_glance(flag(&merged, "public"))?.unwrap_or(false),
        tags,
        properties,
    })
}

/// Reads the name an image is published under from the merged `glance`
/// sections.
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] when `glance.name` is absent and
/// [`ConfigError::InvalidField`] when it is not a non-empty string.
pub fn published_name(image: &ConfigTree, environment: &ConfigTree) -> Result<String, ConfigError> {
    let merged = merge_glance(image, environment)?.into_tree();
    match merged.get("name") {
        None => Err(ConfigError::MissingField(String::from("glance.name"))),
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(name.clone()),
        Some(_) => Err(invalid("glance.name", "must be a non-empty string")),
    }
}

/// Builds the upload request for publishing: the image keeps its
/// configured `glance.name` instead of a generated resource name.
///
/// # Errors
///
/// Returns the errors of [`published_name`] and [`image_upload`].
pub fn published_upload(
    image: &ConfigTree,
    environment: &ConfigTree,
    input: Option<&Utf8Path>,
) -> Result<ImageUpload, ConfigError> {
    let name = published_name(image, environment)?;
    image_upload(&name, image, environment, input)
}

fn nics(environment: &ConfigTree) -> Result<Vec<NicRequest>, ConfigError> {
    let Some(value) = environment.get("nova.nics") else {
        return Ok(Vec::new());
    };
    let Value::Array(entries) = value else {
        return Err(invalid("nova.nics", "must be a list"));
    };
    entries
        .iter()
        .map(|entry| {
            let nic = ConfigTree::new(entry.clone());
            if !entry.is_object() {
                return Err(invalid("nova.nics", "entries must be mappings"));
            }
            let request = NicRequest {
                net_id: scalar(&nic, "net_id"),
                v4_fixed_ip: scalar(&nic, "v4_fixed_ip"),
                v6_fixed_ip: scalar(&nic, "v6_fixed_ip"),
                port_id: scalar(&nic, "port_id"),
                tag: scalar(&nic, "tag"),
            };
            if request.v4_fixed_ip.is_some() && request.v6_fixed_ip.is_some() {
                return Err(invalid(
                    "nova.nics",
                    "an entry may set v4_fixed_ip or v6_fixed_ip, not both",
                ));
            }
            Ok(request)
        })
        .collect()
}

fn user_data(environment: &ConfigTree) -> Result<Option<String>, ConfigError> {
    if let Some(inline) = scalar(environment, "nova.userdata") {
        return Ok(Some(inline));
    }
    scalar(environment, "nova.userdata_file")
        .map(|path| read_config(Utf8Path::new(&path)))
        .transpose()
}

pub(crate) fn ssh_settings(image: &ConfigTree) -> Result<Option<SshSettings>, ConfigError> {
    if !image.contains("tests.ssh") {
        return Ok(None);
    }
    let username = scalar(image, "tests.ssh.username")
        .ok_or_else(|| ConfigError::MissingField(String::from("tests.ssh.username")))?;
    let port = match number(image, "tests.ssh.port")? {
        None => DEFAULT_SSH_PORT,
        Some(port) => u16::try_from(port)
            .map_err(|_| invalid("tests.ssh.port", format!("{port} is out of range")))?,
    };
    Ok(Some(SshSettings { username, port }))
}

fn scalar(tree: &ConfigTree, path: &str) -> Option<String> {
    tree.get(path).map(render_scalar)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn number(tree: &ConfigTree, path: &str) -> Result<Option<u64>, ConfigError> {
    match tree.get(path) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(path, "must be a non-negative integer")),
    }
}

fn flag(tree: &ConfigTree, path: &str) -> Result<Option<bool>, ConfigError> {
    match tree.get(path) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(path, "must be a boolean")),
    }
}

fn in_glance<T>(result: Result<T, ConfigError>) -> Result<T, ConfigError> {
    result.map_err(|err| match err {
        ConfigError::InvalidField { field, message } => ConfigError::InvalidField {
            field: format!("glance.{field}"),
            message,
        },
        other => other,
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_owned(),
        message: message.into(),
    }
}
