//! Value types exchanged with the control plane.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;
use zeroize::Zeroizing;

/// Freshly generated SSH keypair. The private key never leaves memory unless
/// the caller explicitly keeps it.
#[derive(Clone)]
pub struct Keypair {
    /// Name registered with the provider.
    pub name: String,
    /// PEM encoded private key.
    pub private_key: Zeroizing<String>,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Image known to the image service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image {
    /// Provider identifier.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Provider status string (for example `active`).
    pub status: String,
    /// Flagged as superseded by a newer upload of the same name.
    pub obsolete: bool,
}

/// Filter applied to image listings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageQuery {
    /// Exact image name.
    pub name: Option<String>,
    /// Only images flagged obsolete.
    pub obsolete: bool,
}

impl ImageQuery {
    /// Images called exactly `name`.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            obsolete: false,
        }
    }

    /// Returns `true` when `image` passes the filter.
    #[must_use]
    pub fn matches(&self, image: &Image) -> bool {
        self.name.as_ref().is_none_or(|name| *name == image.name)
            && (!self.obsolete || image.obsolete)
    }
}

/// Parameters for an image upload.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageUpload {
    /// Name of the new image.
    pub name: String,
    /// Local file streamed as the image body.
    pub filename: Utf8PathBuf,
    /// Disk format, `qcow2` by default.
    pub disk_format: String,
    /// Container format, `bare` by default.
    pub container_format: String,
    /// Minimum disk size in GiB.
    pub min_disk: u64,
    /// Minimum RAM in MiB.
    pub min_ram: u64,
    /// Protects the image against deletion.
    pub protected: bool,
    /// Publishes the image to every project.
    pub public: bool,
    /// Image tags.
    pub tags: Vec<String>,
    /// Free-form image properties.
    pub properties: BTreeMap<String, Value>,
}

/// One requested network interface.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NicRequest {
    /// Network to attach to.
    pub net_id: Option<String>,
    /// Fixed IPv4 address.
    pub v4_fixed_ip: Option<String>,
    /// Fixed IPv6 address.
    pub v6_fixed_ip: Option<String>,
    /// Pre-created port to attach.
    pub port_id: Option<String>,
    /// Device tag.
    pub tag: Option<String>,
}

impl NicRequest {
    /// The requested fixed address. Plans reject interfaces that set both
    /// families.
    #[must_use]
    pub const fn fixed_ip(&self) -> Option<&String> {
        match (&self.v4_fixed_ip, &self.v6_fixed_ip) {
            (Some(address), _) | (None, Some(address)) => Some(address),
            (None, None) => None,
        }
    }
}

/// Parameters for booting an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootRequest {
    /// Instance name.
    pub name: String,
    /// Image to boot from.
    pub image_id: String,
    /// Flavor to boot with.
    pub flavor_id: String,
    /// Keypair injected into the instance.
    pub key_name: String,
    /// Requested interfaces, in order.
    pub nics: Vec<NicRequest>,
    /// Attach a config drive.
    pub config_drive: bool,
    /// Raw user data, encoded by the client.
    pub user_data: Option<String>,
    /// Availability zone override.
    pub availability_zone: Option<String>,
}

/// Lifecycle status reported for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    /// Still being scheduled or built.
    Building,
    /// Running and ready.
    Active,
    /// Failed to build or crashed.
    Error,
    /// Removed by the provider or another actor.
    Deleted,
    /// Any other provider status.
    Other(String),
}

impl InstanceStatus {
    /// Parses a provider status string case-insensitively.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "BUILD" | "BUILDING" => Self::Building,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error,
            "DELETED" | "SOFT_DELETED" => Self::Deleted,
            _ => Self::Other(status.to_owned()),
        }
    }

    /// Returns `true` for statuses that will never become active.
    #[must_use]
    pub const fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Deleted)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => f.write_str("BUILDING"),
            Self::Active => f.write_str("ACTIVE"),
            Self::Error => f.write_str("ERROR"),
            Self::Deleted => f.write_str("DELETED"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// Current view of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Fault message reported with a failed status.
    pub fault: Option<String>,
    /// Image the instance was booted from.
    pub image_id: Option<String>,
    /// Addresses keyed by network name.
    pub networks: BTreeMap<String, Vec<String>>,
}

impl Instance {
    /// All addresses across every network, in network-name order.
    #[must_use]
    pub fn ips(&self) -> Vec<&str> {
        self.networks
            .values()
            .flat_map(|addresses| addresses.iter().map(String::as_str))
            .collect()
    }
}

/// Compute shape used to boot an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Flavor {
    /// Provider identifier.
    pub id: String,
    /// Flavor name.
    pub name: String,
    /// RAM in MiB.
    pub ram: u64,
    /// Virtual CPU count.
    pub vcpus: u64,
    /// Root disk in GiB.
    pub disk: u64,
    /// Extra specs attached to the flavor.
    pub extra_specs: BTreeMap<String, String>,
}

/// Network interface attached to an instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Interface {
    /// Port identifier.
    pub port_id: String,
    /// Network identifier.
    pub net_id: String,
    /// Hardware address.
    pub mac_addr: String,
    /// Port state reported by the provider.
    pub port_state: String,
    /// Fixed addresses assigned to the port.
    pub fixed_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ACTIVE", InstanceStatus::Active)]
    #[case("active", InstanceStatus::Active)]
    #[case("BUILD", InstanceStatus::Building)]
    #[case("ERROR", InstanceStatus::Error)]
    #[case("DELETED", InstanceStatus::Deleted)]
    #[case("SHUTOFF", InstanceStatus::Other(String::from("SHUTOFF")))]
    fn parses_provider_statuses(#[case] raw: &str, #[case] expected: InstanceStatus) {
        assert_eq!(InstanceStatus::from_provider(raw), expected);
    }

    #[test]
    fn keypair_debug_hides_private_key() {
        let keypair = Keypair {
            name: String::from("VETTER-1"),
            private_key: Zeroizing::new(String::from("-----BEGIN KEY-----secret")),
        };
        let rendered = format!("{keypair:?}");
        assert!(rendered.contains("VETTER-1"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn instance_ips_flatten_networks() {
        let instance = Instance {
            id: String::from("i-1"),
            name: String::from("vm"),
            status: InstanceStatus::Active,
            fault: None,
            image_id: None,
            networks: BTreeMap::from([
                (String::from("b"), vec![String::from("10.0.0.2")]),
                (
                    String::from("a"),
                    vec![String::from("192.0.2.1"), String::from("2001:db8::1")],
                ),
            ]),
        };
        assert_eq!(instance.ips(), vec!["192.0.2.1", "2001:db8::1", "10.0.0.2"]);
    }
}
