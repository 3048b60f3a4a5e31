//! Identity API version selection.

use std::fmt;

use serde::Deserialize;
use tracing::debug;

use super::NegotiationError;

/// Identity API major versions this tool knows how to speak.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ApiVersion {
    /// Keystone v2.0 (`/tokens`).
    V2,
    /// Keystone v3 (`/auth/tokens`).
    V3,
}

/// Versions supported by the negotiation layer.
pub const SUPPORTED_VERSIONS: &[ApiVersion] = &[ApiVersion::V2, ApiVersion::V3];

/// Versions implemented by the bundled REST client.
pub const CLIENT_VERSIONS: &[ApiVersion] = &[ApiVersion::V2, ApiVersion::V3];

impl ApiVersion {
    /// Maps a major number onto a known version.
    #[must_use]
    pub const fn from_major(major: u8) -> Option<Self> {
        match major {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    /// Major version number.
    #[must_use]
    pub const fn major(self) -> u8 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Path segment the identity endpoint is served under.
    #[must_use]
    pub const fn path_segment(self) -> &'static str {
        match self {
            Self::V2 => "v2.0",
            Self::V3 => "v3",
        }
    }

    /// Parses a version declared in configuration (`3`, `v3`, `2.0`,
    /// `v2.0`).
    #[must_use]
    pub fn parse_declared(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let major = digits.split('.').next()?.parse::<u8>().ok()?;
        Self::from_major(major)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.major())
    }
}

/// Returns `true` when `version` is usable both by this tool and by the
/// bundled client.
#[must_use]
pub fn is_supported(version: ApiVersion, client_versions: &[ApiVersion]) -> bool {
    SUPPORTED_VERSIONS.contains(&version) && client_versions.contains(&version)
}

/// Extracts the major version from a discovery id such as `v3.14`.
///
/// Only ids starting with `v` followed by a single digit strictly between 1
/// and 9 are recognised.
#[must_use]
pub fn major_version(id: &str) -> Option<u8> {
    let mut chars = id.chars();
    if chars.next()? != 'v' {
        return None;
    }
    let major = chars.next()?.to_digit(10)?;
    let major = u8::try_from(major).ok()?;
    (1 < major && major < 9).then_some(major)
}

/// Body returned by an identity endpoint's version discovery.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum DiscoveryDocument {
    /// A versioned endpoint describing itself.
    Single {
        /// The single advertised version.
        version: VersionEntry,
    },
    /// A root endpoint listing every available version.
    Multiple {
        /// The advertised versions.
        versions: VersionList,
    },
}

/// Wrapper around the list of versions in a multi-version document.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VersionList {
    /// Advertised versions, in server order.
    pub values: Vec<VersionEntry>,
}

/// One advertised version.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VersionEntry {
    /// Version id, for example `v3.14`.
    pub id: String,
    /// Server-reported status (`stable`, `deprecated`, ...).
    #[serde(default)]
    pub status: Option<String>,
}

impl DiscoveryDocument {
    /// Advertised version ids in server order.
    #[must_use]
    pub fn version_ids(&self) -> Vec<&str> {
        match self {
            Self::Single { version } => vec![version.id.as_str()],
            Self::Multiple { versions } => {
                versions.values.iter().map(|entry| entry.id.as_str()).collect()
            }
        }
    }

    /// Picks the first advertised version that is supported locally.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Mismatch`] when none is.
    pub fn select(&self, client_versions: &[ApiVersion]) -> Result<ApiVersion, NegotiationError> {
        let ids = self.version_ids();
        ids.iter()
            .filter_map(|id| major_version(id).and_then(ApiVersion::from_major))
            .find(|version| is_supported(*version, client_versions))
            .ok_or_else(|| NegotiationError::Mismatch {
                offered: ids.iter().map(|id| (*id).to_owned()).collect(),
                supported: SUPPORTED_VERSIONS
                    .iter()
                    .filter(|version| client_versions.contains(*version))
                    .map(ToString::to_string)
                    .collect(),
            })
    }
}

/// Validates a version forced by configuration.
///
/// # Errors
///
/// Returns [`NegotiationError::UnsupportedVersion`] when the declared value
/// is unknown or not implemented by the client.
pub fn declared_version(
    declared: &str,
    client_versions: &[ApiVersion],
) -> Result<ApiVersion, NegotiationError> {
    ApiVersion::parse_declared(declared)
        .filter(|version| is_supported(*version, client_versions))
        .ok_or_else(|| NegotiationError::UnsupportedVersion {
            declared: declared.to_owned(),
        })
}

/// Probes `auth_url` and selects the first supported advertised version.
///
/// # Errors
///
/// Returns [`NegotiationError::Discovery`] when the endpoint cannot be
/// reached or returns an unparsable body, and
/// [`NegotiationError::Mismatch`] when no advertised version is supported.
pub async fn discover_version(
    http: &reqwest::Client,
    auth_url: &str,
    client_versions: &[ApiVersion],
) -> Result<ApiVersion, NegotiationError> {
    let discovery_error = |message: String| NegotiationError::Discovery {
        url: auth_url.to_owned(),
        message,
    };

    debug!(url = auth_url, "probing identity versions");
    let response = http
        .get(auth_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|err| discovery_error(err.to_string()))?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(discovery_error(format!("endpoint returned status {status}")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| discovery_error(err.to_string()))?;
    let document: DiscoveryDocument =
        serde_json::from_slice(&body).map_err(|err| discovery_error(err.to_string()))?;
    document.select(client_versions)
}
