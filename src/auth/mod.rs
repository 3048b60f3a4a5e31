//! Identity API negotiation and credential resolution.
//!
//! [`build_client`] resolves credentials from the declared `keystone`
//! section and `OS_*` overrides, settles on an API version (declared or
//! discovered), and returns an authenticated [`OpenStackClient`].

mod credentials;
mod error;
mod version;

use tracing::info;

pub use credentials::{
    AuthParameters, CredentialField, CredentialSource, Credentials, OVERRIDE_PREFIX,
    ResolvedFields, declared_source, filter_overrides, resolve_credentials, resolve_field,
};
pub use error::NegotiationError;
pub use version::{
    ApiVersion, CLIENT_VERSIONS, DiscoveryDocument, SUPPORTED_VERSIONS, VersionEntry, VersionList,
    declared_version, discover_version, is_supported, major_version,
};

use std::time::Duration;

use crate::config::{ConfigError, ConfigTree, VetterSettings, merge_glance, read_config};
use crate::openstack::{EndpointOverrides, OpenStackClient, TransportOptions};

/// Everything needed to authenticate besides the credentials themselves.
#[derive(Clone, Debug, Default)]
pub struct ClientSettings {
    /// HTTP transport configuration.
    pub transport: TransportOptions,
    /// Service endpoint overrides.
    pub endpoints: EndpointOverrides,
}

impl ClientSettings {
    /// Combines tool settings with the `nova.endpoint` and merged
    /// `glance.endpoint` overrides of the image and environment entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the CA bundle cannot be read and
    /// [`ConfigError::Merge`] when the `glance` sections conflict.
    pub fn resolve(
        settings: &VetterSettings,
        image: &ConfigTree,
        environment: &ConfigTree,
    ) -> Result<Self, ConfigError> {
        let ca_pem = settings
            .ca_bundle()
            .map(|path| read_config(path).map(String::into_bytes))
            .transpose()?;
        let glance = merge_glance(image, environment)?;
        Ok(Self {
            transport: TransportOptions {
                request_timeout: Some(Duration::from_secs(settings.http_timeout_secs)),
                insecure: settings.insecure,
                ca_pem,
            },
            endpoints: EndpointOverrides {
                compute: environment.get_str("nova.endpoint").map(str::to_owned),
                image: glance
                    .get("endpoint")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
            },
        })
    }
}

/// Builds an authenticated client from the `keystone` section and process
/// overrides.
///
/// Credentials are resolved before any network call so that a missing field
/// fails fast and discovery can probe the resolved `auth_url`.
///
/// # Errors
///
/// Returns [`NegotiationError::CredentialNotFound`] for unresolvable
/// fields, [`NegotiationError::UnsupportedVersion`],
/// [`NegotiationError::Discovery`] or [`NegotiationError::Mismatch`] when no
/// version can be agreed on, and [`NegotiationError::Rejected`] when the
/// identity service refuses the credentials.
pub async fn build_client(
    keystone: &ConfigTree,
    overrides: &CredentialSource,
    settings: &ClientSettings,
) -> Result<OpenStackClient, NegotiationError> {
    let declared = declared_source(keystone.as_value());
    let fields = resolve_credentials(&declared, overrides)?;
    let http = settings
        .transport
        .build_http_client()
        .map_err(NegotiationError::Rejected)?;

    let api_version = match declared.get("api_version") {
        Some(raw) => declared_version(raw, CLIENT_VERSIONS)?,
        None => discover_version(&http, fields.auth_url(), CLIENT_VERSIONS).await?,
    };
    info!(version = %api_version, auth_url = fields.auth_url(), "negotiated identity API");

    OpenStackClient::authenticate(http, fields.with_version(api_version), &settings.endpoints)
        .await
        .map_err(NegotiationError::Rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn environment_endpoint_overrides_image_endpoint() {
        let image = ConfigTree::new(json!({"glance": {"endpoint": "http://image.local"}}));
        let environment = ConfigTree::new(json!({
            "glance": {"endpoint": "http://glance.env"},
            "nova": {"endpoint": "http://nova.env"},
        }));

        let settings = ClientSettings::resolve(&VetterSettings::default(), &image, &environment)
            .unwrap_or_else(|err| panic!("resolve: {err}"));

        assert_eq!(settings.endpoints.image.as_deref(), Some("http://glance.env"));
        assert_eq!(settings.endpoints.compute.as_deref(), Some("http://nova.env"));
        assert_eq!(
            settings.transport.request_timeout,
            Some(Duration::from_secs(crate::config::DEFAULT_HTTP_TIMEOUT_SECS))
        );
    }

    #[test]
    fn missing_ca_bundle_is_an_io_error() {
        let settings = VetterSettings {
            ca_path: Some(String::from("/nonexistent/vetter/ca.pem")),
            ..VetterSettings::default()
        };
        let err = ClientSettings::resolve(&settings, &ConfigTree::empty(), &ConfigTree::empty())
            .expect_err("missing bundle should fail");
        assert!(matches!(err, ConfigError::Io { .. }), "unexpected error: {err}");
    }
}
