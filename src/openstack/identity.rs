//! Token issuance against Keystone v2.0 and v3.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use zeroize::Zeroizing;

use crate::auth::{ApiVersion, AuthParameters, Credentials};
use crate::control_plane::ControlPlaneError;

use super::{check_status, decode_json, transport_error};

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Token and service endpoints returned by the identity service.
pub(crate) struct IssuedToken {
    pub(crate) token: Zeroizing<String>,
    pub(crate) catalog: Vec<CatalogEntry>,
}

/// Public endpoint of one catalog service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CatalogEntry {
    pub(crate) service_type: String,
    pub(crate) url: String,
}

impl IssuedToken {
    pub(crate) fn endpoint(&self, service_type: &str) -> Result<String, ControlPlaneError> {
        self.catalog
            .iter()
            .find(|entry| entry.service_type == service_type)
            .map(|entry| entry.url.trim_end_matches('/').to_owned())
            .ok_or_else(|| ControlPlaneError::MissingEndpoint {
                service: service_type.to_owned(),
            })
    }
}

/// Returns the versioned identity base for `auth_url`, replacing any version
/// segment already present.
pub(crate) fn identity_base(auth_url: &str, version: ApiVersion) -> String {
    let trimmed = auth_url.trim_end_matches('/');
    let root = trimmed
        .strip_suffix("/v2.0")
        .or_else(|| trimmed.strip_suffix("/v3"))
        .unwrap_or(trimmed);
    format!("{root}/{}", version.path_segment())
}

pub(crate) async fn issue_token(
    http: &Client,
    credentials: &Credentials,
) -> Result<IssuedToken, ControlPlaneError> {
    match credentials.auth_parameters() {
        AuthParameters::V3 {
            auth_url,
            username,
            password,
            user_domain_name,
            project_domain_name,
            project_name,
        } => {
            let url = format!("{}/auth/tokens", identity_base(auth_url, ApiVersion::V3));
            let body = json!({
                "auth": {
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": username,
                                "domain": {"name": user_domain_name},
                                "password": password,
                            }
                        }
                    },
                    "scope": {
                        "project": {
                            "name": project_name,
                            "domain": {"name": project_domain_name},
                        }
                    }
                }
            });
            debug!(url = %url, "requesting v3 token");
            let response = http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;
            let response = check_status(response, "token", username).await?;
            let token = response
                .headers()
                .get(SUBJECT_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| Zeroizing::new(value.to_owned()))
                .ok_or_else(|| ControlPlaneError::InvalidResponse {
                    endpoint: url.clone(),
                    message: format!("missing {SUBJECT_TOKEN_HEADER} header"),
                })?;
            let body: V3TokenResponse = decode_json(response, &url).await?;
            Ok(IssuedToken {
                token,
                catalog: body.catalog_entries(),
            })
        }
        AuthParameters::V2 {
            auth_url,
            tenant_name,
            username,
            password,
        } => {
            let url = format!("{}/tokens", identity_base(auth_url, ApiVersion::V2));
            let body = json!({
                "auth": {
                    "tenantName": tenant_name,
                    "passwordCredentials": {"username": username, "password": password},
                }
            });
            debug!(url = %url, "requesting v2.0 token");
            let response = http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;
            let response = check_status(response, "token", username).await?;
            let body: V2TokenResponse = decode_json(response, &url).await?;
            Ok(body.into_issued())
        }
    }
}

#[derive(Deserialize)]
struct V3TokenResponse {
    token: V3Token,
}

#[derive(Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3Service>,
}

#[derive(Deserialize)]
struct V3Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Deserialize)]
struct V3Endpoint {
    interface: String,
    url: String,
}

impl V3TokenResponse {
    fn catalog_entries(self) -> Vec<CatalogEntry> {
        self.token
            .catalog
            .into_iter()
            .filter_map(|service| {
                let service_type = service.service_type;
                service
                    .endpoints
                    .into_iter()
                    .find(|endpoint| endpoint.interface == "public")
                    .map(|endpoint| CatalogEntry {
                        service_type,
                        url: endpoint.url,
                    })
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct V2TokenResponse {
    access: V2Access,
}

#[derive(Deserialize)]
struct V2Access {
    token: V2Token,
    #[serde(default, rename = "serviceCatalog")]
    service_catalog: Vec<V2Service>,
}

#[derive(Deserialize)]
struct V2Token {
    id: String,
}

#[derive(Deserialize)]
struct V2Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Deserialize)]
struct V2Endpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
}

impl V2TokenResponse {
    fn into_issued(self) -> IssuedToken {
        let catalog = self
            .access
            .service_catalog
            .into_iter()
            .filter_map(|service| {
                let service_type = service.service_type;
                service
                    .endpoints
                    .into_iter()
                    .next()
                    .map(|endpoint| CatalogEntry {
                        service_type,
                        url: endpoint.public_url,
                    })
            })
            .collect();
        IssuedToken {
            token: Zeroizing::new(self.access.token.id),
            catalog,
        }
    }
}
