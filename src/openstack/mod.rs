//! REST implementation of [`ControlPlane`] for `OpenStack` clouds.
//!
//! Authentication goes through Keystone (v2.0 or v3), after which compute
//! calls use the Nova endpoint and image calls the Glance v2 endpoint from
//! the service catalog, unless an endpoint override is configured.

mod compute;
mod identity;
mod image;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use zeroize::Zeroizing;

use crate::auth::Credentials;
use crate::control_plane::{
    BootRequest, ControlPlane, ControlPlaneError, Flavor, Image, ImageQuery, ImageUpload, Instance,
    Interface, Keypair, PlaneFuture,
};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const USER_AGENT: &str = concat!("vetter/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport settings for the HTTP client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransportOptions {
    /// Per-request timeout.
    pub request_timeout: Option<Duration>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// PEM bundle added to the trusted roots.
    pub ca_pem: Option<Vec<u8>>,
}

impl TransportOptions {
    /// Builds the HTTP client used for discovery and every API call.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Transport`] when the CA bundle is
    /// invalid or the client cannot be constructed.
    pub fn build_http_client(&self) -> Result<Client, ControlPlaneError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(self.insecure);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(pem) = &self.ca_pem {
            let certificate =
                reqwest::Certificate::from_pem(pem).map_err(|err| ControlPlaneError::Transport {
                    message: format!("invalid CA bundle: {err}"),
                })?;
            builder = builder.add_root_certificate(certificate);
        }
        builder.build().map_err(transport_error)
    }
}

/// Endpoints that replace the catalog entries when set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointOverrides {
    /// Compute (Nova) endpoint.
    pub compute: Option<String>,
    /// Image (Glance) endpoint, without the `/v2` suffix.
    pub image: Option<String>,
}

/// Authenticated `OpenStack` client.
pub struct OpenStackClient {
    http: Client,
    token: Zeroizing<String>,
    compute_url: String,
    image_url: String,
    credentials: Credentials,
}

impl fmt::Debug for OpenStackClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackClient")
            .field("compute_url", &self.compute_url)
            .field("image_url", &self.image_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl OpenStackClient {
    /// Requests a token and resolves the service endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Unauthorized`] when the identity service
    /// rejects the credentials and [`ControlPlaneError::MissingEndpoint`]
    /// when the catalog lacks a required service without an override.
    pub async fn authenticate(
        http: Client,
        credentials: Credentials,
        overrides: &EndpointOverrides,
    ) -> Result<Self, ControlPlaneError> {
        let issued = identity::issue_token(&http, &credentials).await?;
        let compute_url = match &overrides.compute {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => issued.endpoint("compute")?,
        };
        let image_url = match &overrides.image {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => issued.endpoint("image")?,
        };
        debug!(compute = %compute_url, image = %image_url, "resolved service endpoints");
        Ok(Self {
            http,
            token: issued.token,
            compute_url,
            image_url,
            credentials,
        })
    }

    /// Credentials the client authenticated with.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn compute(&self, method: reqwest::Method, path: &str) -> (RequestBuilder, String) {
        let url = format!("{}/{path}", self.compute_url);
        (self.authorised(method, &url), url)
    }

    fn image(&self, method: reqwest::Method, path: &str) -> (RequestBuilder, String) {
        let url = format!("{}/v2/{path}", self.image_url);
        (self.authorised(method, &url), url)
    }

    fn authorised(&self, method: reqwest::Method, url: &str) -> RequestBuilder {
        debug!(method = %method, url = %url, "control plane request");
        self.http
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, self.token.as_str())
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport {
        message: err.to_string(),
    }
}

/// Maps error statuses onto [`ControlPlaneError`] kinds.
pub(crate) async fn check_status(
    response: Response,
    resource: &'static str,
    id: &str,
) -> Result<Response, ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => ControlPlaneError::Unauthorized { message },
        StatusCode::FORBIDDEN => ControlPlaneError::Forbidden { message },
        StatusCode::BAD_REQUEST => ControlPlaneError::BadRequest { message },
        StatusCode::NOT_FOUND => ControlPlaneError::NotFound {
            resource,
            id: id.to_owned(),
        },
        other => ControlPlaneError::Provider {
            status: other.as_u16(),
            message,
        },
    })
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: Response,
    endpoint: &str,
) -> Result<T, ControlPlaneError> {
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|err| ControlPlaneError::InvalidResponse {
        endpoint: endpoint.to_owned(),
        message: err.to_string(),
    })
}

impl ControlPlane for OpenStackClient {
    fn create_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Keypair> {
        Box::pin(compute::create_keypair(self, name))
    }

    fn delete_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, ()> {
        Box::pin(compute::delete_keypair(self, name))
    }

    fn create_image<'a>(&'a self, request: &'a ImageUpload) -> PlaneFuture<'a, Image> {
        Box::pin(image::create_image(self, request))
    }

    fn upload_image_data<'a>(
        &'a self,
        id: &'a str,
        request: &'a ImageUpload,
    ) -> PlaneFuture<'a, ()> {
        Box::pin(image::upload_image_data(self, id, request))
    }

    fn get_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Image> {
        Box::pin(image::get_image(self, id))
    }

    fn delete_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()> {
        Box::pin(image::delete_image(self, id))
    }

    fn list_images<'a>(&'a self, query: &'a ImageQuery) -> PlaneFuture<'a, Vec<Image>> {
        Box::pin(image::list_images(self, query))
    }

    fn mark_image_obsolete<'a>(&'a self, id: &'a str, name: &'a str) -> PlaneFuture<'a, Image> {
        Box::pin(image::mark_image_obsolete(self, id, name))
    }

    fn boot_instance<'a>(&'a self, request: &'a BootRequest) -> PlaneFuture<'a, Instance> {
        Box::pin(compute::boot_instance(self, request))
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Instance> {
        Box::pin(compute::get_instance(self, id))
    }

    fn delete_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()> {
        Box::pin(compute::delete_instance(self, id))
    }

    fn find_instances_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Instance>> {
        Box::pin(compute::find_instances_by_name(self, name))
    }

    fn images_in_use(&self) -> PlaneFuture<'_, BTreeSet<String>> {
        Box::pin(compute::images_in_use(self))
    }

    fn find_flavor_by_id<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Option<Flavor>> {
        Box::pin(compute::find_flavor_by_id(self, id))
    }

    fn find_flavor_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Flavor>> {
        Box::pin(compute::find_flavor_by_name(self, name))
    }

    fn list_interfaces<'a>(&'a self, instance_id: &'a str) -> PlaneFuture<'a, Vec<Interface>> {
        Box::pin(compute::list_interfaces(self, instance_id))
    }
}
