//! Error kinds reported by control-plane clients.

use thiserror::Error;

/// Errors raised by a [`super::ControlPlane`] implementation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// Raised when the identity service rejects the credentials or token.
    #[error("authentication rejected: {message}")]
    Unauthorized {
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the caller lacks permission for the request.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the provider rejects a malformed request, for example an
    /// unknown network.
    #[error("bad request: {message}")]
    BadRequest {
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when a referenced resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Kind of resource that was looked up.
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// Raised when a required service is missing from the catalog.
    #[error("no {service} endpoint in the service catalog")]
    MissingEndpoint {
        /// Catalog service type.
        service: String,
    },
    /// Raised when the provider answers with an unexpected status.
    #[error("provider returned status {status}: {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the provider cannot be reached.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
    /// Raised when a response body does not have the expected shape.
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse {
        /// Endpoint that produced the response.
        endpoint: String,
        /// Description of the decoding failure.
        message: String,
    },
    /// Raised when local I/O (for example reading the image file) fails.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Local path being read.
        path: String,
        /// Human-readable error message.
        message: String,
    },
}

impl ControlPlaneError {
    /// Returns `true` when the error means the resource is already gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
