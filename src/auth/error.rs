//! Negotiation failures. All of them are terminal for a session.

use thiserror::Error;

use crate::control_plane::ControlPlaneError;

/// Errors raised while agreeing on an API version and assembling credentials.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NegotiationError {
    /// Raised when the discovery document cannot be fetched or parsed.
    #[error("unable to discover identity API version at {url}: {message}")]
    Discovery {
        /// Endpoint that was probed.
        url: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when the endpoint offers no version this tool speaks.
    #[error(
        "no common identity API version: server offers [{}], this tool supports [{}]",
        .offered.join(", "),
        .supported.join(", ")
    )]
    Mismatch {
        /// Version ids advertised by the server.
        offered: Vec<String>,
        /// Major versions supported locally.
        supported: Vec<String>,
    },
    /// Raised when the configuration forces a version this tool cannot speak.
    #[error("identity API version {declared} is not supported")]
    UnsupportedVersion {
        /// Version declared in configuration.
        declared: String,
    },
    /// Raised when no source provides a credential field without a default.
    #[error("unable to find value for {field}; aliases (case-insensitive): {}", .aliases.join(", "))]
    CredentialNotFound {
        /// Logical field name.
        field: &'static str,
        /// Accepted aliases, in lookup order.
        aliases: &'static [&'static str],
    },
    /// Raised when the identity service refuses to issue a token.
    #[error("authentication failed: {0}")]
    Rejected(#[source] ControlPlaneError),
}
