//! Errors raised while provisioning a test environment.

use thiserror::Error;

use crate::auth::NegotiationError;
use crate::config::ConfigError;
use crate::control_plane::ControlPlaneError;
use crate::deadline::DeadlineError;

/// Why a compute flavor could not be resolved.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FlavorError {
    /// Both `nova.flavor` and `nova.flavor_id` are configured.
    #[error("both nova.flavor and nova.flavor_id are configured")]
    Conflicting,
    /// Neither `nova.flavor` nor `nova.flavor_id` is configured.
    #[error("neither nova.flavor nor nova.flavor_id is configured")]
    Missing,
    /// No flavor matches.
    #[error("flavor {0} not found")]
    NotFound(String),
    /// Several flavors share the requested name.
    #[error("flavor name {name} matches {count} flavors")]
    Ambiguous {
        /// Requested name.
        name: String,
        /// Number of matches.
        count: usize,
    },
}

/// Errors raised by [`super::ProvisioningSession`].
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when the session inputs are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when credentials or the API version cannot be settled.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    /// Raised when the compute flavor cannot be resolved.
    #[error("flavor resolution failed: {0}")]
    Flavor(#[from] FlavorError),
    /// Raised when no network matches the primary-IP selection.
    #[error("no matching IP found (regexp: {}, networks: [{}])", .pattern.as_deref().unwrap_or("none"), .networks.join(", "))]
    NoIpFound {
        /// Network-name regexp, if any.
        pattern: Option<String>,
        /// Networks attached to the instance.
        networks: Vec<String>,
    },
    /// Raised when more than one network matches the primary-IP selection.
    #[error("more than one network matches (regexp: {}): [{}]", .pattern.as_deref().unwrap_or("none"), .matches.join(", "))]
    MultipleIp {
        /// Network-name regexp, if any.
        pattern: Option<String>,
        /// Matching networks.
        matches: Vec<String>,
    },
    /// Raised when a step does not finish in time.
    #[error("{step} did not finish within {limit_secs} s{}", .resource.as_ref().map(|id| format!(" (resource {id})")).unwrap_or_default())]
    DeadlineExceeded {
        /// Name of the step.
        step: &'static str,
        /// Limit that was applied, in seconds.
        limit_secs: u64,
        /// Resource the step was working on, if known.
        resource: Option<String>,
    },
    /// Raised when the instance reaches a failed status.
    #[error("instance {id} state is '{status}' (expected 'ACTIVE'): {}", .fault.as_deref().unwrap_or("no message"))]
    Instance {
        /// Instance identifier.
        id: String,
        /// Status reported by the provider.
        status: String,
        /// Fault message reported by the provider.
        fault: Option<String>,
    },
    /// Raised when a remote call fails.
    #[error("{step} failed: {source}")]
    ControlPlane {
        /// Name of the step.
        step: &'static str,
        /// Error returned by the control plane.
        #[source]
        source: ControlPlaneError,
    },
    /// Raised when a background task is torn down.
    #[error("{step} was aborted: {message}")]
    Aborted {
        /// Name of the step.
        step: &'static str,
        /// Description of the abort.
        message: String,
    },
    /// Raised when SSH key material cannot be written.
    #[error("failed to write SSH key material: {0}")]
    KeyMaterial(String),
}

impl ProvisionError {
    /// Converts a deadline-wrapped control-plane failure.
    pub(crate) fn from_deadline(
        err: DeadlineError<ControlPlaneError>,
        resource: Option<&str>,
    ) -> Self {
        match err {
            DeadlineError::Exceeded { step, limit } => Self::DeadlineExceeded {
                step,
                limit_secs: limit.as_secs(),
                resource: resource.map(str::to_owned),
            },
            DeadlineError::Failed { step, source } => Self::ControlPlane { step, source },
            DeadlineError::Aborted { step, message } => Self::Aborted { step, message },
        }
    }

    /// Converts a deadline-wrapped session failure, keeping inner errors.
    pub(crate) fn from_nested(err: DeadlineError<Self>, resource: Option<&str>) -> Self {
        match err {
            DeadlineError::Exceeded { step, limit } => Self::DeadlineExceeded {
                step,
                limit_secs: limit.as_secs(),
                resource: resource.map(str::to_owned),
            },
            DeadlineError::Failed { source, .. } => source,
            DeadlineError::Aborted { step, message } => Self::Aborted { step, message },
        }
    }

    /// The control-plane error behind this failure, if any.
    #[must_use]
    pub const fn control_plane(&self) -> Option<&ControlPlaneError> {
        match self {
            Self::ControlPlane { source, .. } | Self::Negotiation(NegotiationError::Rejected(source)) => {
                Some(source)
            }
            _ => None,
        }
    }
}
