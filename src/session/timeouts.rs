//! Per-step time limits resolved from image and environment configuration.

use std::time::Duration;

use crate::config::{ConfigTree, max_timeout};

/// Default limit for uploading an image.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(360);
/// Default limit for requesting an instance.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(360);
/// Default limit for waiting until the instance is active.
pub const DEFAULT_ACTIVE_TIMEOUT: Duration = Duration::from_secs(360);
/// Default limit for creating the keypair.
pub const DEFAULT_KEYPAIR_TIMEOUT: Duration = Duration::from_secs(10);
/// Default limit for each cleanup step.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Named limits for every provisioning step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionTimeouts {
    /// Keypair creation.
    pub keypair: Duration,
    /// Image upload or lookup.
    pub upload: Duration,
    /// Flavor resolution and boot request.
    pub create: Duration,
    /// Waiting for the instance to become active.
    pub active: Duration,
    /// Each individual cleanup step.
    pub cleanup: Duration,
}

impl SessionTimeouts {
    /// Resolves each limit as the maximum of the image and environment
    /// values, falling back to the defaults.
    #[must_use]
    pub fn resolve(image: &ConfigTree, environment: &ConfigTree) -> Self {
        let pick = |path, default| max_timeout(image, environment, path, default);
        Self {
            keypair: pick("nova.keypair_timeout", DEFAULT_KEYPAIR_TIMEOUT),
            upload: pick("glance.upload_timeout", DEFAULT_UPLOAD_TIMEOUT),
            create: pick("nova.create_timeout", DEFAULT_CREATE_TIMEOUT),
            active: pick("nova.active_timeout", DEFAULT_ACTIVE_TIMEOUT),
            cleanup: pick("nova.cleanup_timeout", DEFAULT_CLEANUP_TIMEOUT),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            keypair: DEFAULT_KEYPAIR_TIMEOUT,
            upload: DEFAULT_UPLOAD_TIMEOUT,
            create: DEFAULT_CREATE_TIMEOUT,
            active: DEFAULT_ACTIVE_TIMEOUT,
            cleanup: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}
