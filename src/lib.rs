//! Core library for the vetter cloud image test tool.
//!
//! The crate provisions a disposable environment (keypair, image, instance)
//! on an `OpenStack` control plane, runs test adapters against it, and
//! removes everything it created regardless of how the run ends
//! (keypair → image → instance → network → SSH, then cleanup in reverse
//! dependency order). Every remote call runs under a [`deadline::Deadline`].
//!
//! Images can also be published for good: a new upload retires older
//! images of the same name, and [`rotation`] removes retired images no
//! instance uses.

pub mod auth;
pub mod config;
pub mod control_plane;
pub mod deadline;
pub mod harness;
pub mod openstack;
pub mod probe;
pub mod process;
pub mod rotation;
pub mod session;
pub mod test_support;
pub mod validate;

pub use auth::{ClientSettings, NegotiationError, build_client};
pub use config::{ConfigError, ConfigFile, ConfigKind, ConfigTree, VetterSettings};
pub use control_plane::{ControlPlane, ControlPlaneError};
pub use deadline::{Deadline, DeadlineError, run_with_deadline};
pub use harness::{HarnessError, KeepPolicy, TestPlan, TestRunner, run_session};
pub use openstack::OpenStackClient;
pub use probe::{ProbeError, wait_for_port};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use rotation::{Rotation, mark_obsolete, obsolete_older_images, rotate};
pub use session::{ProvisionError, ProvisioningSession, SessionPlan, publish_image};
pub use validate::{InvalidEntry, Validation, validate};
