//! Errors raised by the test harness.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::probe::ProbeError;
use crate::process::CommandError;
use crate::session::ProvisionError;

/// Errors that stop a test run before or between adapters.
///
/// A failing test is not an error; it is reported through the run result.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Raised when the image has no `tests` section.
    #[error("no tests section was defined for image {image}")]
    MissingTests {
        /// Image label.
        image: String,
    },
    /// Raised when neither the command line nor the image names an
    /// environment.
    #[error("no test environment given on the command line or in tests.environment_name")]
    MissingEnvironment,
    /// Raised when a test descriptor is malformed.
    #[error("test #{index} is invalid: {message}")]
    InvalidDescriptor {
        /// Position of the descriptor in `tests.tests_list`, from one.
        index: usize,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a test section field has the wrong shape.
    #[error("invalid tests configuration: {0}")]
    InvalidConfig(String),
    /// Raised when a shell test path is neither an executable nor a
    /// directory.
    #[error("path {path} is not a test file or a directory")]
    InvalidTestPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when a test directory cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// Raised when an adapter worker panicked or was torn down.
    #[error("test adapter for {path} was aborted: {message}")]
    Aborted {
        /// Test path the adapter was running.
        path: Utf8PathBuf,
        /// Description of the abort.
        message: String,
    },
    /// Raised when an adapter process cannot be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the instance port does not open in time.
    #[error(transparent)]
    PortTimeout(#[from] ProbeError),
    /// Raised when provisioning fails.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}
