//! Command-line interface definitions for the `vetter` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser};

/// Top-level CLI for the `vetter` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vetter",
    about = "Boot a cloud image on a disposable instance, test it, and clean up",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Upload or reuse an image, boot an instance, and run its tests.
    #[command(name = "test", about = "Boot an image on a disposable instance and run its tests")]
    Test(TestCommand),
    /// Upload an image that outlives the run.
    #[command(name = "upload", about = "Upload an image to an upload environment")]
    Upload(UploadCommand),
    /// Delete obsolete images no instance uses.
    #[command(name = "rotate", about = "Remove unused obsolete images from an upload environment")]
    Rotate(RotateCommand),
    /// Delete obsolete copies of one image that no instance uses.
    #[command(
        name = "rotate-single",
        about = "Remove unused obsolete copies of one image from an upload environment"
    )]
    RotateSingle(RotateSingleCommand),
    /// Retire an image by id.
    #[command(name = "mark-obsolete", about = "Rename an image and flag it obsolete")]
    MarkObsolete(MarkObsoleteCommand),
    /// Check every configuration entry without contacting any service.
    #[command(name = "validate", about = "Validate the images, test and upload configuration files")]
    Validate(ValidateCommand),
}

impl Cli {
    /// Whether debug logging was requested.
    pub(crate) const fn debug(&self) -> bool {
        match self {
            Self::Test(command) => command.common.debug,
            Self::Upload(command) => command.common.debug,
            Self::Rotate(command) => command.debug,
            Self::RotateSingle(command) => command.debug,
            Self::MarkObsolete(command) => command.debug,
            Self::Validate(command) => command.debug,
        }
    }
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Path to `images.yaml`; searched for in `.`, `./vetter` and `/etc/vetter` when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) images_config: Option<PathBuf>,
    /// Image file to upload instead of the image entry's `filename`.
    #[arg(long, value_name = "PATH")]
    pub(crate) input: Option<PathBuf>,
    /// Enable debug logging (ignored when `RUST_LOG` is set).
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `vetter test` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TestCommand {
    /// Label of the image entry in `images.yaml`.
    #[arg(value_name = "IMAGE")]
    pub(crate) image: String,
    /// Label of the test environment in `test.yaml`.
    ///
    /// Defaults to the image entry's `tests.environment_name`.
    #[arg(long, value_name = "LABEL")]
    pub(crate) environment: Option<String>,
    /// Boot an existing image by id instead of uploading one.
    ///
    /// The image is never deleted afterwards.
    #[arg(long, value_name = "IMAGE_ID")]
    pub(crate) use_existing_image: Option<String>,
    /// Delete the image given to `--use-existing-image` once the run ends.
    #[arg(long, requires = "use_existing_image")]
    pub(crate) delete_existing_image: bool,
    /// Keep the uploaded image when the run fails.
    #[arg(long)]
    pub(crate) keep_failed_image: bool,
    /// Keep the instance and its keypair when the run fails.
    #[arg(long)]
    pub(crate) keep_failed_instance: bool,
    /// Run every test even after a failure. The run still fails.
    #[arg(long)]
    pub(crate) continue_on_fail: bool,
    /// Path to `test.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) test_config: Option<PathBuf>,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `vetter upload` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UploadCommand {
    /// Label of the image entry in `images.yaml`.
    #[arg(value_name = "IMAGE")]
    pub(crate) image: String,
    /// Label of the upload environment in `upload.yaml`.
    #[arg(value_name = "UPLOAD_ENV")]
    pub(crate) environment: String,
    /// Path to `upload.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) upload_config: Option<PathBuf>,
    /// Leave older images of the same name untouched.
    #[arg(long)]
    pub(crate) no_obsolete: bool,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `vetter rotate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RotateCommand {
    /// Label of the upload environment in `upload.yaml`.
    #[arg(value_name = "UPLOAD_ENV")]
    pub(crate) environment: String,
    /// List the images that would be removed without removing them.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Path to `upload.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) upload_config: Option<PathBuf>,
    /// Enable debug logging (ignored when `RUST_LOG` is set).
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `vetter rotate-single` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RotateSingleCommand {
    /// Label of the image entry in `images.yaml`; its `glance.name` selects the copies.
    #[arg(value_name = "IMAGE")]
    pub(crate) image: String,
    /// Label of the upload environment in `upload.yaml`.
    #[arg(value_name = "UPLOAD_ENV")]
    pub(crate) environment: String,
    /// List the images that would be removed without removing them.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Path to `images.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) images_config: Option<PathBuf>,
    /// Path to `upload.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) upload_config: Option<PathBuf>,
    /// Enable debug logging (ignored when `RUST_LOG` is set).
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `vetter mark-obsolete` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct MarkObsoleteCommand {
    /// Label of the upload environment in `upload.yaml`.
    #[arg(value_name = "UPLOAD_ENV")]
    pub(crate) environment: String,
    /// Identifier of the image to retire.
    #[arg(value_name = "IMAGE_ID")]
    pub(crate) image_id: String,
    /// Path to `upload.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) upload_config: Option<PathBuf>,
    /// Enable debug logging (ignored when `RUST_LOG` is set).
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `vetter validate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ValidateCommand {
    /// Path to `images.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) images_config: Option<PathBuf>,
    /// Path to `test.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) test_config: Option<PathBuf>,
    /// Path to `upload.yaml`; searched for when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) upload_config: Option<PathBuf>,
    /// Enable debug logging (ignored when `RUST_LOG` is set).
    #[arg(long)]
    pub(crate) debug: bool,
}
