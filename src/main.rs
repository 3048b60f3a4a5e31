//! Binary entry point for the vetter CLI.

use std::env;
use std::fmt::Display;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vetter::auth::{ClientSettings, NegotiationError, build_client, filter_overrides};
use vetter::config::{
    ConfigError, ConfigFile, ConfigKind, ConfigTree, VetterSettings, max_timeout,
};
use vetter::control_plane::ControlPlaneError;
use vetter::harness::{HarnessError, KeepPolicy, TestPlan, TestRunner, run_session};
use vetter::openstack::OpenStackClient;
use vetter::process::ProcessCommandRunner;
use vetter::rotation::{mark_obsolete, obsolete_older_images, rotate};
use vetter::session::{
    DEFAULT_CLEANUP_TIMEOUT, DEFAULT_UPLOAD_TIMEOUT, ProvisionError, ProvisioningSession,
    SessionPlan, publish_image, published_name, published_upload,
};
use vetter::validate::{Validation, validate};

mod cli;

use cli::{
    Cli, MarkObsoleteCommand, RotateCommand, RotateSingleCommand, TestCommand, UploadCommand,
    ValidateCommand,
};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_TESTS_FAILED: i32 = 80;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Invalid(#[from] Validation),
    #[error("failed to remove {failed} of {total} obsolete images")]
    RotationIncomplete { failed: usize, total: usize },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

impl CliError {
    /// Stable process exit code for this failure.
    fn exit_code(&self) -> i32 {
        match self {
            Self::Config(err) => config_exit_code(err),
            Self::Negotiation(err) => negotiation_exit_code(err),
            Self::Provision(err) | Self::Harness(HarnessError::Provision(err)) => {
                provision_exit_code(err)
            }
            Self::Harness(HarnessError::PortTimeout(_)) => 71,
            Self::ControlPlane(err) => control_plane_exit_code(err),
            Self::Harness(_)
            | Self::Invalid(_)
            | Self::RotationIncomplete { .. }
            | Self::NonUtf8Path(_)
            | Self::Output(_) => EXIT_FAILURE,
        }
    }
}

fn config_exit_code(err: &ConfigError) -> i32 {
    match err {
        ConfigError::ConfigNotFound { .. } => 10,
        ConfigError::LabelNotFound { .. } => 11,
        _ => EXIT_FAILURE,
    }
}

fn negotiation_exit_code(err: &NegotiationError) -> i32 {
    match err {
        NegotiationError::CredentialNotFound { .. } => 12,
        NegotiationError::Rejected(source) => control_plane_exit_code(source),
        _ => EXIT_FAILURE,
    }
}

fn provision_exit_code(err: &ProvisionError) -> i32 {
    match err {
        ProvisionError::Config(source) => config_exit_code(source),
        ProvisionError::Negotiation(source) => negotiation_exit_code(source),
        ProvisionError::ControlPlane { source, .. } => control_plane_exit_code(source),
        ProvisionError::Instance { .. } => 70,
        _ => EXIT_FAILURE,
    }
}

fn control_plane_exit_code(err: &ControlPlaneError) -> i32 {
    match err {
        ControlPlaneError::Unauthorized { .. } => 20,
        ControlPlaneError::NotFound { resource, .. } if *resource == "image" => 50,
        ControlPlaneError::BadRequest { .. } => 60,
        ControlPlaneError::Forbidden { .. } => 61,
        _ => EXIT_FAILURE,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug());
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "vetter=debug" } else { "vetter=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Test(command) => run_test(command).await,
        Cli::Upload(command) => run_upload(command).await,
        Cli::Rotate(command) => run_rotate(command).await,
        Cli::RotateSingle(command) => run_rotate_single(command).await,
        Cli::MarkObsolete(command) => run_mark_obsolete(command).await,
        Cli::Validate(command) => run_validate(command),
    }
}

async fn run_test(args: TestCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let images_path = utf8_path(args.common.images_config)?.or_else(|| settings.images_path());
    let image = ConfigFile::load(ConfigKind::Images, images_path.as_deref())?.entry(&args.image)?;
    if !image.contains("tests") {
        return Err(HarnessError::MissingTests { image: args.image }.into());
    }
    let environment_label = match args.environment {
        Some(label) => label,
        None => image
            .get_str("tests.environment_name")
            .map(str::to_owned)
            .ok_or(HarnessError::MissingEnvironment)?,
    };
    let test_path = utf8_path(args.test_config)?.or_else(|| settings.test_path());
    let environment = ConfigFile::load(ConfigKind::TestEnvironments, test_path.as_deref())?
        .entry(&environment_label)?;

    let plan = TestPlan::from_config(&image, &environment)?;
    let input = utf8_path(args.common.input)?;
    let session_plan = SessionPlan::from_config(
        &image,
        &environment,
        args.use_existing_image.as_deref(),
        input.as_deref(),
    )?;
    let client = connect(&settings, &image, &environment).await?;

    info!(image = %args.image, environment = %environment_label, name = %session_plan.name, "starting test run");
    let mut session = ProvisioningSession::new(client, session_plan)
        .delete_existing_image(args.delete_existing_image);
    let runner =
        TestRunner::new(Arc::new(ProcessCommandRunner)).continue_on_fail(args.continue_on_fail);
    let keep = KeepPolicy {
        keep_failed_image: args.keep_failed_image,
        keep_failed_instance: args.keep_failed_instance,
    };
    let passed = run_session(&mut session, &plan, &runner, keep).await?;
    Ok(if passed { EXIT_SUCCESS } else { EXIT_TESTS_FAILED })
}

async fn run_upload(args: UploadCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let images_path = utf8_path(args.common.images_config)?.or_else(|| settings.images_path());
    let image = ConfigFile::load(ConfigKind::Images, images_path.as_deref())?.entry(&args.image)?;
    let upload_path = utf8_path(args.upload_config)?.or_else(|| settings.upload_path());
    let environment = ConfigFile::load(ConfigKind::UploadEnvironments, upload_path.as_deref())?
        .entry(&args.environment)?;

    let input = utf8_path(args.common.input)?;
    let request = published_upload(&image, &environment, input.as_deref())?;
    let limit = max_timeout(
        &image,
        &environment,
        "glance.upload_timeout",
        DEFAULT_UPLOAD_TIMEOUT,
    );
    let client = connect(&settings, &image, &environment).await?;

    let uploaded = publish_image(&client, &request, limit, DEFAULT_CLEANUP_TIMEOUT).await?;
    print_line(&uploaded.id)?;
    if args.no_obsolete {
        info!(name = %uploaded.name, "leaving older images untouched");
    } else {
        let retired = obsolete_older_images(&client, &uploaded).await?;
        info!(name = %uploaded.name, count = retired.len(), "older images marked obsolete");
    }
    Ok(EXIT_SUCCESS)
}

async fn run_rotate(args: RotateCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let environment = upload_environment(&settings, args.upload_config, &args.environment)?;
    let client = connect(&settings, &ConfigTree::empty(), &environment).await?;
    rotate_images(&client, None, args.dry_run).await
}

async fn run_rotate_single(args: RotateSingleCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let images_path = utf8_path(args.images_config)?.or_else(|| settings.images_path());
    let image = ConfigFile::load(ConfigKind::Images, images_path.as_deref())?.entry(&args.image)?;
    let environment = upload_environment(&settings, args.upload_config, &args.environment)?;
    let name = published_name(&image, &environment)?;
    let client = connect(&settings, &image, &environment).await?;
    rotate_images(&client, Some(&name), args.dry_run).await
}

async fn rotate_images(
    client: &OpenStackClient,
    name: Option<&str>,
    dry_run: bool,
) -> Result<i32, CliError> {
    let rotation = rotate(client, name, dry_run).await?;
    for candidate in &rotation.candidates {
        print_line(format_args!("{}\t{}", candidate.id, candidate.name))?;
    }
    if rotation.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Err(CliError::RotationIncomplete {
            failed: rotation.failed.len(),
            total: rotation.candidates.len(),
        })
    }
}

async fn run_mark_obsolete(args: MarkObsoleteCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let environment = upload_environment(&settings, args.upload_config, &args.environment)?;
    let client = connect(&settings, &ConfigTree::empty(), &environment).await?;
    let image = mark_obsolete(&client, &args.image_id).await?;
    print_line(format_args!("{}\t{}", image.id, image.name))?;
    Ok(EXIT_SUCCESS)
}

fn run_validate(args: ValidateCommand) -> Result<i32, CliError> {
    let settings = VetterSettings::load_without_cli_args()?;
    let images_path = utf8_path(args.images_config)?.or_else(|| settings.images_path());
    let test_path = utf8_path(args.test_config)?.or_else(|| settings.test_path());
    let upload_path = utf8_path(args.upload_config)?.or_else(|| settings.upload_path());
    let files = [
        ConfigFile::load(ConfigKind::Images, images_path.as_deref())?,
        ConfigFile::load(ConfigKind::TestEnvironments, test_path.as_deref())?,
        ConfigFile::load(ConfigKind::UploadEnvironments, upload_path.as_deref())?,
    ];
    let validation = validate(&files);
    if !validation.is_valid() {
        return Err(validation.into());
    }
    print_line("Configs have been validated.")?;
    Ok(EXIT_SUCCESS)
}

fn upload_environment(
    settings: &VetterSettings,
    explicit: Option<PathBuf>,
    label: &str,
) -> Result<ConfigTree, CliError> {
    let upload_path = utf8_path(explicit)?.or_else(|| settings.upload_path());
    Ok(ConfigFile::load(ConfigKind::UploadEnvironments, upload_path.as_deref())?.entry(label)?)
}

async fn connect(
    settings: &VetterSettings,
    image: &ConfigTree,
    environment: &ConfigTree,
) -> Result<OpenStackClient, CliError> {
    let client_settings = ClientSettings::resolve(settings, image, environment)?;
    let keystone = environment
        .subtree("keystone")
        .unwrap_or_else(ConfigTree::empty);
    let overrides = filter_overrides(
        env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?))),
    );
    Ok(build_client(&keystone, &overrides, &client_settings).await?)
}

fn utf8_path(path: Option<PathBuf>) -> Result<Option<Utf8PathBuf>, CliError> {
    path.map(|path| {
        Utf8PathBuf::from_path_buf(path)
            .map_err(|original| CliError::NonUtf8Path(original.display().to_string()))
    })
    .transpose()
}

fn print_line(line: impl Display) -> Result<(), CliError> {
    writeln!(io::stdout(), "{line}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vetter::session::FlavorError;

    fn not_found(resource: &'static str) -> ControlPlaneError {
        ControlPlaneError::NotFound {
            resource,
            id: String::from("x"),
        }
    }

    #[rstest]
    #[case::config_not_found(CliError::Config(ConfigError::ConfigNotFound { kind: "images", searched: Vec::new() }), 10)]
    #[case::label_not_found(CliError::Config(ConfigError::LabelNotFound { label: String::from("x"), kind: "images", path: Utf8PathBuf::from("images.yaml") }), 11)]
    #[case::credential(CliError::Negotiation(NegotiationError::CredentialNotFound { field: "password", aliases: &["os_password"] }), 12)]
    #[case::unauthorized(CliError::Negotiation(NegotiationError::Rejected(ControlPlaneError::Unauthorized { message: String::new() })), 20)]
    #[case::image_missing(CliError::Harness(HarnessError::Provision(ProvisionError::ControlPlane { step: "find image", source: not_found("image") })), 50)]
    #[case::other_missing(CliError::Provision(ProvisionError::ControlPlane { step: "list interfaces", source: not_found("instance") }), 1)]
    #[case::bad_request(CliError::Provision(ProvisionError::ControlPlane { step: "create instance", source: ControlPlaneError::BadRequest { message: String::new() } }), 60)]
    #[case::forbidden(CliError::Provision(ProvisionError::ControlPlane { step: "create keypair", source: ControlPlaneError::Forbidden { message: String::new() } }), 61)]
    #[case::instance_error(CliError::Harness(HarnessError::Provision(ProvisionError::Instance { id: String::from("i"), status: String::from("ERROR"), fault: None })), 70)]
    #[case::flavor(CliError::Provision(ProvisionError::Flavor(FlavorError::Missing)), 1)]
    #[case::missing_tests(CliError::Harness(HarnessError::MissingTests { image: String::from("cirros") }), 1)]
    #[case::mark_missing_image(CliError::ControlPlane(not_found("image")), 50)]
    #[case::rotation_forbidden(CliError::ControlPlane(ControlPlaneError::Forbidden { message: String::new() }), 61)]
    #[case::rotation_incomplete(CliError::RotationIncomplete { failed: 1, total: 2 }, 1)]
    #[case::invalid_entries(CliError::Invalid(Validation::default()), 1)]
    fn errors_map_to_stable_exit_codes(#[case] err: CliError, #[case] expected: i32) {
        assert_eq!(err.exit_code(), expected, "error: {err}");
    }

    #[test]
    fn write_error_renders_the_message() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Harness(HarnessError::MissingEnvironment));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(
            rendered.contains("no test environment given"),
            "rendered: {rendered}"
        );
    }
}
