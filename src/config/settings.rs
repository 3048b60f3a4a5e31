//! Tool-level settings loaded via `ortho-config`.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::ConfigError;

/// Default limit applied to each HTTP request made to the control plane.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Settings that locate the YAML files and tune the HTTP transport.
///
/// Values merge defaults, `vetter.toml`, and `VETTER_*` environment
/// variables in that order of precedence. Command-line flags override the
/// file locations afterwards.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VETTER",
    discovery(
        app_name = "vetter",
        env_var = "VETTER_CONFIG_PATH",
        config_file_name = "vetter.toml",
        dotfile_name = ".vetter.toml",
        project_file_name = "vetter.toml"
    )
)]
pub struct VetterSettings {
    /// Explicit path to `images.yaml`; searched for when unset.
    pub images_config: Option<String>,
    /// Explicit path to `test.yaml`; searched for when unset.
    pub test_config: Option<String>,
    /// Explicit path to `upload.yaml`; searched for when unset.
    pub upload_config: Option<String>,
    /// Disables TLS certificate verification for control-plane endpoints.
    #[ortho_config(default = false)]
    pub insecure: bool,
    /// Additional PEM bundle trusted for control-plane endpoints.
    pub ca_path: Option<String>,
    /// Per-request HTTP timeout in seconds.
    #[ortho_config(default = DEFAULT_HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,
}

impl VetterSettings {
    /// Loads settings without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Settings`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let settings = Self::load_from_iter([std::ffi::OsString::from("vetter")])
            .map_err(|err| ConfigError::Settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects blank paths and a zero HTTP timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, key) in [
            (self.images_config.as_deref(), "images_config"),
            (self.test_config.as_deref(), "test_config"),
            (self.upload_config.as_deref(), "upload_config"),
            (self.ca_path.as_deref(), "ca_path"),
        ] {
            if value.is_some_and(|path| path.trim().is_empty()) {
                return Err(ConfigError::InvalidField {
                    field: key.to_owned(),
                    message: format!(
                        "path is empty: set VETTER_{} or fix {key} in vetter.toml",
                        key.to_ascii_uppercase()
                    ),
                });
            }
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: String::from("http_timeout_secs"),
                message: String::from("must be positive: set VETTER_HTTP_TIMEOUT_SECS"),
            });
        }
        Ok(())
    }

    /// Path of the images file, when configured.
    #[must_use]
    pub fn images_path(&self) -> Option<Utf8PathBuf> {
        self.images_config.as_deref().map(Utf8PathBuf::from)
    }

    /// Path of the test environments file, when configured.
    #[must_use]
    pub fn test_path(&self) -> Option<Utf8PathBuf> {
        self.test_config.as_deref().map(Utf8PathBuf::from)
    }

    /// Path of the upload environments file, when configured.
    #[must_use]
    pub fn upload_path(&self) -> Option<Utf8PathBuf> {
        self.upload_config.as_deref().map(Utf8PathBuf::from)
    }

    /// CA bundle path, when configured.
    #[must_use]
    pub fn ca_bundle(&self) -> Option<&Utf8Path> {
        self.ca_path.as_deref().map(Utf8Path::new)
    }
}

impl Default for VetterSettings {
    fn default() -> Self {
        Self {
            images_config: None,
            test_config: None,
            upload_config: None,
            insecure: false,
            ca_path: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}
