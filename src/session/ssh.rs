//! SSH access parameters for a provisioned instance.
//!
//! The private key lives in memory and is only written to disk when a
//! consumer asks for a key file. The file is removed when the access value is
//! dropped unless [`SshAccess::keep_key_file`] is called.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use shell_escape::unix::escape;
use tempfile::TempPath;
use zeroize::Zeroizing;

use super::ProvisionError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH options taken from the image's `tests.ssh` section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Remote user name.
    pub username: String,
    /// Remote port.
    pub port: u16,
}

/// Everything needed to reach the instance over SSH.
pub struct SshAccess {
    ip: String,
    username: String,
    port: u16,
    private_key: Zeroizing<String>,
    key_file: Option<KeyFile>,
}

enum KeyFile {
    Temporary(TempPath),
    Kept(PathBuf),
}

impl KeyFile {
    fn path(&self) -> &Path {
        match self {
            Self::Temporary(path) => path,
            Self::Kept(path) => path,
        }
    }
}

impl fmt::Debug for SshAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAccess")
            .field("ip", &self.ip)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("key_file", &self.key_file.as_ref().map(KeyFile::path))
            .finish_non_exhaustive()
    }
}

impl SshAccess {
    /// Builds access parameters from the resolved IP and key material.
    #[must_use]
    pub fn new(ip: impl Into<String>, settings: &SshSettings, private_key: Zeroizing<String>) -> Self {
        Self {
            ip: ip.into(),
            username: settings.username.clone(),
            port: settings.port,
            private_key,
            key_file: None,
        }
    }

    /// Instance address.
    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Remote user name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Remote port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Path of the private key file, writing it with owner-only permissions
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::KeyMaterial`] when the file cannot be
    /// written.
    pub fn key_file(&mut self) -> Result<&Path, ProvisionError> {
        if self.key_file.is_none() {
            self.key_file = Some(KeyFile::Temporary(write_key(&self.private_key)?));
        }
        self.key_file
            .as_ref()
            .map(KeyFile::path)
            .ok_or_else(|| ProvisionError::KeyMaterial(String::from("key file vanished")))
    }

    /// Persists the key file beyond the session and returns its path.
    /// Later calls return the same path.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::KeyMaterial`] when the file cannot be
    /// written or kept.
    pub fn keep_key_file(&mut self) -> Result<PathBuf, ProvisionError> {
        let temporary = match self.key_file.take() {
            Some(KeyFile::Kept(path)) => {
                self.key_file = Some(KeyFile::Kept(path.clone()));
                return Ok(path);
            }
            Some(KeyFile::Temporary(path)) => path,
            None => write_key(&self.private_key)?,
        };
        let path = temporary
            .keep()
            .map_err(|err| ProvisionError::KeyMaterial(err.to_string()))?;
        self.key_file = Some(KeyFile::Kept(path.clone()));
        Ok(path)
    }

    /// Arguments for an interactive `ssh` invocation.
    ///
    /// # Errors
    ///
    /// See [`SshAccess::key_file`].
    pub fn command_args(&mut self) -> Result<Vec<String>, ProvisionError> {
        let key = self.key_file()?.display().to_string();
        Ok(vec![
            String::from("ssh"),
            String::from("-o"),
            String::from("StrictHostKeyChecking=no"),
            String::from("-o"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("-o"),
            String::from("UpdateHostKeys=no"),
            String::from("-o"),
            String::from("PasswordAuthentication=no"),
            String::from("-i"),
            key,
            String::from("-p"),
            self.port.to_string(),
            format!("{}@{}", self.username, self.ip),
        ])
    }

    /// Shell-escaped command line for operators.
    ///
    /// # Errors
    ///
    /// See [`SshAccess::key_file`].
    pub fn command_line(&mut self) -> Result<String, ProvisionError> {
        Ok(self
            .command_args()?
            .iter()
            .map(|arg| escape(arg.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Variables exported to test adapters, keyed without prefix.
    ///
    /// # Errors
    ///
    /// See [`SshAccess::key_file`].
    pub fn env_vars(&mut self) -> Result<BTreeMap<String, String>, ProvisionError> {
        let key = self.key_file()?.display().to_string();
        let command = self.command_line()?;
        Ok(BTreeMap::from([
            (String::from("ssh_ip"), self.ip.clone()),
            (String::from("ssh_username"), self.username.clone()),
            (String::from("ssh_port"), self.port.to_string()),
            (String::from("ssh_private_key_file"), key),
            (String::from("ssh_command_line"), command),
        ]))
    }
}

fn write_key(private_key: &str) -> Result<TempPath, ProvisionError> {
    let mut file = tempfile::Builder::new()
        .prefix("vetter-key-")
        .tempfile()
        .map_err(|err| ProvisionError::KeyMaterial(err.to_string()))?;
    file.write_all(private_key.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| ProvisionError::KeyMaterial(err.to_string()))?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access() -> SshAccess {
        SshAccess::new(
            "192.0.2.10",
            &SshSettings {
                username: String::from("cirros"),
                port: 2222,
            },
            Zeroizing::new(String::from("PRIVATE KEY")),
        )
    }

    #[test]
    fn key_file_holds_key_and_is_removed_on_drop() {
        let mut ssh = access();
        let path = ssh
            .key_file()
            .unwrap_or_else(|err| panic!("key file: {err}"))
            .to_path_buf();
        let contents = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(contents, "PRIVATE KEY");
        drop(ssh);
        assert!(!path.exists(), "key file should be removed with the session");
    }

    #[cfg(unix)]
    #[test]
    fn kept_key_file_survives_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let mut ssh = access();
        let path = ssh
            .keep_key_file()
            .unwrap_or_else(|err| panic!("keep: {err}"));
        let again = ssh
            .key_file()
            .unwrap_or_else(|err| panic!("key file: {err}"))
            .to_path_buf();
        assert_eq!(again, path);
        drop(ssh);
        let mode = std::fs::metadata(&path)
            .unwrap_or_else(|err| panic!("metadata: {err}"))
            .permissions()
            .mode();
        std::fs::remove_file(&path).unwrap_or_else(|err| panic!("cleanup: {err}"));
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn command_line_names_user_host_and_port() {
        let mut ssh = access();
        let line = ssh
            .command_line()
            .unwrap_or_else(|err| panic!("command line: {err}"));
        assert!(line.starts_with("ssh -o StrictHostKeyChecking=no"));
        assert!(line.ends_with("-p 2222 cirros@192.0.2.10"));
    }

    #[test]
    fn env_vars_expose_connection_fields() {
        let mut ssh = access();
        let vars = ssh.env_vars().unwrap_or_else(|err| panic!("env: {err}"));
        assert_eq!(vars.get("ssh_ip").map(String::as_str), Some("192.0.2.10"));
        assert_eq!(vars.get("ssh_port").map(String::as_str), Some("2222"));
        assert!(vars.contains_key("ssh_private_key_file"));
    }
}
