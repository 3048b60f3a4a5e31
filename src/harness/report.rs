//! Post-mortem report of resources left behind after a failed run.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::control_plane::ControlPlane;
use crate::session::{ProvisioningSession, ResourceKind, ResourceStatus};

/// What an operator needs to inspect or remove leftovers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PostMortem {
    /// Created resources that are still present.
    pub leftovers: Vec<ResourceStatus>,
    /// Command line reaching a retained instance.
    pub ssh_command: Option<String>,
    /// Private key kept for a retained instance.
    pub key_file: Option<PathBuf>,
}

impl PostMortem {
    /// One line per leftover resource.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.leftovers
            .iter()
            .map(|status| {
                format!(
                    "{}: {} ({}), will not be removed",
                    status.kind, status.id, status.name
                )
            })
            .collect()
    }
}

/// Collects and logs the post-mortem for a cleaned-up session.
#[must_use]
pub fn report<C: ControlPlane>(session: &mut ProvisioningSession<C>) -> PostMortem {
    let leftovers: Vec<ResourceStatus> = session
        .resources()
        .into_iter()
        .filter(ResourceStatus::needs_manual_cleanup)
        .collect();
    let instance_kept = leftovers
        .iter()
        .any(|status| status.kind == ResourceKind::Instance);

    let mut post_mortem = PostMortem {
        leftovers,
        ssh_command: None,
        key_file: session.kept_key_file().map(std::path::Path::to_path_buf),
    };
    for line in post_mortem.lines() {
        warn!("{line}");
    }

    if instance_kept {
        if let Some(ip) = session.main_ip() {
            warn!(ip = %ip, "instance kept for debugging");
        }
        if let Some(ssh) = session.ssh() {
            match ssh.command_line() {
                Ok(command) => {
                    info!("you may use the following line to access the server");
                    info!("{command}");
                    post_mortem.ssh_command = Some(command);
                }
                Err(err) => warn!(error = %err, "failed to render ssh command line"),
            }
        }
        if let Some(path) = &post_mortem.key_file {
            info!(path = %path.display(), "ssh private key kept");
        }
    }
    post_mortem
}
