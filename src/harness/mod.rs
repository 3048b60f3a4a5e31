//! Test-run orchestration over a provisioned environment.
//!
//! [`run_session`] provisions the environment, optionally waits for a port,
//! runs each [`TestDescriptor`] through its adapter under the descriptor's
//! time limit, decides which resources to keep, cleans up, and reports what
//! was left behind.

mod descriptor;
mod env;
mod error;
mod pytest;
mod report;
mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use descriptor::{AdapterKind, DEFAULT_TEST_TIMEOUT, TestDescriptor, TestPlan};
pub use env::{ENV_PREFIX, adapter_environment, unwrap_config};
pub use error::HarnessError;
pub use pytest::{PYTHON, pytest_args, run_pytest};
pub use report::{PostMortem, report};
pub use shell::{gather_tests, run_shell};

use crate::control_plane::ControlPlane;
use crate::deadline::{Deadline, DeadlineError};
use crate::probe::wait_for_port;
use crate::process::CommandRunner;
use crate::session::{ProvisionError, ProvisioningSession, SshAccess};

/// Which resources survive a failed run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeepPolicy {
    /// Keep the image.
    pub keep_failed_image: bool,
    /// Keep the instance and its keypair.
    pub keep_failed_instance: bool,
}

impl KeepPolicy {
    fn apply<C: ControlPlane>(self, session: &mut ProvisioningSession<C>) {
        if self.keep_failed_instance {
            session.keep_failed_instance();
        }
        if self.keep_failed_image {
            session.keep_failed_image();
        }
    }
}

/// Runs test descriptors in declared order.
#[derive(Clone)]
pub struct TestRunner {
    runner: Arc<dyn CommandRunner>,
    continue_on_fail: bool,
}

impl TestRunner {
    /// Creates a runner that stops at the first failing test.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            continue_on_fail: false,
        }
    }

    /// Keeps running after a failing test. The run still fails.
    #[must_use]
    pub const fn continue_on_fail(mut self, continue_on_fail: bool) -> Self {
        self.continue_on_fail = continue_on_fail;
        self
    }

    /// Runs every descriptor with `env`, returning `true` when all passed.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] when an adapter cannot run at all.
    pub async fn run(
        &self,
        tests: &[TestDescriptor],
        env: &BTreeMap<String, String>,
    ) -> Result<bool, HarnessError> {
        let mut passed = true;
        for test in tests {
            info!(adapter = %test.kind, path = %test.path, "running tests");
            if self.run_one(test, env).await? {
                info!(adapter = %test.kind, path = %test.path, "done running tests");
                continue;
            }
            passed = false;
            if self.continue_on_fail {
                warn!(adapter = %test.kind, path = %test.path, "some tests have failed, continuing");
            } else {
                warn!(adapter = %test.kind, path = %test.path, "some tests have failed, stopping");
                break;
            }
        }
        Ok(passed)
    }

    async fn run_one(
        &self,
        test: &TestDescriptor,
        env: &BTreeMap<String, String>,
    ) -> Result<bool, HarnessError> {
        let runner = Arc::clone(&self.runner);
        let kind = test.kind;
        let path = test.path.clone();
        let env = env.clone();
        let continue_on_fail = self.continue_on_fail;

        let outcome = Deadline::new("run tests", test.timeout)
            .run_blocking(move |cancel| match kind {
                AdapterKind::Shell => {
                    run_shell(runner.as_ref(), &path, &env, continue_on_fail, &cancel)
                }
                AdapterKind::Pytest => {
                    run_pytest(runner.as_ref(), &path, &env, continue_on_fail, &cancel)
                }
            })
            .await;

        match outcome {
            Ok(passed) => Ok(passed),
            Err(DeadlineError::Exceeded { limit, .. }) => {
                warn!(path = %test.path, timeout_secs = limit.as_secs(), "tests timed out");
                Ok(false)
            }
            Err(DeadlineError::Failed { source, .. }) => Err(source),
            Err(DeadlineError::Aborted { message, .. }) => Err(HarnessError::Aborted {
                path: test.path.clone(),
                message,
            }),
        }
    }
}

/// Provisions `session`, runs `plan`, and always cleans up.
///
/// Returns `Ok(false)` when tests failed. On any failure after provisioning
/// the keep policy is applied before cleanup and a post-mortem is logged
/// afterwards.
///
/// # Errors
///
/// Returns [`HarnessError::Provision`] when provisioning fails,
/// [`HarnessError::PortTimeout`] when the port wait expires, and other
/// [`HarnessError`] variants when an adapter cannot run.
pub async fn run_session<C: ControlPlane>(
    session: &mut ProvisioningSession<C>,
    plan: &TestPlan,
    runner: &TestRunner,
    keep: KeepPolicy,
) -> Result<bool, HarnessError> {
    session.prepare().await?;

    let outcome = exercise(session, plan, runner).await;
    let failed = !matches!(outcome, Ok(true));
    if failed {
        keep.apply(session);
    }
    session.cleanup().await;
    if failed {
        let post_mortem = report(session);
        debug!(leftovers = post_mortem.leftovers.len(), "post-mortem reported");
    }

    match &outcome {
        Ok(true) => info!("all tests passed successfully"),
        Ok(false) => warn!("some tests failed"),
        Err(_) => {}
    }
    outcome
}

async fn exercise<C: ControlPlane>(
    session: &mut ProvisioningSession<C>,
    plan: &TestPlan,
    runner: &TestRunner,
) -> Result<bool, HarnessError> {
    if let Some(port) = plan.wait_for_port {
        let ip = session
            .main_ip()
            .ok_or_else(|| ProvisionError::Aborted {
                step: "wait for port",
                message: String::from("no primary address"),
            })?
            .to_owned();
        wait_for_port(&ip, port, plan.port_wait_timeout).await?;
    }

    let ssh_env = session.ssh().map(SshAccess::env_vars).transpose()?;
    let env = adapter_environment(
        &session.env_config(),
        ssh_env.as_ref(),
        plan.environment_variables.as_ref(),
    );
    runner.run(&plan.tests, &env).await
}

#[cfg(test)]
mod tests;
