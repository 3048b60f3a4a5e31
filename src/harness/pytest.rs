//! Pytest adapter.

use std::collections::BTreeMap;
use std::ffi::OsString;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::process::CommandRunner;

use super::HarnessError;

/// Interpreter used to launch pytest.
pub const PYTHON: &str = "python3";

/// Arguments for `python3 -m pytest`. `-x` stops at the first failure
/// unless `continue_on_fail` is set.
#[must_use]
pub fn pytest_args(path: &Utf8Path, continue_on_fail: bool) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-m"),
        OsString::from("pytest"),
        OsString::from(path.as_str()),
        OsString::from("-v"),
        OsString::from("-s"),
    ];
    if !continue_on_fail {
        args.push(OsString::from("-x"));
    }
    args
}

/// Runs pytest against `path` with `env`; exit code zero is a pass.
///
/// # Errors
///
/// Returns [`HarnessError::Command`] when the interpreter cannot be started.
pub fn run_pytest(
    runner: &dyn CommandRunner,
    path: &Utf8Path,
    env: &BTreeMap<String, String>,
    continue_on_fail: bool,
    cancel: &CancellationToken,
) -> Result<bool, HarnessError> {
    info!(path = %path, "running pytest");
    let output = runner.run(PYTHON, &pytest_args(path, continue_on_fail), env, cancel)?;
    Ok(output.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn stops_on_first_failure_by_default() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(1);

        let passed = run_pytest(
            &runner,
            Utf8Path::new("tests/test_image.py"),
            &BTreeMap::new(),
            false,
            &CancellationToken::new(),
        )
        .unwrap_or_else(|err| panic!("run: {err}"));

        assert!(!passed);
        assert_eq!(
            runner.invocations()[0].command_string(),
            "python3 -m pytest tests/test_image.py -v -s -x"
        );
    }

    #[test]
    fn continue_on_fail_omits_exit_first() {
        let args = pytest_args(Utf8Path::new("t.py"), true);
        assert!(!args.contains(&OsString::from("-x")));
    }
}
