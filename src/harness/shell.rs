//! Shell adapter: runs an executable or every executable below a directory.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::CommandRunner;

use super::HarnessError;

/// Collects the scripts named by `path`: the file itself when executable, or
/// every executable below a directory in sorted order.
///
/// # Errors
///
/// Returns [`HarnessError::InvalidTestPath`] when `path` is neither and
/// [`HarnessError::Io`] when a directory cannot be listed.
pub fn gather_tests(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, HarnessError> {
    let mut found = Vec::new();
    if !collect(path, &mut found)? {
        return Err(HarnessError::InvalidTestPath {
            path: path.to_path_buf(),
        });
    }
    Ok(found)
}

fn collect(path: &Utf8Path, found: &mut Vec<Utf8PathBuf>) -> Result<bool, HarnessError> {
    let io_error = |err: std::io::Error| HarnessError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    if path.is_dir() {
        let mut entries = path
            .read_dir_utf8()
            .map_err(io_error)?
            .map(|entry| entry.map(|entry| entry.into_path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error)?;
        entries.sort();
        for entry in entries {
            collect(&entry, found)?;
        }
        return Ok(true);
    }

    if path.is_file() && is_executable(path) {
        found.push(path.to_path_buf());
        return Ok(true);
    }
    Ok(false)
}

#[cfg(unix)]
fn is_executable(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path).is_ok_and(|metadata| metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Utf8Path) -> bool {
    fs::metadata(path).is_ok()
}

/// Runs every script gathered from `path` with `env`.
///
/// Stops at the first failing script unless `continue_on_fail` is set.
/// Returns `true` when every script that ran exited with zero.
///
/// # Errors
///
/// Returns [`HarnessError`] when `path` is invalid or a script cannot be
/// started.
pub fn run_shell(
    runner: &dyn CommandRunner,
    path: &Utf8Path,
    env: &BTreeMap<String, String>,
    continue_on_fail: bool,
    cancel: &CancellationToken,
) -> Result<bool, HarnessError> {
    let mut passed = true;
    for script in gather_tests(path)? {
        info!(script = %script, "running shell test");
        let output = runner.run(script.as_str(), &[], env, cancel)?;
        if output.is_success() {
            info!(script = %script, "test succeeded");
            continue;
        }
        passed = false;
        if continue_on_fail {
            warn!(script = %script, code = ?output.code, "test failed, continuing with other tests");
        } else {
            warn!(script = %script, code = ?output.code, "test failed, skipping all other tests");
            break;
        }
    }
    Ok(passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    fn utf8_dir(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    #[cfg(unix)]
    fn script(dir: &Utf8Path, name: &str, mode: u32) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap_or_else(|err| panic!("write: {err}"));
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .unwrap_or_else(|err| panic!("chmod: {err}"));
        path
    }

    #[cfg(unix)]
    #[test]
    fn gathers_executables_recursively_in_sorted_order() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = utf8_dir(&tmp);
        fs::create_dir(dir.join("20-nested")).unwrap_or_else(|err| panic!("mkdir: {err}"));
        let second = script(&dir.join("20-nested"), "check", 0o755);
        let first = script(&dir, "10-first", 0o755);
        let third = script(&dir, "30-third", 0o700);
        script(&dir, "README", 0o644);

        let tests = gather_tests(&dir).unwrap_or_else(|err| panic!("gather: {err}"));

        assert_eq!(tests, vec![first, second, third]);
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = gather_tests(Utf8Path::new("/nonexistent/vetter-tests"))
            .expect_err("missing path should fail");
        assert!(matches!(err, HarnessError::InvalidTestPath { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stops_at_first_failure_by_default() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = utf8_dir(&tmp);
        script(&dir, "a", 0o755);
        script(&dir, "b", 0o755);
        let runner = ScriptedRunner::new();
        runner.push_exit_code(1);

        let passed = run_shell(&runner, &dir, &BTreeMap::new(), false, &CancellationToken::new())
            .unwrap_or_else(|err| panic!("run: {err}"));

        assert!(!passed);
        assert_eq!(runner.invocations().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn continue_on_fail_runs_everything_but_still_fails() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = utf8_dir(&tmp);
        script(&dir, "a", 0o755);
        script(&dir, "b", 0o755);
        let runner = ScriptedRunner::new();
        runner.push_exit_code(1);
        runner.push_success();
        let env = BTreeMap::from([(String::from("VETTER_MAIN_IP"), String::from("10.0.0.1"))]);

        let passed = run_shell(&runner, &dir, &env, true, &CancellationToken::new())
            .unwrap_or_else(|err| panic!("run: {err}"));

        assert!(!passed);
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[1].env, env);
    }
}
