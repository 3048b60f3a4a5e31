//! Orchestration behaviour against scripted doubles.

use std::net::TcpListener;
use std::time::Duration;

use super::*;
use crate::control_plane::NicRequest;
use crate::session::{
    DEFAULT_SSH_PORT, FlavorSpec, ImageSource, SessionPlan, SessionTimeouts, SshSettings,
};
use crate::test_support::{ScriptedControlPlane, ScriptedRunner};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use serde_json::json;

const EXISTING_IMAGE: &str = "image-existing";

#[fixture]
fn session_plan() -> SessionPlan {
    SessionPlan {
        name: String::from("VETTER-harness"),
        image: ImageSource::Existing(String::from(EXISTING_IMAGE)),
        flavor: FlavorSpec::Id(String::from("flavor-1")),
        nics: vec![NicRequest {
            net_id: Some(String::from("net-1")),
            ..NicRequest::default()
        }],
        config_drive: false,
        user_data: None,
        availability_zone: None,
        main_nic_regexp: None,
        ssh: Some(SshSettings {
            username: String::from("cirros"),
            port: DEFAULT_SSH_PORT,
        }),
        timeouts: SessionTimeouts::default(),
    }
}

fn pytest(path: &str) -> TestDescriptor {
    TestDescriptor {
        kind: AdapterKind::Pytest,
        path: Utf8PathBuf::from(path),
        timeout: DEFAULT_TEST_TIMEOUT,
    }
}

fn test_plan(tests: Vec<TestDescriptor>) -> TestPlan {
    TestPlan {
        tests,
        environment_variables: Some(json!({"proxy": {"host": "proxy.local"}})),
        wait_for_port: None,
        port_wait_timeout: Duration::from_millis(200),
    }
}

fn fixtures(
    session_plan: SessionPlan,
) -> (
    ScriptedControlPlane,
    ProvisioningSession<ScriptedControlPlane>,
    Arc<ScriptedRunner>,
) {
    let plane = ScriptedControlPlane::new();
    plane.add_image(EXISTING_IMAGE, "cirros");
    let session = ProvisioningSession::new(plane.clone(), session_plan)
        .with_poll_interval(Duration::from_millis(5));
    (plane, session, Arc::new(ScriptedRunner::new()))
}

#[rstest]
#[tokio::test]
async fn passing_run_cleans_everything_created(session_plan: SessionPlan) {
    let (plane, mut session, runner) = fixtures(session_plan);
    let tests = TestRunner::new(runner.clone());

    let passed = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/test_boot.py")]),
        &tests,
        KeepPolicy::default(),
    )
    .await
    .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(passed);
    assert_eq!(plane.count("delete_instance"), 1);
    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("delete_image"), 0);

    let invocations = runner.invocations();
    let invocation = invocations
        .first()
        .unwrap_or_else(|| panic!("pytest should have run"));
    assert_eq!(
        invocation.env.get("ssh_ip").map(String::as_str),
        Some("192.0.2.10")
    );
    assert_eq!(
        invocation.env.get("VETTER_PROXY_HOST").map(String::as_str),
        Some("proxy.local")
    );
    assert!(invocation.env.contains_key("instance_uuid"));
}

#[rstest]
#[tokio::test]
async fn failing_test_stops_the_run_and_still_cleans_up(session_plan: SessionPlan) {
    let (plane, mut session, runner) = fixtures(session_plan);
    runner.push_exit_code(1);
    let tests = TestRunner::new(runner.clone());

    let passed = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/a.py"), pytest("tests/b.py")]),
        &tests,
        KeepPolicy::default(),
    )
    .await
    .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(!passed);
    assert_eq!(runner.invocations().len(), 1);
    assert_eq!(plane.count("delete_instance"), 1);
    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("delete_image"), 0);
    assert!(
        session
            .resources()
            .iter()
            .all(|status| !status.needs_manual_cleanup())
    );
}

#[rstest]
#[tokio::test]
async fn continue_on_fail_runs_every_test_but_fails_overall(session_plan: SessionPlan) {
    let (_plane, mut session, runner) = fixtures(session_plan);
    runner.push_exit_code(1);
    runner.push_success();
    let tests = TestRunner::new(runner.clone()).continue_on_fail(true);

    let passed = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/a.py"), pytest("tests/b.py")]),
        &tests,
        KeepPolicy::default(),
    )
    .await
    .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(!passed);
    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(
        commands,
        vec![
            String::from("python3 -m pytest tests/a.py -v -s"),
            String::from("python3 -m pytest tests/b.py -v -s"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn keep_failed_instance_leaves_instance_and_keypair(session_plan: SessionPlan) {
    let (plane, mut session, runner) = fixtures(session_plan);
    runner.push_exit_code(2);
    let tests = TestRunner::new(runner);
    let keep = KeepPolicy {
        keep_failed_image: false,
        keep_failed_instance: true,
    };

    let passed = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/a.py")]),
        &tests,
        keep,
    )
    .await
    .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(!passed);
    assert_eq!(plane.count("delete_instance"), 0);
    assert_eq!(plane.count("delete_keypair"), 0);
    let key_file = session
        .kept_key_file()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| panic!("key file should be kept"));
    assert!(key_file.exists());

    let post_mortem = report(&mut session);
    let lines = post_mortem.lines();
    assert_eq!(lines.len(), 2);
    assert!(post_mortem.ssh_command.is_some());
    std::fs::remove_file(key_file).unwrap_or_else(|err| panic!("remove key: {err}"));
}

#[rstest]
#[tokio::test]
async fn keep_policy_is_ignored_when_tests_pass(session_plan: SessionPlan) {
    let (plane, mut session, runner) = fixtures(session_plan);
    let tests = TestRunner::new(runner);
    let keep = KeepPolicy {
        keep_failed_image: true,
        keep_failed_instance: true,
    };

    let passed = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/a.py")]),
        &tests,
        keep,
    )
    .await
    .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(passed);
    assert_eq!(plane.count("delete_instance"), 1);
    assert_eq!(plane.count("delete_keypair"), 1);
}

#[rstest]
#[tokio::test]
async fn closed_port_times_out_and_cleans_up(session_plan: SessionPlan) {
    let port = {
        let listener =
            TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("bind: {err}"));
        listener
            .local_addr()
            .unwrap_or_else(|err| panic!("addr: {err}"))
            .port()
    };
    let (plane, mut session, runner) = fixtures(session_plan);
    plane.set_networks(&[("public", &["127.0.0.1"])]);
    let tests = TestRunner::new(runner.clone());
    let mut plan = test_plan(vec![pytest("tests/a.py")]);
    plan.wait_for_port = Some(port);

    let err = run_session(&mut session, &plan, &tests, KeepPolicy::default())
        .await
        .expect_err("port wait should time out");

    assert!(matches!(err, HarnessError::PortTimeout(_)));
    assert!(runner.invocations().is_empty());
    assert_eq!(plane.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_skips_the_tests(session_plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    let mut session = ProvisioningSession::new(plane.clone(), session_plan);
    let runner = Arc::new(ScriptedRunner::new());
    let tests = TestRunner::new(runner.clone());

    let err = run_session(
        &mut session,
        &test_plan(vec![pytest("tests/a.py")]),
        &tests,
        KeepPolicy::default(),
    )
    .await
    .expect_err("missing image should fail");

    assert!(matches!(err, HarnessError::Provision(_)));
    assert!(runner.invocations().is_empty());
    assert_eq!(plane.count("boot_instance"), 0);
}
