//! Provisioning and cleanup behaviour against the scripted control plane.

use super::*;
use crate::control_plane::{ImageUpload, NicRequest};
use crate::test_support::{INSTANCE_ID, PlaneCall, ScriptedControlPlane, UPLOADED_IMAGE_ID};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

const FAST_POLL: Duration = Duration::from_millis(5);

fn upload() -> ImageUpload {
    ImageUpload {
        name: String::from("VETTER-test"),
        filename: Utf8PathBuf::from("disk.qcow2"),
        disk_format: String::from("qcow2"),
        container_format: String::from("bare"),
        min_disk: 0,
        min_ram: 0,
        protected: false,
        public: false,
        tags: Vec::new(),
        properties: BTreeMap::new(),
    }
}

#[fixture]
fn plan() -> SessionPlan {
    SessionPlan {
        name: String::from("VETTER-test"),
        image: ImageSource::Upload(upload()),
        flavor: FlavorSpec::Name(String::from("m1.small")),
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

fn session(plane: &ScriptedControlPlane, plan: SessionPlan) -> ProvisioningSession<ScriptedControlPlane> {
    ProvisioningSession::new(plane.clone(), plan).with_poll_interval(FAST_POLL)
}

#[rstest]
#[tokio::test]
async fn prepare_walks_every_step_in_order(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    plane.set_statuses(&[InstanceStatus::Building, InstanceStatus::Active]);
    let mut session = session(&plane, plan);

    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.main_ip(), Some("192.0.2.10"));
    assert_eq!(
        plane.operations(),
        vec![
            "create_keypair",
            "create_image",
            "upload_image_data",
            "find_flavor_by_id",
            "find_flavor_by_name",
            "boot_instance",
            "get_instance",
            "get_instance",
            "list_interfaces",
        ]
    );
    let boot = plane
        .calls()
        .into_iter()
        .find_map(|call| match call {
            PlaneCall::BootInstance(request) => Some(request),
            _ => None,
        })
        .unwrap_or_else(|| panic!("boot request not recorded"));
    assert_eq!(boot.image_id, UPLOADED_IMAGE_ID);
    assert_eq!(boot.flavor_id, "flavor-1");
    assert_eq!(boot.key_name, "VETTER-test");

    let ssh = session.ssh().unwrap_or_else(|| panic!("ssh should be prepared"));
    assert_eq!(ssh.ip(), "192.0.2.10");

    session.cleanup().await;
    assert_eq!(session.state(), SessionState::CleanedUp);
    assert!(session.resources().iter().all(|status| status.was_removed));
}

#[rstest]
#[tokio::test]
async fn cleanup_removes_instance_then_keypair_then_image(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    session.cleanup().await;

    let deletes: Vec<_> = plane
        .operations()
        .into_iter()
        .filter(|operation| operation.starts_with("delete_"))
        .collect();
    assert_eq!(deletes, vec!["delete_instance", "delete_keypair", "delete_image"]);
}

#[rstest]
#[tokio::test]
async fn cleanup_runs_exactly_once(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    plane.fail(
        "boot_instance",
        ControlPlaneError::BadRequest {
            message: String::from("invalid network"),
        },
    );
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("boot should fail");
    assert!(matches!(
        err.control_plane(),
        Some(ControlPlaneError::BadRequest { .. })
    ));
    session.cleanup().await;
    session.cleanup().await;

    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("delete_image"), 1);
    assert_eq!(plane.count("delete_instance"), 0);
}

#[rstest]
#[tokio::test]
async fn failed_instance_delete_does_not_stop_other_cleanup(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    plane.fail(
        "delete_instance",
        ControlPlaneError::Provider {
            status: 500,
            message: String::from("nova is down"),
        },
    );
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    session.cleanup().await;

    assert_eq!(plane.count("delete_instance"), 1);
    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("delete_image"), 1);
    let instance = session
        .instance_status()
        .unwrap_or_else(|| panic!("instance should be tracked"));
    assert!(!instance.was_removed);
    assert!(instance.needs_manual_cleanup());
}

#[rstest]
#[tokio::test]
async fn error_status_fails_without_waiting_out_the_deadline(mut plan: SessionPlan) {
    plan.timeouts.active = Duration::from_secs(300);
    let plane = ScriptedControlPlane::new();
    plane.set_statuses(&[InstanceStatus::Building, InstanceStatus::Error]);
    plane.set_fault("No valid host was found");
    let mut session = session(&plane, plan);

    let started = std::time::Instant::now();
    let err = session.prepare().await.expect_err("instance should fail");

    assert!(started.elapsed() < Duration::from_secs(5));
    let ProvisionError::Instance { id, status, fault } = err else {
        panic!("expected Instance error, got {err:?}");
    };
    assert_eq!(id, INSTANCE_ID);
    assert_eq!(status, "ERROR");
    assert_eq!(fault.as_deref(), Some("No valid host was found"));
    assert_eq!(session.state(), SessionState::CleanedUp);
    assert_eq!(plane.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn slow_activation_is_a_deadline_failure(mut plan: SessionPlan) {
    plan.timeouts.active = Duration::from_millis(50);
    let plane = ScriptedControlPlane::new();
    plane.set_statuses(&[InstanceStatus::Building]);
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("activation should time out");

    let ProvisionError::DeadlineExceeded { step, resource, .. } = err else {
        panic!("expected DeadlineExceeded, got {err:?}");
    };
    assert_eq!(step, "wait for instance");
    assert_eq!(resource.as_deref(), Some(INSTANCE_ID));
    assert_eq!(plane.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn hanging_delete_is_bounded_by_the_cleanup_limit(mut plan: SessionPlan) {
    plan.timeouts.cleanup = Duration::from_millis(50);
    let plane = ScriptedControlPlane::new();
    plane.hang("delete_instance");
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    session.cleanup().await;

    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("delete_image"), 1);
}

#[rstest]
#[tokio::test]
async fn existing_image_is_never_deleted_even_after_failure(mut plan: SessionPlan) {
    plan.image = ImageSource::Existing(String::from("image-existing"));
    let plane = ScriptedControlPlane::new();
    plane.add_image("image-existing", "base");
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    let image = session
        .image_status()
        .unwrap_or_else(|| panic!("image should be tracked"));
    assert!(image.pre_existed);
    assert!(!image.deletable);

    session.cleanup().await;

    assert_eq!(plane.count("delete_image"), 0);
    assert_eq!(plane.count("delete_instance"), 1);
    assert_eq!(plane.count("delete_keypair"), 1);
    assert_eq!(plane.count("create_image"), 0);
}

#[rstest]
#[case::kept_by_default(false, 0)]
#[case::deleted_when_allowed(true, 1)]
#[tokio::test]
async fn existing_image_is_deleted_only_when_allowed(
    mut plan: SessionPlan,
    #[case] allow: bool,
    #[case] expected_deletes: usize,
) {
    plan.image = ImageSource::Existing(String::from("image-existing"));
    let plane = ScriptedControlPlane::new();
    plane.add_image("image-existing", "base");
    let mut session = session(&plane, plan).delete_existing_image(allow);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    session.cleanup().await;

    assert_eq!(plane.count("delete_image"), expected_deletes);
    let image = session
        .image_status()
        .unwrap_or_else(|| panic!("image should be tracked"));
    assert!(image.pre_existed);
    assert_eq!(image.was_removed, allow);
}

#[rstest]
#[tokio::test]
async fn image_whose_data_upload_times_out_is_removed(mut plan: SessionPlan) {
    plan.timeouts.upload = Duration::from_millis(50);
    let plane = ScriptedControlPlane::new();
    plane.hang("upload_image_data");
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("upload should time out");

    let ProvisionError::DeadlineExceeded { step, .. } = err else {
        panic!("expected DeadlineExceeded, got {err:?}");
    };
    assert_eq!(step, "upload image");
    assert_eq!(plane.count("boot_instance"), 0);
    assert_eq!(
        plane.calls().last(),
        Some(&PlaneCall::DeleteImage(String::from(UPLOADED_IMAGE_ID)))
    );
    assert!(plane.images().is_empty());
    assert!(
        session
            .image_status()
            .is_some_and(|status| status.id == UPLOADED_IMAGE_ID && status.was_removed)
    );
}

#[rstest]
#[tokio::test]
async fn unanswered_boot_request_is_found_by_name_and_removed(mut plan: SessionPlan) {
    plan.timeouts.create = Duration::from_millis(50);
    let plane = ScriptedControlPlane::new();
    plane.hang("boot_instance");
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("boot should time out");

    assert!(matches!(
        err,
        ProvisionError::DeadlineExceeded { step: "create instance", .. }
    ));
    assert!(
        plane
            .calls()
            .contains(&PlaneCall::FindInstancesByName(String::from("VETTER-test")))
    );
    assert!(
        plane
            .calls()
            .contains(&PlaneCall::DeleteInstance(String::from(INSTANCE_ID)))
    );
    assert!(
        session
            .instance_status()
            .is_some_and(|status| status.was_removed)
    );
}

#[rstest]
#[tokio::test]
async fn rejected_boot_request_leaves_nothing_to_find(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    plane.fail(
        "boot_instance",
        ControlPlaneError::Forbidden {
            message: String::from("quota exceeded"),
        },
    );
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("boot should be rejected");

    assert!(matches!(
        err.control_plane(),
        Some(ControlPlaneError::Forbidden { .. })
    ));
    assert_eq!(plane.count("find_instances_by_name"), 1);
    assert_eq!(plane.count("delete_instance"), 0);
    assert!(session.instance_status().is_none());
}

#[rstest]
#[tokio::test]
async fn unanswered_keypair_request_is_removed_by_name(mut plan: SessionPlan) {
    plan.timeouts.keypair = Duration::from_millis(50);
    let plane = ScriptedControlPlane::new();
    plane.hang("create_keypair");
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("keypair should time out");

    assert!(matches!(
        err,
        ProvisionError::DeadlineExceeded { step: "create keypair", .. }
    ));
    assert_eq!(plane.count("create_image"), 0);
    assert!(
        plane
            .calls()
            .contains(&PlaneCall::DeleteKeypair(String::from("VETTER-test")))
    );
}

#[rstest]
#[tokio::test]
async fn missing_existing_image_fails_before_boot(mut plan: SessionPlan) {
    plan.image = ImageSource::Existing(String::from("image-missing"));
    let plane = ScriptedControlPlane::new();
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("lookup should fail");

    assert!(err.control_plane().is_some_and(ControlPlaneError::is_not_found));
    assert_eq!(plane.count("boot_instance"), 0);
    assert_eq!(plane.count("delete_keypair"), 1);
}

#[rstest]
#[tokio::test]
async fn keep_flags_preserve_resources_and_key_file(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    session.keep_failed_instance();
    session.keep_failed_image();
    session.cleanup().await;

    assert_eq!(plane.count("delete_instance"), 0);
    assert_eq!(plane.count("delete_keypair"), 0);
    assert_eq!(plane.count("delete_image"), 0);
    let key_file = session
        .kept_key_file()
        .unwrap_or_else(|| panic!("key file should be kept"))
        .to_path_buf();
    assert!(key_file.exists());
    std::fs::remove_file(&key_file).unwrap_or_else(|err| panic!("remove key: {err}"));
    assert!(session.resources().iter().all(ResourceStatus::needs_manual_cleanup));
}

#[rstest]
#[tokio::test]
async fn keep_flags_are_frozen_once_cleanup_started(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));
    session.cleanup().await;

    session.keep_failed_instance();
    session.keep_failed_image();

    assert!(
        session
            .resources()
            .iter()
            .all(|status| status.was_removed && status.deletable)
    );
}

#[rstest]
#[case::conflicting_regexp(Some("."), &[("a", &["10.0.0.1"][..]), ("b", &["10.0.0.2"][..])])]
#[case::no_match(Some("internet"), &[("local", &["10.0.0.1"][..])])]
#[tokio::test]
async fn ambiguous_or_missing_ip_triggers_cleanup(
    mut plan: SessionPlan,
    #[case] pattern: Option<&str>,
    #[case] networks: &[(&str, &[&str])],
) {
    plan.main_nic_regexp =
        pattern.map(|raw| regex::Regex::new(raw).unwrap_or_else(|err| panic!("regex: {err}")));
    let plane = ScriptedControlPlane::new();
    plane.set_networks(networks);
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("ip selection should fail");

    assert!(matches!(
        err,
        ProvisionError::NoIpFound { .. } | ProvisionError::MultipleIp { .. }
    ));
    assert_eq!(plane.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn ambiguous_flavor_name_is_rejected(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    plane.add_flavor(Flavor {
        id: String::from("flavor-2"),
        name: String::from("m1.small"),
        ..Flavor::default()
    });
    let mut session = session(&plane, plan);

    let err = session.prepare().await.expect_err("flavor should be ambiguous");

    assert!(matches!(
        err,
        ProvisionError::Flavor(FlavorError::Ambiguous { count: 2, .. })
    ));
    assert_eq!(plane.count("boot_instance"), 0);
}

#[rstest]
#[tokio::test]
async fn env_config_exports_instance_and_flavor_facts(plan: SessionPlan) {
    let plane = ScriptedControlPlane::new();
    let mut session = session(&plane, plan);
    session
        .prepare()
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    let env = session.env_config();
    session.cleanup().await;

    assert_eq!(env.get("instance_uuid").map(String::as_str), Some(INSTANCE_ID));
    assert_eq!(env.get("instance_name").map(String::as_str), Some("vetter-instance"));
    assert_eq!(env.get("main_ip").map(String::as_str), Some("192.0.2.10"));
    assert_eq!(env.get("ip_1").map(String::as_str), Some("192.0.2.10"));
    assert_eq!(env.get("flavor_ram").map(String::as_str), Some("2048"));
    assert_eq!(
        env.get("flavor_meta_hw:cpu_policy").map(String::as_str),
        Some("shared")
    );
}

#[tokio::test]
async fn published_image_is_never_deleted() {
    let plane = ScriptedControlPlane::new();

    let image = publish_image(&plane, &upload(), Duration::from_secs(5), FAST_POLL)
        .await
        .unwrap_or_else(|err| panic!("publish: {err}"));

    assert_eq!(image.id, UPLOADED_IMAGE_ID);
    assert_eq!(plane.operations(), vec!["create_image", "upload_image_data"]);
    assert!(plane.images().contains_key(UPLOADED_IMAGE_ID));
}

#[tokio::test]
async fn slow_publish_removes_the_partial_image() {
    let plane = ScriptedControlPlane::new();
    plane.hang("upload_image_data");

    let err = publish_image(&plane, &upload(), Duration::from_millis(50), Duration::from_secs(1))
        .await
        .expect_err("upload should time out");

    let ProvisionError::DeadlineExceeded { step, resource, .. } = err else {
        panic!("expected DeadlineExceeded, got {err:?}");
    };
    assert_eq!(step, "upload image");
    assert_eq!(resource.as_deref(), Some("VETTER-test"));
    assert_eq!(plane.count("delete_image"), 1);
    assert!(plane.images().is_empty());
}

#[tokio::test]
async fn rejected_publish_leaves_nothing_behind() {
    let plane = ScriptedControlPlane::new();
    plane.fail(
        "create_image",
        ControlPlaneError::Forbidden {
            message: String::from("image quota exceeded"),
        },
    );

    let err = publish_image(&plane, &upload(), Duration::from_secs(5), Duration::from_secs(1))
        .await
        .expect_err("create should be rejected");

    assert!(matches!(
        err.control_plane(),
        Some(ControlPlaneError::Forbidden { .. })
    ));
    assert_eq!(plane.count("delete_image"), 0);
}
