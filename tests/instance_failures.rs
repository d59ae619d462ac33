//! Failure paths, deletion and deferred uploads of the instance engine.

#[path = "common/harness.rs"]
mod harness;

use std::time::Duration;

use harness::{container, created, harness, harness_with_timeout, map};
use lxd_provider::daemon::{StateAction, StringMap};
use lxd_provider::instance::{InstanceKind, STATUS_RUNNING};
use lxd_provider::test_support::{DaemonCall, Failure};
use lxd_provider::wait::WaitError;
use lxd_provider::{FilePayload, InstanceError, InstanceResource, ResourceData};
use rstest::rstest;

#[tokio::test]
async fn start_failure_leaves_a_partial_resource() {
    let harness = harness();
    harness.daemon.fail(Failure::Start);
    let mut data = ResourceData::new(container("c1"));

    let err = harness
        .engine
        .create(&mut data)
        .await
        .expect_err("start fails");

    assert_eq!(data.id, "c1");
    assert!(data.partial);
    let message = err.to_string();
    assert!(
        message.contains("failed to start instance (c1)"),
        "unexpected message: {message}"
    );
    assert!(message.contains("apparmor denied"), "unexpected message: {message}");
}

#[tokio::test]
async fn missing_network_times_out_with_last_state() {
    let harness = harness_with_timeout(Duration::from_millis(250));
    harness.daemon.fail(Failure::Network);
    let mut data = ResourceData::new(container("c1"));

    let err = harness
        .engine
        .create(&mut data)
        .await
        .expect_err("network never appears");

    assert!(data.partial);
    let InstanceError::Wait { source, .. } = err else {
        panic!("expected wait error, got {err:?}");
    };
    assert!(matches!(
        *source,
        WaitError::Timeout { ref last_state, .. } if last_state == "Pending"
    ));
}

#[tokio::test]
async fn wait_for_network_false_skips_the_gate() {
    let harness = harness();
    harness.daemon.fail(Failure::Network);
    let declared = InstanceResource {
        wait_for_network: false,
        ..container("c1")
    };

    let data = created(&harness, declared).await;

    assert_eq!(data.state.status, STATUS_RUNNING);
    assert!(data.state.ipv4_address.is_empty());
}

#[rstest]
#[case::limits_in_config(map(&[("limits.cpu", "2")]), "images:alpine/3.18")]
#[case::unreflected_config_key(map(&[("cloud-init.user-data", "#cloud-config")]), "images:alpine/3.18")]
#[case::empty_image_alias(map(&[]), "images:")]
#[case::empty_image_remote(map(&[]), ":alpine/3.18")]
#[tokio::test]
async fn invalid_declaration_fails_before_any_call(
    #[case] config: StringMap,
    #[case] image: &str,
) {
    let harness = harness();
    let declared = InstanceResource {
        config,
        image: image.to_owned(),
        ..container("c1")
    };
    let mut data = ResourceData::new(declared);

    let err = harness
        .engine
        .create(&mut data)
        .await
        .expect_err("invalid");

    assert!(matches!(err, InstanceError::Validation(_)));
    assert!(harness.daemon.calls().is_empty());
    assert!(!data.has_id());
}

#[tokio::test]
async fn unknown_local_image_is_reported() {
    let harness = harness();
    let declared = InstanceResource {
        image: String::from("missing"),
        ..container("c1")
    };
    let mut data = ResourceData::new(declared);

    let err = harness
        .engine
        .create(&mut data)
        .await
        .expect_err("image missing");

    assert!(matches!(
        err,
        InstanceError::ImageNotFound { ref image, ref remote } if image == "missing" && remote == "local"
    ));
    assert!(harness.daemon.mutations().is_empty());
}

#[tokio::test]
async fn local_alias_resolves_to_fingerprint() {
    let harness = harness();
    harness.daemon.add_image("alpine", "a1b2c3");
    let declared = InstanceResource {
        image: String::from("alpine"),
        ..container("c1")
    };

    created(&harness, declared).await;

    let request = harness.daemon.created().into_iter().next().expect("request");
    assert_eq!(request.source.fingerprint.as_deref(), Some("a1b2c3"));
    assert_eq!(request.source.mode, None);
    assert_eq!(request.source.alias, None);
}

#[tokio::test]
async fn stale_version_token_surfaces_as_conflict() {
    let harness = harness();
    let prior = container("c1");
    let mut data = created(&harness, prior.clone()).await;
    harness.daemon.fail(Failure::VersionMismatch);

    data.state = InstanceResource {
        config: map(&[("user.dummy", "9")]),
        ..prior.clone()
    };
    let err = harness
        .engine
        .update(&prior, &mut data)
        .await
        .expect_err("conflict");

    assert!(err.is_conflict(), "unexpected error: {err}");
}

#[tokio::test]
async fn delete_stops_a_running_instance_first() {
    let harness = harness();
    let data = created(&harness, container("c1")).await;
    harness.daemon.clear_calls();

    harness.engine.delete(&data).await.expect("delete");

    assert_eq!(
        harness.daemon.mutations(),
        vec![
            DaemonCall::ChangeState(String::from("c1"), StateAction::Stop),
            DaemonCall::DeleteInstance(String::from("c1")),
        ]
    );
    assert!(harness.daemon.instance_record("c1").is_none());
}

#[tokio::test]
async fn ephemeral_instance_vanishing_on_stop_counts_as_deleted() {
    let harness = harness();
    let declared = InstanceResource {
        ephemeral: true,
        ..container("eph")
    };
    let data = created(&harness, declared).await;
    harness.daemon.clear_calls();

    harness.engine.delete(&data).await.expect("delete");

    assert!(harness.daemon.instance_record("eph").is_none());
    assert!(
        !harness
            .daemon
            .mutations()
            .iter()
            .any(|call| matches!(call, DaemonCall::DeleteInstance(_)))
    );
}

#[tokio::test]
async fn deleting_a_missing_instance_succeeds() {
    let harness = harness();
    let mut data = ResourceData::new(container("ghost"));
    data.id = String::from("ghost");

    harness.engine.delete(&data).await.expect("absent is fine");

    assert!(harness.daemon.mutations().is_empty());
}

#[tokio::test]
async fn virtual_machine_files_wait_for_the_agent() {
    let harness = harness();
    let declared = InstanceResource {
        kind: InstanceKind::VirtualMachine,
        start_on_create: false,
        wait_for_network: false,
        files: vec![FilePayload {
            target_file: String::from("/root/hello"),
            content: String::from("hi"),
            ..FilePayload::default()
        }],
        ..container("vm1")
    };

    let data = created(&harness, declared).await;

    assert_eq!(data.state.kind, InstanceKind::VirtualMachine);
    assert_eq!(data.state.status, STATUS_RUNNING);
    let calls = harness.daemon.mutations();
    let started = calls
        .iter()
        .position(|call| matches!(call, DaemonCall::ChangeState(_, StateAction::Start)))
        .expect("started");
    let pushed = calls
        .iter()
        .position(|call| matches!(call, DaemonCall::PushFile(_)))
        .expect("pushed");
    assert!(started < pushed);
    assert_eq!(
        harness
            .daemon
            .stored_file("vm1", "/root/hello")
            .map(|file| file.content),
        Some(b"hi".to_vec())
    );
}

#[tokio::test]
async fn duplicate_create_is_rejected_by_the_daemon() {
    let harness = harness();
    created(&harness, container("c1")).await;
    let mut again = ResourceData::new(container("c1"));

    let err = harness
        .engine
        .create(&mut again)
        .await
        .expect_err("already exists");

    assert!(err.is_conflict(), "unexpected error: {err}");
    assert!(!again.has_id());
}
