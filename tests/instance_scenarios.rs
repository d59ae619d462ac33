//! End-to-end instance scenarios driven against the in-memory daemon.

#[path = "common/harness.rs"]
mod harness;

use std::collections::BTreeMap;

use harness::{ALPINE, container, created, harness, map};
use lxd_provider::daemon::{
    InstanceServer, NetworkAddress, NetworkState, Scope, StateAction,
};
use lxd_provider::instance::{Device, DeviceType, STATUS_RUNNING, STATUS_STOPPED};
use lxd_provider::test_support::DaemonCall;
use lxd_provider::{FilePayload, InstanceResource, ResourceData};

fn interface(ipv4: &str, hwaddr: &str) -> NetworkState {
    NetworkState {
        addresses: vec![NetworkAddress {
            family: String::from("inet"),
            address: ipv4.to_owned(),
            netmask: String::from("24"),
            scope: String::from("global"),
        }],
        hwaddr: hwaddr.to_owned(),
    }
}

#[tokio::test]
async fn basic_container_runs_with_addresses() {
    let harness = harness();
    let data = created(&harness, container("c1")).await;

    assert_eq!(data.id, "c1");
    assert!(!data.partial);
    assert_eq!(data.state.status, STATUS_RUNNING);
    assert_eq!(data.state.profiles, vec![String::from("default")]);
    assert!(!data.state.ipv4_address.is_empty());
    assert_eq!(data.state.ip_address, data.state.ipv4_address);

    let runtime = harness
        .daemon
        .instance_state(&Scope::default(), "c1")
        .await
        .expect("state");
    let interfaces = runtime.interfaces();
    let first_nic = interfaces
        .iter()
        .find(|(name, _)| name.as_str() != "lo")
        .map(|(_, nic)| nic.hwaddr.clone())
        .expect("non-loopback interface");
    assert_eq!(data.state.mac_address, first_nic);

    let request = harness.daemon.created().into_iter().next().expect("request");
    assert_eq!(request.source.mode.as_deref(), Some("pull"));
    assert_eq!(
        request.source.server.as_deref(),
        Some("https://images.linuxcontainers.org")
    );
    assert_eq!(request.source.alias.as_deref(), Some("alpine/3.18/amd64"));
}

#[tokio::test]
async fn config_and_limits_are_partitioned_on_read() {
    let harness = harness();
    let declared = InstanceResource {
        config: map(&[("boot.autostart", "1"), ("user.dummy", "5")]),
        limits: map(&[("cpu", "1")]),
        ..container("c1")
    };
    let data = created(&harness, declared.clone()).await;

    assert_eq!(data.state.config, declared.config);
    assert_eq!(data.state.limits, map(&[("cpu", "1")]));
    assert!(!data.state.config.keys().any(|key| key.starts_with("limits.")));

    let record = harness.daemon.instance_record("c1").expect("record");
    assert_eq!(record.config.get("limits.cpu").map(String::as_str), Some("1"));
    assert!(record.config.contains_key("volatile.base_image"));
    assert!(!declared.needs_update(&data.state));
}

#[tokio::test]
async fn reapplying_an_unchanged_declaration_mutates_nothing() {
    let harness = harness();
    let declared = InstanceResource {
        config: map(&[("user.dummy", "5")]),
        limits: map(&[("memory", "512MiB")]),
        ..container("c1")
    };
    let mut data = created(&harness, declared.clone()).await;
    harness.daemon.clear_calls();

    harness
        .engine
        .update(&declared, &mut data)
        .await
        .expect("update");

    assert!(harness.daemon.mutations().is_empty());
}

#[tokio::test]
async fn privileged_instance_keeps_its_flag_across_reapply() {
    let harness = harness();
    let declared = InstanceResource {
        privileged: true,
        config: map(&[("user.dummy", "1")]),
        ..container("c1")
    };
    let mut data = created(&harness, declared.clone()).await;

    assert!(!data.state.privileged);
    assert!(!declared.needs_update(&data.state));

    let observed = data.state.clone();
    data.state = InstanceResource {
        config: map(&[("user.dummy", "2")]),
        ..declared
    };
    harness
        .engine
        .update(&observed, &mut data)
        .await
        .expect("update");

    let record = harness.daemon.instance_record("c1").expect("record");
    assert_eq!(
        record.config.get("security.privileged").map(String::as_str),
        Some("true")
    );
    assert_eq!(record.config.get("user.dummy").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn config_churn_updates_in_place_without_restart() {
    let harness = harness();
    let prior = InstanceResource {
        config: map(&[("boot.autostart", "1"), ("user.dummy", "5")]),
        limits: map(&[("cpu", "1")]),
        ..container("c1")
    };
    let mut data = created(&harness, prior.clone()).await;
    harness.daemon.clear_calls();

    data.state = InstanceResource {
        config: map(&[("user.dummy", "5"), ("user.user-data", "#cloud-config")]),
        ..prior.clone()
    };
    harness
        .engine
        .update(&prior, &mut data)
        .await
        .expect("update");

    let record = harness.daemon.instance_record("c1").expect("record");
    assert!(!record.config.contains_key("boot.autostart"));
    assert_eq!(record.config.get("user.dummy").map(String::as_str), Some("5"));
    assert_eq!(
        record.config.get("user.user-data").map(String::as_str),
        Some("#cloud-config")
    );
    assert_eq!(record.config.get("limits.cpu").map(String::as_str), Some("1"));
    assert!(
        !harness
            .daemon
            .mutations()
            .iter()
            .any(|call| matches!(call, DaemonCall::ChangeState(..)))
    );
    assert_eq!(data.state.status, STATUS_RUNNING);
}

#[tokio::test]
async fn access_interface_selects_declared_nic() {
    let harness = harness();
    let declared = InstanceResource {
        config: map(&[("user.access_interface", "eth0")]),
        devices: vec![Device {
            name: String::from("eth0"),
            kind: DeviceType::Nic,
            properties: map(&[("network", "lxdbr0"), ("ipv4.address", "10.150.19.200")]),
        }],
        ..container("c1")
    };
    let mut data = created(&harness, declared).await;
    assert_eq!(data.state.ip_address, "10.150.19.200");

    let mut interfaces = BTreeMap::new();
    interfaces.insert(String::from("eth0"), interface("10.150.19.200", "00:16:3e:aa:00:01"));
    interfaces.insert(String::from("dummy0"), interface("192.168.9.9", "00:16:3e:aa:00:02"));
    harness.daemon.set_interfaces("c1", interfaces);
    harness.engine.read(&mut data).await.expect("read");

    assert_eq!(data.state.ip_address, "10.150.19.200");
    assert_eq!(data.state.ipv4_address, "10.150.19.200");
    assert_eq!(data.state.mac_address, "00:16:3e:aa:00:01");
}

#[tokio::test]
async fn files_are_uploaded_then_replaced_on_change() {
    let harness = harness();
    let hello = FilePayload {
        target_file: String::from("/foo/bar.txt"),
        content: String::from("Hello, World!\n"),
        mode: String::from("0644"),
        create_directories: true,
        ..FilePayload::default()
    };
    let prior = InstanceResource {
        files: vec![hello.clone()],
        ..container("c1")
    };
    let mut data = created(&harness, prior.clone()).await;

    let stored = harness
        .daemon
        .stored_file("c1", "/foo/bar.txt")
        .expect("uploaded");
    assert_eq!(stored.content, b"Hello, World!\n".to_vec());
    assert_eq!(stored.mode, 0o644);
    assert!(harness.daemon.stored_file("c1", "/foo").is_some());

    harness.daemon.clear_calls();
    data.state = InstanceResource {
        files: vec![FilePayload {
            content: String::from("Goodbye, World!\n"),
            ..hello
        }],
        ..prior.clone()
    };
    harness
        .engine
        .update(&prior, &mut data)
        .await
        .expect("update");

    let stored = harness
        .daemon
        .stored_file("c1", "/foo/bar.txt")
        .expect("replaced");
    assert_eq!(stored.content, b"Goodbye, World!\n".to_vec());
    assert_eq!(
        harness.daemon.mutations(),
        vec![
            DaemonCall::DeleteFile(String::from("/foo/bar.txt")),
            DaemonCall::PushFile(String::from("/foo/bar.txt")),
        ]
    );
}

#[tokio::test]
async fn stopped_on_create_skips_start_and_network() {
    let harness = harness();
    let declared = InstanceResource {
        start_on_create: false,
        ..container("c1")
    };
    let mut data = created(&harness, declared).await;

    assert_eq!(data.state.status, STATUS_STOPPED);
    assert!(data.state.ip_address.is_empty());
    assert!(
        !harness
            .daemon
            .calls()
            .iter()
            .any(|call| matches!(call, DaemonCall::ChangeState(_, StateAction::Start)))
    );
    harness.engine.read(&mut data).await.expect("read");
    assert_eq!(data.id, "c1");
}

#[tokio::test]
async fn import_reconstructs_state_without_image() {
    let harness = harness();
    let original = created(&harness, container("c1")).await;

    let imported = harness.engine.import("c1").await.expect("import");

    assert_eq!(imported.id, "c1");
    assert_eq!(imported.state.name, "c1");
    assert!(imported.state.image.is_empty());
    assert!(imported.state.remote.is_empty());
    assert_eq!(imported.state.profiles, original.state.profiles);
    assert_eq!(imported.state.devices, original.state.devices);
    assert_eq!(imported.state.ipv4_address, original.state.ipv4_address);
}

#[tokio::test]
async fn import_with_image_suffix_records_the_image() {
    let harness = harness();
    created(&harness, container("c1")).await;

    let imported = harness
        .engine
        .import(&format!("local:c1/{ALPINE}"))
        .await
        .expect("import");

    assert_eq!(imported.state.image, ALPINE);
    assert!(imported.state.remote.is_empty());
}

#[tokio::test]
async fn update_issues_one_record_write_then_file_deletes_then_uploads() {
    let harness = harness();
    let motd = FilePayload {
        target_file: String::from("/etc/motd"),
        content: String::from("one"),
        ..FilePayload::default()
    };
    let issue = FilePayload {
        target_file: String::from("/etc/issue"),
        content: String::from("one"),
        ..FilePayload::default()
    };
    let prior = InstanceResource {
        config: map(&[("user.dummy", "1")]),
        limits: map(&[("cpu", "1")]),
        devices: vec![Device {
            name: String::from("data"),
            kind: DeviceType::Disk,
            properties: map(&[("source", "/srv"), ("path", "/mnt")]),
        }],
        files: vec![motd.clone(), issue.clone()],
        ..container("c1")
    };
    let mut data = created(&harness, prior.clone()).await;
    harness.daemon.clear_calls();

    data.state = InstanceResource {
        config: map(&[("user.dummy", "2")]),
        limits: map(&[("cpu", "2")]),
        profiles: vec![String::from("default"), String::from("extra")],
        devices: vec![Device {
            name: String::from("data"),
            kind: DeviceType::Disk,
            properties: map(&[("source", "/srv/v2"), ("path", "/mnt")]),
        }],
        files: vec![
            FilePayload {
                content: String::from("two"),
                ..motd
            },
            FilePayload {
                content: String::from("two"),
                ..issue
            },
        ],
        ..prior.clone()
    };
    harness
        .engine
        .update(&prior, &mut data)
        .await
        .expect("update");

    assert_eq!(
        harness.daemon.mutations(),
        vec![
            DaemonCall::UpdateInstance(String::from("c1")),
            DaemonCall::DeleteFile(String::from("/etc/motd")),
            DaemonCall::DeleteFile(String::from("/etc/issue")),
            DaemonCall::PushFile(String::from("/etc/motd")),
            DaemonCall::PushFile(String::from("/etc/issue")),
        ]
    );
    let record = harness.daemon.instance_record("c1").expect("record");
    assert_eq!(record.config.get("limits.cpu").map(String::as_str), Some("2"));
    assert_eq!(
        record.profiles,
        vec![String::from("default"), String::from("extra")]
    );
    assert_eq!(
        record
            .devices
            .get("data")
            .and_then(|device| device.get("source"))
            .map(String::as_str),
        Some("/srv/v2")
    );
}

#[tokio::test]
async fn project_and_target_bind_every_call() {
    let harness = harness();
    let declared = InstanceResource {
        project: String::from("dev"),
        target: String::from("node2"),
        ..container("c1")
    };
    let data = created(&harness, declared).await;

    assert_eq!(data.state.target, "node2");
    assert_eq!(data.state.project, "dev");
    let scopes = harness.daemon.scopes();
    assert!(!scopes.is_empty());
    assert!(scopes.iter().all(|scope| {
        scope.project.as_deref() == Some("dev") && scope.target.as_deref() == Some("node2")
    }));
}

#[tokio::test]
async fn exists_tracks_the_daemon() {
    let harness = harness();
    let mut data = created(&harness, container("c1")).await;
    assert!(harness.engine.exists(&data).await.expect("exists"));

    harness.engine.delete(&data).await.expect("delete");
    assert!(!harness.engine.exists(&data).await.expect("exists"));

    harness.engine.read(&mut data).await.expect("read");
    assert!(!data.has_id());
    assert!(
        !harness
            .engine
            .exists(&ResourceData::new(container("c1")))
            .await
            .expect("exists")
    );
}
