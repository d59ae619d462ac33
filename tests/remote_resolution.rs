//! Remote resolution: probing, caching, binding and provider wiring.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use lxd_provider::config::{ConfigError, LxdEnvConfig, ProviderConfig, RemoteConfig};
use lxd_provider::remote::{Connector, ImageServer};
use lxd_provider::test_support::{DaemonCall, FakeConnector, FakeDaemon, Failure};
use lxd_provider::{Provider, RemoteResolver, ResolveError};
use rstest::rstest;
use tempfile::TempDir;

fn provider_config(remotes: Vec<RemoteConfig>, config_dir: Option<Utf8PathBuf>) -> ProviderConfig {
    ProviderConfig {
        remotes,
        config_dir,
        ..ProviderConfig::default()
    }
}

fn https_remote(name: &str) -> RemoteConfig {
    RemoteConfig {
        name: name.to_owned(),
        address: Some(String::from("10.0.0.5")),
        scheme: Some(String::from("https")),
        ..RemoteConfig::default()
    }
}

fn resolver_with(
    config: &ProviderConfig,
    connector: &Arc<FakeConnector>,
) -> RemoteResolver {
    let resolved = config
        .resolve(&LxdEnvConfig::default())
        .expect("configuration resolves");
    RemoteResolver::new(resolved, Arc::clone(connector) as Arc<dyn Connector>)
}

#[tokio::test]
async fn each_remote_is_probed_once() {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = Arc::new(FakeConnector::new().with_daemon("local", Arc::clone(&daemon)));
    let resolver = resolver_with(&ProviderConfig::default(), &connector);

    let first = resolver.session_for(None).await.expect("first");
    let second = resolver.session_for(Some("local")).await.expect("second");
    let third = resolver.session_for(Some("  ")).await.expect("blank");

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(connector.connects(), vec![String::from("local")]);
    let probes = daemon
        .calls()
        .into_iter()
        .filter(|call| *call == DaemonCall::ServerInfo)
        .count();
    assert_eq!(probes, 1);
}

#[tokio::test]
async fn concurrent_first_use_shares_one_probe() {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = Arc::new(FakeConnector::new().with_daemon("local", Arc::clone(&daemon)));
    let resolver = Arc::new(resolver_with(&ProviderConfig::default(), &connector));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = Arc::clone(&resolver);
            tokio::spawn(async move { shared.session_for(None).await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join").expect("session");
    }

    assert_eq!(connector.connects().len(), 1);
}

#[tokio::test]
async fn failed_probe_reports_unreachable_and_is_retried() {
    let daemon = Arc::new(FakeDaemon::new());
    daemon.fail(Failure::Probe);
    let connector = Arc::new(FakeConnector::new().with_daemon("local", Arc::clone(&daemon)));
    let resolver = resolver_with(&ProviderConfig::default(), &connector);

    let err = resolver.session_for(None).await.expect_err("probe fails");
    assert!(
        matches!(err, ResolveError::Unreachable { ref remote, .. } if remote == "local"),
        "unexpected error: {err}"
    );

    daemon.heal(Failure::Probe);
    resolver.session_for(None).await.expect("recovered");
    assert_eq!(connector.connects().len(), 2);
}

#[tokio::test]
async fn unresponsive_remote_does_not_block_other_remotes() {
    let stalled = Arc::new(FakeDaemon::new());
    stalled.fail(Failure::Unresponsive);
    let healthy = Arc::new(FakeDaemon::new());
    let connector = Arc::new(
        FakeConnector::new()
            .with_daemon("local", Arc::clone(&healthy))
            .with_daemon("edge", Arc::clone(&stalled)),
    );
    let config = provider_config(
        vec![RemoteConfig {
            name: String::from("edge"),
            address: Some(String::from("/run/edge.socket")),
            ..RemoteConfig::default()
        }],
        None,
    );
    let resolver = Arc::new(resolver_with(&config, &connector));

    let pending = {
        let shared = Arc::clone(&resolver);
        tokio::spawn(async move { shared.session_for(Some("edge")).await })
    };
    tokio::time::timeout(Duration::from_secs(1), async {
        while !stalled.calls().contains(&DaemonCall::ServerInfo) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("edge connection started");

    let session = tokio::time::timeout(Duration::from_secs(1), resolver.session_for(None))
        .await
        .expect("local resolves while edge stalls")
        .expect("local session");
    assert_eq!(session.remote(), "local");
    assert!(!pending.is_finished());
    pending.abort();
}

#[tokio::test]
async fn unknown_remote_is_a_config_error() {
    let connector = Arc::new(FakeConnector::new());
    let resolver = resolver_with(&ProviderConfig::default(), &connector);

    let err = resolver
        .session_for(Some("nowhere"))
        .await
        .expect_err("unknown");

    assert_eq!(
        err,
        ResolveError::Config(ConfigError::UnknownRemote(String::from("nowhere")))
    );
    assert!(connector.connects().is_empty());
}

#[rstest]
#[case::images("images", "https://images.linuxcontainers.org")]
#[case::ubuntu("ubuntu", "https://cloud-images.ubuntu.com/releases")]
#[tokio::test]
async fn catalogs_serve_images_but_not_instances(#[case] name: &str, #[case] url: &str) {
    let connector = Arc::new(FakeConnector::new());
    let resolver = resolver_with(&ProviderConfig::default(), &connector);

    let server = resolver.image_server(name).await.expect("catalog");
    assert_eq!(
        server,
        ImageServer::Catalog {
            remote: name.to_owned(),
            url: url.to_owned(),
            protocol: String::from("simplestreams"),
        }
    );

    let err = resolver.session_for(Some(name)).await.expect_err("catalog");
    assert!(matches!(err, ResolveError::CatalogRemote { .. }));
    assert!(connector.connects().is_empty());
}

#[tokio::test]
async fn https_remote_without_trust_material_fails() {
    let dir = TempDir::new().expect("tempdir");
    let config_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    let connector = Arc::new(FakeConnector::new());
    let resolver = resolver_with(
        &provider_config(vec![https_remote("edge")], Some(config_dir)),
        &connector,
    );

    let err = resolver
        .session_for(Some("edge"))
        .await
        .expect_err("no certs");

    assert!(
        matches!(err, ResolveError::Trust { ref remote, .. } if remote == "edge"),
        "unexpected error: {err}"
    );
    assert!(connector.connects().is_empty());
}

#[tokio::test]
async fn https_remote_with_trust_material_connects() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("client.crt"), "CERT").expect("write cert");
    std::fs::write(dir.path().join("client.key"), "KEY").expect("write key");
    let config_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    let daemon = Arc::new(FakeDaemon::new());
    let connector = Arc::new(FakeConnector::new().with_daemon("edge", Arc::clone(&daemon)));
    let resolver = resolver_with(
        &provider_config(vec![https_remote("edge")], Some(config_dir)),
        &connector,
    );

    let session = resolver.session_for(Some("edge")).await.expect("session");

    assert_eq!(session.endpoint(), "https://10.0.0.5:8443");
    assert_eq!(session.remote(), "edge");
    assert_eq!(session.default_remote(), "local");
}

#[tokio::test]
async fn binding_changes_identity_but_not_connection() {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = Arc::new(FakeConnector::new().with_daemon("local", Arc::clone(&daemon)));
    let resolver = resolver_with(&ProviderConfig::default(), &connector);
    let base = resolver.session_for(None).await.expect("session");

    let scoped = base.bind_project("dev").bind_target("node1");
    assert_ne!(scoped, base);
    assert_eq!(scoped.project(), Some("dev"));
    assert_eq!(scoped.target(), Some("node1"));
    assert_eq!(base.project(), None);

    let cleared = scoped.bind_project("").bind_target("");
    assert_eq!(cleared, base);
    assert_eq!(connector.connects().len(), 1);
}

#[rstest]
#[case::bare("c1", "local", "c1")]
#[case::qualified("edge:c1", "edge", "c1")]
#[case::empty_prefix(":c1", "local", "c1")]
#[case::image_path("images:alpine/3.18", "images", "alpine/3.18")]
fn qualified_names_split_on_first_colon(
    #[case] input: &str,
    #[case] remote: &str,
    #[case] name: &str,
) {
    let connector = Arc::new(FakeConnector::new());
    let resolver = resolver_with(&ProviderConfig::default(), &connector);

    assert_eq!(
        resolver.parse_remote(input),
        (remote.to_owned(), name.to_owned())
    );
}

#[tokio::test]
async fn provider_serialises_creation_and_cancels_waits() {
    let resolved = ProviderConfig::default()
        .resolve(&LxdEnvConfig::default())
        .expect("resolves");
    let provider = Arc::new(Provider::new(resolved, Arc::new(FakeConnector::new())));

    let guard = provider.serialize_creation().await;
    let contender = Arc::clone(&provider);
    let blocked = tokio::spawn(async move {
        let _inner = contender.serialize_creation().await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());
    drop(guard);
    blocked.await.expect("second holder proceeds");

    let waiter = provider.waiter();
    assert_eq!(waiter.policy().initial_delay, Duration::from_secs(10));
    provider.cancel();
    assert!(provider.cancellation().is_cancelled());
}
