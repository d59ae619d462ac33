//! Shared wiring between the instance engine and an in-memory daemon.

use std::sync::Arc;
use std::time::Duration;

use lxd_provider::config::{LxdEnvConfig, ProviderConfig};
use lxd_provider::daemon::StringMap;
use lxd_provider::remote::Connector;
use lxd_provider::test_support::{FakeConnector, FakeDaemon, immediate_waiter};
use lxd_provider::{InstanceEngine, InstanceResource, RemoteResolver, ResourceData};

/// Catalog image used by the scenarios.
pub const ALPINE: &str = "images:alpine/3.18/amd64";

/// Engine plus the fakes behind it.
pub struct Harness {
    pub daemon: Arc<FakeDaemon>,
    pub connector: Arc<FakeConnector>,
    pub engine: InstanceEngine,
}

pub fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(2))
}

pub fn harness_with_timeout(timeout: Duration) -> Harness {
    let daemon = Arc::new(FakeDaemon::new());
    let connector = Arc::new(FakeConnector::new().with_daemon("local", Arc::clone(&daemon)));
    let config = ProviderConfig::default()
        .resolve(&LxdEnvConfig::default())
        .expect("default configuration resolves");
    let resolver = Arc::new(RemoteResolver::new(
        config,
        Arc::clone(&connector) as Arc<dyn Connector>,
    ));
    let engine = InstanceEngine::new(resolver, immediate_waiter(timeout));
    Harness {
        daemon,
        connector,
        engine,
    }
}

pub fn map(pairs: &[(&str, &str)]) -> StringMap {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}

pub fn container(name: &str) -> InstanceResource {
    InstanceResource {
        name: name.to_owned(),
        image: ALPINE.to_owned(),
        profiles: vec![String::from("default")],
        ..InstanceResource::default()
    }
}

pub async fn created(harness: &Harness, declared: InstanceResource) -> ResourceData {
    let mut data = ResourceData::new(declared);
    harness
        .engine
        .create(&mut data)
        .await
        .expect("create succeeds");
    data
}
