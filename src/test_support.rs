//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeDaemon`] implements the daemon capability set in memory so the
//! engine can be driven end to end without a real daemon.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::ResolvedRemote;
use crate::daemon::{
    API_EXTENSION_CLUSTERING, API_EXTENSION_FILE_DELETE, API_EXTENSION_VMS, DaemonError,
    DaemonFuture, FileKind, FilePush, Image, ImageAlias, Instance, InstanceFile, InstancePut,
    InstanceServer, InstanceState, InstanceType, InstancesPost, NetworkAddress, NetworkState,
    Operation, Scope, ServerEnvironment, ServerInfo, StateAction, StatePut, WriteMode,
};
use crate::remote::{Connector, ResolveError, TrustMaterial};
use crate::wait::{WaitPolicy, Waiter};

const SEEDED_DIRECTORIES: [&str; 5] = ["/", "/etc", "/home", "/root", "/tmp"];
const INTERNAL_CONFIG_KEY: &str = "volatile.base_image";

/// A daemon call recorded by [`FakeDaemon`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DaemonCall {
    /// `GET /1.0`
    ServerInfo,
    /// Alias lookup.
    ImageAlias(String),
    /// Image lookup.
    Image(String),
    /// Instance creation.
    CreateInstance(String),
    /// Instance record fetch.
    GetInstance(String),
    /// Runtime state fetch.
    GetState(String),
    /// Record update.
    UpdateInstance(String),
    /// State change.
    ChangeState(String, StateAction),
    /// Instance deletion.
    DeleteInstance(String),
    /// Operation wait.
    WaitOperation(String),
    /// File or directory push.
    PushFile(String),
    /// File deletion.
    DeleteFile(String),
    /// File fetch.
    GetFile(String),
}

impl DaemonCall {
    /// Returns `true` for calls that change daemon state.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateInstance(_)
                | Self::UpdateInstance(_)
                | Self::ChangeState(..)
                | Self::DeleteInstance(_)
                | Self::PushFile(_)
                | Self::DeleteFile(_)
        )
    }
}

/// Failures [`FakeDaemon`] can be told to inject.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Failure {
    /// The capability probe fails.
    Probe,
    /// Server-info requests never answer.
    Unresponsive,
    /// Start operations fail.
    Start,
    /// Running instances never report addresses.
    Network,
    /// Every record update reports a stale version token.
    VersionMismatch,
}

#[derive(Clone, Debug)]
struct FakeInstance {
    record: Instance,
    version: u64,
    network: Option<BTreeMap<String, NetworkState>>,
    files: BTreeMap<String, InstanceFile>,
}

impl FakeInstance {
    fn etag(&self) -> String {
        format!("\"{}-{}\"", self.record.name, self.version)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    aliases: BTreeMap<String, String>,
    images: BTreeSet<String>,
    failures: BTreeSet<Failure>,
    calls: Vec<DaemonCall>,
    scopes: Vec<Scope>,
    created: Vec<InstancesPost>,
    next_host: u8,
}

/// In-memory daemon implementing [`InstanceServer`].
#[derive(Debug, Default)]
pub struct FakeDaemon {
    state: StdMutex<FakeState>,
}

impl FakeDaemon {
    /// Creates an empty daemon.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `alias` resolve to `fingerprint` and registers the image.
    pub fn add_image(&self, alias: &str, fingerprint: &str) {
        let mut state = self.lock();
        state.aliases.insert(alias.to_owned(), fingerprint.to_owned());
        state.images.insert(fingerprint.to_owned());
    }

    /// Turns on an injected failure.
    pub fn fail(&self, failure: Failure) {
        self.lock().failures.insert(failure);
    }

    /// Turns off an injected failure.
    pub fn heal(&self, failure: Failure) {
        self.lock().failures.remove(&failure);
    }

    /// Snapshot of every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DaemonCall> {
        self.lock().calls.clone()
    }

    /// Snapshot of the calls that changed daemon state.
    #[must_use]
    pub fn mutations(&self) -> Vec<DaemonCall> {
        self.calls()
            .into_iter()
            .filter(DaemonCall::is_mutation)
            .collect()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Scopes passed with every scoped call, in order.
    #[must_use]
    pub fn scopes(&self) -> Vec<Scope> {
        self.lock().scopes.clone()
    }

    /// Create requests received so far.
    #[must_use]
    pub fn created(&self) -> Vec<InstancesPost> {
        self.lock().created.clone()
    }

    /// Current record of `name` with the daemon's full configuration.
    #[must_use]
    pub fn instance_record(&self, name: &str) -> Option<Instance> {
        self.lock()
            .instances
            .get(name)
            .map(|instance| instance.record.clone())
    }

    /// File stored at `path` inside `name`.
    #[must_use]
    pub fn stored_file(&self, name: &str, path: &str) -> Option<InstanceFile> {
        self.lock()
            .instances
            .get(name)
            .and_then(|instance| instance.files.get(path).cloned())
    }

    /// Replaces the interfaces reported for a running instance.
    pub fn set_interfaces(&self, name: &str, interfaces: BTreeMap<String, NetworkState>) {
        if let Some(instance) = self.lock().instances.get_mut(name) {
            instance.network = Some(interfaces);
        }
    }

    /// Simulates an out-of-band change that bumps the version token.
    pub fn touch(&self, name: &str) {
        if let Some(instance) = self.lock().instances.get_mut(name) {
            instance.version += 1;
        }
    }

    fn record(&self, call: DaemonCall, scope: Option<&Scope>) -> StdMutexGuard<'_, FakeState> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(bound) = scope {
            state.scopes.push(bound.clone());
        }
        state
    }
}

fn not_found(what: &str) -> DaemonError {
    DaemonError::NotFound(format!("{what} not found"))
}

fn completed() -> Operation {
    Operation {
        id: uuid::Uuid::new_v4().to_string(),
        class: String::from("task"),
        status: String::from("Success"),
        status_code: 200,
        err: String::new(),
    }
}

fn failed(message: &str) -> Operation {
    Operation {
        status: String::from("Failure"),
        status_code: 400,
        err: message.to_owned(),
        ..completed()
    }
}

fn address(family: &str, text: &str, netmask: &str, scope: &str) -> NetworkAddress {
    NetworkAddress {
        family: family.to_owned(),
        address: text.to_owned(),
        netmask: netmask.to_owned(),
        scope: scope.to_owned(),
    }
}

fn boot_network(record: &Instance, host: u8) -> BTreeMap<String, NetworkState> {
    let nic = record
        .devices
        .iter()
        .find(|(_, device)| device.get("type").map(String::as_str) == Some("nic"));
    let interface = nic.map_or_else(|| String::from("eth0"), |(name, _)| name.clone());
    let ipv4 = nic
        .and_then(|(_, device)| device.get("ipv4.address").cloned())
        .unwrap_or_else(|| format!("10.0.3.{host}"));

    let mut table = BTreeMap::new();
    table.insert(
        String::from("lo"),
        NetworkState {
            addresses: vec![
                address("inet", "127.0.0.1", "8", "local"),
                address("inet6", "::1", "128", "local"),
            ],
            hwaddr: String::new(),
        },
    );
    table.insert(
        interface,
        NetworkState {
            addresses: vec![
                address("inet", &ipv4, "24", "global"),
                address("inet6", &format!("fd42::{host:x}"), "64", "global"),
                address("inet6", &format!("fe80::{host:x}"), "64", "link"),
            ],
            hwaddr: format!("00:16:3e:00:00:{host:02x}"),
        },
    );
    table
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => path.get(..index).unwrap_or("/"),
    }
}

impl InstanceServer for FakeDaemon {
    fn server_info(&self) -> DaemonFuture<'_, ServerInfo> {
        Box::pin(async move {
            let (unresponsive, probe_failed) = {
                let state = self.record(DaemonCall::ServerInfo, None);
                (
                    state.failures.contains(&Failure::Unresponsive),
                    state.failures.contains(&Failure::Probe),
                )
            };
            if unresponsive {
                std::future::pending::<()>().await;
                return Err(not_found("server"));
            }
            if probe_failed {
                return Err(DaemonError::Transport {
                    endpoint: String::from("fake"),
                    message: String::from("connection refused"),
                });
            }
            Ok(ServerInfo {
                api_extensions: vec![
                    API_EXTENSION_VMS.to_owned(),
                    API_EXTENSION_FILE_DELETE.to_owned(),
                    API_EXTENSION_CLUSTERING.to_owned(),
                ],
                api_version: String::from("1.0"),
                auth: String::from("trusted"),
                environment: ServerEnvironment {
                    server_name: String::from("fake"),
                    server_clustered: false,
                },
            })
        })
    }

    fn image_alias<'a>(&'a self, scope: &'a Scope, alias: &'a str) -> DaemonFuture<'a, ImageAlias> {
        Box::pin(async move {
            let state = self.record(DaemonCall::ImageAlias(alias.to_owned()), Some(scope));
            state
                .aliases
                .get(alias)
                .map(|target| ImageAlias {
                    name: alias.to_owned(),
                    target: target.clone(),
                    description: String::new(),
                })
                .ok_or_else(|| not_found("image alias"))
        })
    }

    fn image<'a>(&'a self, scope: &'a Scope, fingerprint: &'a str) -> DaemonFuture<'a, Image> {
        Box::pin(async move {
            let state = self.record(DaemonCall::Image(fingerprint.to_owned()), Some(scope));
            if !state.images.contains(fingerprint) {
                return Err(not_found("image"));
            }
            Ok(Image {
                fingerprint: fingerprint.to_owned(),
                architecture: String::from("x86_64"),
                public: false,
                properties: BTreeMap::new(),
            })
        })
    }

    fn create_instance<'a>(
        &'a self,
        scope: &'a Scope,
        request: &'a InstancesPost,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.record(DaemonCall::CreateInstance(request.name.clone()), Some(scope));
            if state.instances.contains_key(&request.name) {
                return Err(DaemonError::Api {
                    status: 409,
                    message: String::from("Instance already exists"),
                });
            }
            state.created.push(request.clone());
            let kind = match request.kind {
                InstanceType::VirtualMachine => InstanceType::VirtualMachine,
                InstanceType::Container | InstanceType::Any => InstanceType::Container,
            };
            let mut config = request.config.clone();
            let base_image = request
                .source
                .fingerprint
                .clone()
                .or_else(|| request.source.alias.clone())
                .unwrap_or_default();
            config.insert(INTERNAL_CONFIG_KEY.to_owned(), base_image);
            let record = Instance {
                name: request.name.clone(),
                kind: kind.as_str().to_owned(),
                status: String::from("Stopped"),
                architecture: String::from("x86_64"),
                description: String::new(),
                stateful: false,
                ephemeral: request.ephemeral,
                profiles: request.profiles.clone(),
                config,
                devices: request.devices.clone(),
                location: scope.target.clone().unwrap_or_else(|| String::from("none")),
            };
            let files = SEEDED_DIRECTORIES
                .iter()
                .map(|dir| {
                    (
                        (*dir).to_owned(),
                        InstanceFile {
                            mode: 0o755,
                            kind: FileKind::Directory,
                            ..InstanceFile::default()
                        },
                    )
                })
                .collect();
            state.instances.insert(
                request.name.clone(),
                FakeInstance {
                    record,
                    version: 1,
                    network: None,
                    files,
                },
            );
            Ok(completed())
        })
    }

    fn instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, (Instance, String)> {
        Box::pin(async move {
            let state = self.record(DaemonCall::GetInstance(name.to_owned()), Some(scope));
            state
                .instances
                .get(name)
                .map(|instance| (instance.record.clone(), instance.etag()))
                .ok_or_else(|| not_found("instance"))
        })
    }

    fn instance_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, InstanceState> {
        Box::pin(async move {
            let state = self.record(DaemonCall::GetState(name.to_owned()), Some(scope));
            let instance = state.instances.get(name).ok_or_else(|| not_found("instance"))?;
            let network = if state.failures.contains(&Failure::Network) {
                None
            } else {
                instance.network.clone()
            };
            Ok(InstanceState {
                status: instance.record.status.clone(),
                network,
            })
        })
    }

    fn update_instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        record: &'a InstancePut,
        etag: &'a str,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.record(DaemonCall::UpdateInstance(name.to_owned()), Some(scope));
            let mismatch_injected = state.failures.contains(&Failure::VersionMismatch);
            let instance = state
                .instances
                .get_mut(name)
                .ok_or_else(|| not_found("instance"))?;
            if mismatch_injected || (!etag.is_empty() && etag != instance.etag()) {
                return Err(DaemonError::VersionMismatch(String::from(
                    "ETag doesn't match",
                )));
            }
            let current = &mut instance.record;
            current.architecture.clone_from(&record.architecture);
            current.description.clone_from(&record.description);
            current.stateful = record.stateful;
            current.profiles.clone_from(&record.profiles);
            current.config.clone_from(&record.config);
            current.devices.clone_from(&record.devices);
            instance.version += 1;
            Ok(completed())
        })
    }

    fn change_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        request: &'a StatePut,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.record(
                DaemonCall::ChangeState(name.to_owned(), request.action),
                Some(scope),
            );
            let start_fails = state.failures.contains(&Failure::Start);
            state.next_host = state.next_host.wrapping_add(1).max(2);
            let host = state.next_host;
            let instance = state
                .instances
                .get_mut(name)
                .ok_or_else(|| not_found("instance"))?;
            match request.action {
                StateAction::Start | StateAction::Restart => {
                    if start_fails {
                        return Ok(failed("Failed to run: forkstart: apparmor denied"));
                    }
                    instance.record.status = String::from("Running");
                    instance.network = Some(boot_network(&instance.record, host));
                }
                StateAction::Stop => {
                    if instance.record.ephemeral {
                        state.instances.remove(name);
                    } else {
                        instance.record.status = String::from("Stopped");
                        instance.network = None;
                    }
                }
            }
            Ok(completed())
        })
    }

    fn delete_instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.record(DaemonCall::DeleteInstance(name.to_owned()), Some(scope));
            let instance = state.instances.get(name).ok_or_else(|| not_found("instance"))?;
            if instance.record.status == "Running" {
                return Err(DaemonError::Api {
                    status: 400,
                    message: String::from("Instance is running"),
                });
            }
            state.instances.remove(name);
            Ok(completed())
        })
    }

    fn wait_operation<'a>(
        &'a self,
        operation: &'a Operation,
        _timeout: Duration,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            drop(self.record(DaemonCall::WaitOperation(operation.id.clone()), None));
            if operation.failed() {
                return Err(DaemonError::OperationFailed {
                    id: operation.id.clone(),
                    message: operation.err.clone(),
                });
            }
            Ok(operation.clone())
        })
    }

    fn push_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
        file: &'a FilePush,
    ) -> DaemonFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.record(DaemonCall::PushFile(path.to_owned()), Some(scope));
            let target = state
                .instances
                .get_mut(instance)
                .ok_or_else(|| not_found("instance"))?;
            if target.record.kind == InstanceType::VirtualMachine.as_str()
                && target.record.status != "Running"
            {
                return Err(DaemonError::Api {
                    status: 400,
                    message: String::from("VM agent isn't currently running"),
                });
            }
            let parent = parent_of(path);
            if !matches!(target.files.get(parent), Some(entry) if entry.kind == FileKind::Directory) {
                return Err(DaemonError::Api {
                    status: 500,
                    message: format!("parent directory {parent} does not exist"),
                });
            }
            let mut content = file.content.clone();
            if file.write == WriteMode::Append
                && let Some(existing) = target.files.get(path)
            {
                let mut joined = existing.content.clone();
                joined.append(&mut content);
                content = joined;
            }
            target.files.insert(
                path.to_owned(),
                InstanceFile {
                    content,
                    uid: file.uid,
                    gid: file.gid,
                    mode: file.mode,
                    kind: file.kind,
                },
            );
            Ok(())
        })
    }

    fn delete_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.record(DaemonCall::DeleteFile(path.to_owned()), Some(scope));
            let target = state
                .instances
                .get_mut(instance)
                .ok_or_else(|| not_found("instance"))?;
            target
                .files
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| not_found("file"))
        })
    }

    fn file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, InstanceFile> {
        Box::pin(async move {
            let state = self.record(DaemonCall::GetFile(path.to_owned()), Some(scope));
            state
                .instances
                .get(instance)
                .ok_or_else(|| not_found("instance"))?
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| not_found("file"))
        })
    }
}

/// Connector handing out [`FakeDaemon`]s by remote name.
#[derive(Default)]
pub struct FakeConnector {
    daemons: HashMap<String, Arc<FakeDaemon>>,
    connects: StdMutex<Vec<String>>,
}

impl FakeConnector {
    /// Creates a connector with no daemons.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `daemon` for remote `name`.
    #[must_use]
    pub fn with_daemon(mut self, name: &str, daemon: Arc<FakeDaemon>) -> Self {
        self.daemons.insert(name.to_owned(), daemon);
        self
    }

    /// Remote names connected so far, in order.
    #[must_use]
    pub fn connects(&self) -> Vec<String> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        remote: &ResolvedRemote,
        _trust: Option<&TrustMaterial>,
    ) -> Result<Arc<dyn InstanceServer>, ResolveError> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(remote.name.clone());
        let daemon = self
            .daemons
            .get(&remote.name)
            .ok_or_else(|| ResolveError::Connect {
                remote: remote.name.clone(),
                source: DaemonError::Transport {
                    endpoint: remote.endpoint(),
                    message: String::from("no fake daemon registered"),
                },
            })?;
        Ok(Arc::clone(daemon) as Arc<dyn InstanceServer>)
    }
}

/// Waiter polling without delays, for tests.
#[must_use]
pub fn immediate_waiter(timeout: Duration) -> Waiter {
    Waiter::new(
        WaitPolicy {
            timeout,
            initial_delay: Duration::ZERO,
            min_interval: Duration::ZERO,
        },
        CancellationToken::new(),
    )
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    /// A `None` value removes the variable for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(text) => env::set_var(key, text),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
