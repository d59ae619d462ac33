//! Request and response records exchanged with the daemon REST API.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form string map used for configuration and device properties.
pub type StringMap = BTreeMap<String, String>;

/// Project and cluster member addressed by a daemon call.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Scope {
    /// Project the call applies to; `None` selects the daemon default.
    pub project: Option<String>,
    /// Cluster member for placement; `None` lets the daemon decide.
    pub target: Option<String>,
}

impl Scope {
    /// Renders the scope as query pairs in a stable order.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(project) = self.project.as_deref() {
            pairs.push(("project", project));
        }
        if let Some(target) = self.target.as_deref() {
            pairs.push(("target", target));
        }
        pairs
    }
}

/// Capabilities and identity reported by `GET /1.0`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerInfo {
    /// API extensions supported by the daemon.
    #[serde(default)]
    pub api_extensions: Vec<String>,
    /// REST API version string.
    #[serde(default)]
    pub api_version: String,
    /// Authentication status of the client (`trusted` or `untrusted`).
    #[serde(default)]
    pub auth: String,
    /// Environment block describing the daemon host.
    #[serde(default)]
    pub environment: ServerEnvironment,
}

impl ServerInfo {
    /// Returns `true` when the daemon advertises the named API extension.
    #[must_use]
    pub fn has_extension(&self, name: &str) -> bool {
        self.api_extensions.iter().any(|ext| ext == name)
    }
}

/// Host details nested inside [`ServerInfo`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerEnvironment {
    /// Name of the responding cluster member.
    #[serde(default)]
    pub server_name: String,
    /// Whether the daemon is part of a cluster.
    #[serde(default)]
    pub server_clustered: bool,
}

/// Alias entry returned by `GET /1.0/images/aliases/<name>`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImageAlias {
    /// Alias name.
    pub name: String,
    /// Fingerprint the alias points at.
    pub target: String,
    /// Optional free-form description.
    #[serde(default)]
    pub description: String,
}

/// Image record returned by `GET /1.0/images/<fingerprint>`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Image {
    /// Full image fingerprint.
    pub fingerprint: String,
    /// Architecture the image was built for.
    #[serde(default)]
    pub architecture: String,
    /// Whether the image is publicly visible.
    #[serde(default)]
    pub public: bool,
    /// Descriptive properties such as `os` and `release`.
    #[serde(default)]
    pub properties: StringMap,
}

/// Source section of an instance creation request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceSource {
    /// Source type; always `image` for this provider.
    #[serde(rename = "type")]
    pub kind: String,
    /// Transfer mode (`pull` for remote catalogs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Catalog URL for remote images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Catalog protocol for remote images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Image alias to pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Image fingerprint on the local daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Instance kind on the wire; an empty string lets the daemon decide.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InstanceType {
    /// System container.
    Container,
    /// Virtual machine.
    VirtualMachine,
    /// Daemon default.
    #[default]
    Any,
}

impl InstanceType {
    /// Returns the wire spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
            Self::Any => "",
        }
    }
}

impl Serialize for InstanceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Body of `POST /1.0/instances`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct InstancesPost {
    /// Instance name.
    pub name: String,
    /// Requested kind.
    #[serde(rename = "type")]
    pub kind: InstanceType,
    /// Image source.
    pub source: InstanceSource,
    /// Ordered profile list.
    pub profiles: Vec<String>,
    /// Instance configuration including `limits.*`.
    pub config: StringMap,
    /// Devices keyed by name; each map carries its `type`.
    pub devices: BTreeMap<String, StringMap>,
    /// Whether the daemon destroys the instance on stop.
    pub ephemeral: bool,
}

/// Instance record returned by `GET /1.0/instances/<name>`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Instance name.
    pub name: String,
    /// Kind as reported by the daemon; older daemons leave it empty.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Runtime status label.
    #[serde(default)]
    pub status: String,
    /// Architecture name.
    #[serde(default)]
    pub architecture: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether stateful snapshots are enabled.
    #[serde(default)]
    pub stateful: bool,
    /// Whether the instance is destroyed on stop.
    #[serde(default)]
    pub ephemeral: bool,
    /// Ordered profile list.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Local configuration (not expanded with profiles).
    #[serde(default)]
    pub config: StringMap,
    /// Local devices keyed by name.
    #[serde(default)]
    pub devices: BTreeMap<String, StringMap>,
    /// Cluster member hosting the instance.
    #[serde(default)]
    pub location: String,
}

impl Instance {
    /// Builds the writable subset used for `PUT /1.0/instances/<name>`.
    #[must_use]
    pub fn to_put(&self) -> InstancePut {
        InstancePut {
            architecture: self.architecture.clone(),
            description: self.description.clone(),
            stateful: self.stateful,
            ephemeral: self.ephemeral,
            profiles: self.profiles.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
        }
    }
}

/// Body of `PUT /1.0/instances/<name>`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstancePut {
    /// Architecture name, preserved from the current record.
    pub architecture: String,
    /// Description, preserved from the current record.
    pub description: String,
    /// Stateful flag, preserved from the current record.
    pub stateful: bool,
    /// Ephemeral flag.
    pub ephemeral: bool,
    /// Ordered profile list.
    pub profiles: Vec<String>,
    /// Local configuration.
    pub config: StringMap,
    /// Local devices.
    pub devices: BTreeMap<String, StringMap>,
}

/// Runtime state returned by `GET /1.0/instances/<name>/state`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceState {
    /// Runtime status label (`Running`, `Stopped`, ...).
    #[serde(default)]
    pub status: String,
    /// Interfaces keyed by name; absent while the instance is stopped.
    #[serde(default)]
    pub network: Option<BTreeMap<String, NetworkState>>,
}

impl InstanceState {
    /// Returns the interface table, empty when the daemon reported none.
    #[must_use]
    pub fn interfaces(&self) -> BTreeMap<String, NetworkState> {
        self.network.clone().unwrap_or_default()
    }
}

/// One network interface inside [`InstanceState`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkState {
    /// Addresses in daemon-reported order.
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    /// Hardware address.
    #[serde(default)]
    pub hwaddr: String,
}

/// One address of an interface.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkAddress {
    /// `inet` or `inet6`.
    pub family: String,
    /// Address text.
    pub address: String,
    /// Prefix length.
    #[serde(default)]
    pub netmask: String,
    /// `local`, `link` or `global`.
    #[serde(default)]
    pub scope: String,
}

/// Action requested through `PUT /1.0/instances/<name>/state`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    /// Boot the instance.
    Start,
    /// Shut the instance down.
    Stop,
    /// Reboot the instance.
    Restart,
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

/// Body of `PUT /1.0/instances/<name>/state`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatePut {
    /// Requested action.
    pub action: StateAction,
    /// Seconds the daemon waits for the action to complete.
    pub timeout: u64,
    /// Whether to force the action.
    pub force: bool,
    /// Whether to preserve runtime state.
    pub stateful: bool,
}

/// Background operation returned by mutating calls.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Operation {
    /// Operation identifier.
    pub id: String,
    /// Operation class (`task`, `websocket`, `token`).
    #[serde(default)]
    pub class: String,
    /// Status label (`Running`, `Success`, `Failure`, ...).
    #[serde(default)]
    pub status: String,
    /// Numeric status code.
    #[serde(default)]
    pub status_code: u16,
    /// Error text when the operation failed.
    #[serde(default)]
    pub err: String,
}

impl Operation {
    /// Returns `true` once the daemon reports a failure status.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.status == "Failure" || self.status_code == 400 || !self.err.is_empty()
    }
}

/// Filesystem entry kind for file transfers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FileKind {
    /// Regular file.
    #[default]
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileKind {
    /// Returns the header spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        }
    }

    /// Parses the header spelling of the kind, defaulting to `file`.
    #[must_use]
    pub fn from_header(value: &str) -> Self {
        match value {
            "directory" => Self::Directory,
            "symlink" => Self::Symlink,
            _ => Self::File,
        }
    }
}

/// Write semantics for a file push.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WriteMode {
    /// Replace the file contents.
    #[default]
    Overwrite,
    /// Append to existing contents.
    Append,
}

impl WriteMode {
    /// Returns the header spelling of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        }
    }
}

/// Parameters of a file push into an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilePush {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
    /// Entry kind.
    pub kind: FileKind,
    /// Write semantics.
    pub write: WriteMode,
    /// File body; empty for directories.
    pub content: Vec<u8>,
}

/// File fetched from an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceFile {
    /// File body; for directories, newline-separated entries.
    pub content: Vec<u8>,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
    /// Entry kind.
    pub kind: FileKind,
}
