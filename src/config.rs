//! Provider configuration: declared remotes, the `LXD_*` environment layer
//! loaded via `ortho-config`, and resolution into a validated remote table.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;

/// Remote name used when nothing else selects one.
pub const DEFAULT_REMOTE_NAME: &str = "local";
/// Socket path used by `unix` remotes without an explicit address.
pub const DEFAULT_UNIX_SOCKET: &str = "/var/lib/lxd/unix.socket";
/// TCP port used by `https` remotes without an explicit port.
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
/// Default poll refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;

const CATALOG_REMOTES: [(&str, &str); 2] = [
    ("images", "https://images.linuxcontainers.org"),
    ("ubuntu", "https://cloud-images.ubuntu.com/releases"),
];

/// Transport scheme used to reach a remote.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Local unix domain socket.
    Unix,
    /// TLS over TCP with client certificate authentication.
    Https,
}

impl FromStr for Scheme {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "unix" => Ok(Self::Unix),
            "https" => Ok(Self::Https),
            other => Err(ConfigError::UnknownScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix => f.write_str("unix"),
            Self::Https => f.write_str("https"),
        }
    }
}

/// Protocol spoken by a remote.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// A full daemon able to host instances and serve images.
    #[default]
    Lxd,
    /// A read-only public image index.
    Simplestreams,
}

impl Protocol {
    /// Returns the wire name of the protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lxd => "lxd",
            Self::Simplestreams => "simplestreams",
        }
    }
}

/// A remote as declared by the user; unset attributes are filled during
/// resolution.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct RemoteConfig {
    /// Name used to select the remote (`<remote>:<name>`).
    pub name: String,
    /// Socket path for `unix`, host name or address for `https`.
    #[serde(default)]
    pub address: Option<String>,
    /// Transport scheme; the raw string is validated on resolution.
    #[serde(default)]
    pub scheme: Option<String>,
    /// TCP port for `https`.
    #[serde(default)]
    pub port: Option<u16>,
    /// Protocol spoken by the remote.
    #[serde(default)]
    pub protocol: Protocol,
    /// Marks this remote as the provider default.
    #[serde(default)]
    pub default: bool,
}

/// Provider-level configuration supplied by the host orchestrator or read
/// from a TOML file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ProviderConfig {
    /// Name of the remote used when a resource leaves `remote` empty.
    #[serde(default)]
    pub default_remote: Option<String>,
    /// Declared remotes.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    /// Directory holding client and server certificates.
    #[serde(default)]
    pub config_dir: Option<Utf8PathBuf>,
    /// Initial delay applied by convergence waits, in seconds.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

/// Environment overrides for the default remote, loaded via `ortho-config`
/// from `LXD_*` variables. Values only apply where the provider
/// configuration leaves the attribute unset.
#[derive(Clone, Debug, Default, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "LXD")]
pub struct LxdEnvConfig {
    /// Address of the default remote (`LXD_ADDR`).
    pub addr: Option<String>,
    /// Scheme of the default remote (`LXD_SCHEME`).
    pub scheme: Option<String>,
    /// Port of the default remote (`LXD_PORT`).
    pub port: Option<u16>,
    /// Name of the default remote (`LXD_REMOTE`).
    pub remote: Option<String>,
    /// Directory holding trust material (`LXD_CONFIG_DIR`).
    pub config_dir: Option<String>,
}

impl LxdEnvConfig {
    /// Loads the environment layer without attempting to parse CLI
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("lxd-provider")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// A remote after defaults and validation have been applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedRemote {
    /// Remote name.
    pub name: String,
    /// Transport scheme.
    pub scheme: Scheme,
    /// Socket path or host.
    pub address: String,
    /// TCP port; ignored for `unix`.
    pub port: u16,
    /// Protocol spoken by the remote.
    pub protocol: Protocol,
}

impl ResolvedRemote {
    /// Renders the endpoint used for equality and diagnostics.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match (self.scheme, self.protocol) {
            (Scheme::Unix, _) => format!("unix://{}", self.address),
            (Scheme::Https, Protocol::Simplestreams) if self.address.starts_with("https://") => {
                self.address.clone()
            }
            (Scheme::Https, _) => format!("https://{}:{}", self.address, self.port),
        }
    }

    /// Returns `true` for read-only image catalogs.
    #[must_use]
    pub const fn is_catalog(&self) -> bool {
        matches!(self.protocol, Protocol::Simplestreams)
    }
}

/// Configuration ready to drive the remote resolver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedConfig {
    /// Name of the default remote.
    pub default_remote: String,
    /// Every usable remote keyed by name.
    pub remotes: BTreeMap<String, ResolvedRemote>,
    /// Directory holding trust material.
    pub config_dir: Utf8PathBuf,
    /// Initial delay for convergence waits.
    pub refresh_interval: Duration,
}

impl ResolvedConfig {
    /// Looks up a remote by name.
    #[must_use]
    pub fn remote(&self, name: &str) -> Option<&ResolvedRemote> {
        self.remotes.get(name)
    }
}

impl ProviderConfig {
    /// Reads a provider configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when its contents are not valid TOML.
    pub fn from_toml_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = read_utf8_file(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses a provider configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text is not a valid
    /// configuration document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the declared configuration against the environment layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a remote is malformed, duplicated, or uses
    /// an unknown scheme.
    pub fn resolve(&self, env: &LxdEnvConfig) -> Result<ResolvedConfig, ConfigError> {
        let default_remote = self.default_remote_name(env);
        let mut remotes = BTreeMap::new();

        for declared in &self.remotes {
            let name = declared.name.trim();
            if name.is_empty() {
                return Err(ConfigError::MissingField(String::from(
                    "missing remote name: every [[remotes]] entry needs a name",
                )));
            }
            let overrides = (name == default_remote).then_some(env);
            let resolved = resolve_remote(declared, overrides)?;
            if remotes.insert(name.to_owned(), resolved).is_some() {
                return Err(ConfigError::DuplicateRemote(name.to_owned()));
            }
        }

        if !remotes.contains_key(&default_remote) {
            let synthesised = RemoteConfig {
                name: default_remote.clone(),
                ..RemoteConfig::default()
            };
            remotes.insert(default_remote.clone(), resolve_remote(&synthesised, Some(env))?);
        }

        for (name, url) in CATALOG_REMOTES {
            remotes
                .entry(name.to_owned())
                .or_insert_with(|| ResolvedRemote {
                    name: name.to_owned(),
                    scheme: Scheme::Https,
                    address: url.to_owned(),
                    port: 443,
                    protocol: Protocol::Simplestreams,
                });
        }

        let config_dir = self
            .config_dir
            .clone()
            .or_else(|| env.config_dir.as_deref().map(Utf8PathBuf::from))
            .unwrap_or_else(default_config_dir);

        let refresh_secs = self
            .refresh_interval_secs
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);

        Ok(ResolvedConfig {
            default_remote,
            remotes,
            config_dir,
            refresh_interval: Duration::from_secs(refresh_secs),
        })
    }

    fn default_remote_name(&self, env: &LxdEnvConfig) -> String {
        self.default_remote
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                self.remotes
                    .iter()
                    .find(|remote| remote.default)
                    .map(|remote| remote.name.trim().to_owned())
            })
            .or_else(|| {
                env.remote
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| DEFAULT_REMOTE_NAME.to_owned())
    }
}

fn resolve_remote(
    declared: &RemoteConfig,
    env: Option<&LxdEnvConfig>,
) -> Result<ResolvedRemote, ConfigError> {
    let name = declared.name.trim().to_owned();
    let raw_scheme = declared
        .scheme
        .clone()
        .or_else(|| env.and_then(|layer| layer.scheme.clone()));
    let scheme = match raw_scheme {
        Some(value) => value.parse::<Scheme>()?,
        None if declared.protocol == Protocol::Simplestreams => Scheme::Https,
        None => Scheme::Unix,
    };

    let declared_address = declared
        .address
        .clone()
        .or_else(|| env.and_then(|layer| layer.addr.clone()))
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());
    let address = match (declared_address, scheme) {
        (Some(value), _) => value,
        (None, Scheme::Unix) => DEFAULT_UNIX_SOCKET.to_owned(),
        (None, Scheme::Https) => {
            return Err(ConfigError::MissingField(format!(
                "missing address for https remote '{name}': set LXD_ADDR or add address to the remote"
            )));
        }
    };

    let port = declared
        .port
        .or_else(|| env.and_then(|layer| layer.port))
        .unwrap_or(DEFAULT_HTTPS_PORT);

    Ok(ResolvedRemote {
        name,
        scheme,
        address,
        port,
        protocol: declared.protocol,
    })
}

fn default_config_dir() -> Utf8PathBuf {
    std::env::var_os("HOME").map_or_else(
        || Utf8PathBuf::from(".config/lxc"),
        |home| Utf8PathBuf::from(format!("{}/.config/lxc", home.to_string_lossy())),
    )
}

/// Reads a UTF-8 file through a capability-scoped directory handle.
pub(crate) fn read_utf8_file(path: &Utf8Path) -> Result<String, ConfigError> {
    let dir = open_parent(path)?;
    let file_name = file_name_of(path)?;
    dir.read_to_string(file_name).map_err(|err| ConfigError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Reads raw bytes through a capability-scoped directory handle, returning
/// `None` when the file does not exist.
pub(crate) fn read_optional_bytes(path: &Utf8Path) -> Result<Option<Vec<u8>>, ConfigError> {
    let dir = match open_parent(path) {
        Ok(dir) => dir,
        Err(ConfigError::Io { .. }) => return Ok(None),
        Err(other) => return Err(other),
    };
    let file_name = file_name_of(path)?;
    match dir.read(file_name) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn open_parent(path: &Utf8Path) -> Result<Dir, ConfigError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })
}

fn file_name_of(path: &Utf8Path) -> Result<&str, ConfigError> {
    path.file_name().ok_or_else(|| ConfigError::Io {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when a scheme other than `unix` or `https` is requested.
    #[error("unknown scheme '{0}': expected unix or https (LXD_SCHEME)")]
    UnknownScheme(String),
    /// Raised when two remotes share a name.
    #[error("remote '{0}' is declared more than once")]
    DuplicateRemote(String),
    /// Raised when a remote name is not part of the configuration.
    #[error("unknown remote '{0}'")]
    UnknownRemote(String),
    /// Surfaces errors from the `ortho-config` loader or TOML parser.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a configuration file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
