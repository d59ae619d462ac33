//! Remote resolution: maps a resource's `remote`, `project` and `target`
//! attributes onto a bound [`SessionHandle`].
//!
//! Each remote is probed once per provider with a single server-info
//! request; the connection is then shared by every session bound to it.
//! Probes serialise per remote, so a slow remote never blocks another.

mod error;
mod provider;
mod trust;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::config::{ConfigError, ResolvedConfig, ResolvedRemote, Scheme};
use crate::daemon::{
    DaemonError, HttpsTransport, InstanceServer, LxdClient, Scope, UnixTransport,
};

pub use error::ResolveError;
pub use provider::Provider;
pub use trust::TrustMaterial;

/// Builds daemon clients for resolved remotes.
pub trait Connector: Send + Sync {
    /// Returns a client for `remote`, using `trust` for `https` remotes.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Connect`] when the client cannot be built.
    fn connect(
        &self,
        remote: &ResolvedRemote,
        trust: Option<&TrustMaterial>,
    ) -> Result<Arc<dyn InstanceServer>, ResolveError>;
}

/// Connector producing REST clients over unix sockets or HTTPS.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(
        &self,
        remote: &ResolvedRemote,
        trust: Option<&TrustMaterial>,
    ) -> Result<Arc<dyn InstanceServer>, ResolveError> {
        let client = match remote.scheme {
            Scheme::Unix => LxdClient::new(Box::new(UnixTransport::new(Utf8Path::new(
                &remote.address,
            )))),
            Scheme::Https => {
                let material = trust.ok_or_else(|| ResolveError::Connect {
                    remote: remote.name.clone(),
                    source: DaemonError::Transport {
                        endpoint: remote.endpoint(),
                        message: String::from("https remotes need client trust material"),
                    },
                })?;
                let transport = HttpsTransport::new(
                    &remote.endpoint(),
                    &material.identity_pem(),
                    material.server_cert.as_deref(),
                )
                .map_err(|source| ResolveError::Connect {
                    remote: remote.name.clone(),
                    source,
                })?;
                LxdClient::new(Box::new(transport))
            }
        };
        Ok(Arc::new(client))
    }
}

/// One daemon connection bound to a project and cluster member.
///
/// Two handles are equal when their endpoint, default remote, selected
/// remote, project and target are equal; the connection itself is not
/// compared.
#[derive(Clone)]
pub struct SessionHandle {
    server: Arc<dyn InstanceServer>,
    endpoint: String,
    default_remote: String,
    remote: String,
    scope: Scope,
}

impl SessionHandle {
    /// Creates an unbound handle.
    #[must_use]
    pub fn new(
        server: Arc<dyn InstanceServer>,
        endpoint: impl Into<String>,
        default_remote: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            server,
            endpoint: endpoint.into(),
            default_remote: default_remote.into(),
            remote: remote.into(),
            scope: Scope::default(),
        }
    }

    /// Returns a copy bound to `project`; an empty name clears the binding.
    #[must_use]
    pub fn bind_project(&self, project: &str) -> Self {
        let mut bound = self.clone();
        bound.scope.project = non_empty(project);
        bound
    }

    /// Returns a copy bound to cluster member `node`; an empty name clears
    /// the binding.
    #[must_use]
    pub fn bind_target(&self, node: &str) -> Self {
        let mut bound = self.clone();
        bound.scope.target = non_empty(node);
        bound
    }

    /// Daemon connection.
    #[must_use]
    pub fn server(&self) -> &dyn InstanceServer {
        self.server.as_ref()
    }

    /// Project and target passed with every call.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Daemon endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Provider default remote at the time of resolution.
    #[must_use]
    pub fn default_remote(&self) -> &str {
        &self.default_remote
    }

    /// Selected remote name.
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Bound project, if any.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.scope.project.as_deref()
    }

    /// Bound cluster member, if any.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.scope.target.as_deref()
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.default_remote == other.default_remote
            && self.remote == other.remote
            && self.scope == other.scope
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("endpoint", &self.endpoint)
            .field("default_remote", &self.default_remote)
            .field("remote", &self.remote)
            .field("project", &self.scope.project)
            .field("target", &self.scope.target)
            .finish_non_exhaustive()
    }
}

/// Where images for a create request come from.
#[derive(Debug, Eq, PartialEq)]
pub enum ImageServer {
    /// Read-only public image index; the daemon pulls from `url`.
    Catalog {
        /// Catalog name.
        remote: String,
        /// Catalog URL.
        url: String,
        /// Catalog protocol.
        protocol: String,
    },
    /// A full daemon serving its own image store.
    Daemon(SessionHandle),
}

/// Resolves remotes into sessions, probing each remote once.
pub struct RemoteResolver {
    config: ResolvedConfig,
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn InstanceServer>>>>>,
}

impl RemoteResolver {
    /// Creates a resolver; no remote is contacted until first use.
    #[must_use]
    pub fn new(config: ResolvedConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolved configuration backing the resolver.
    #[must_use]
    pub const fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Name of the provider default remote.
    #[must_use]
    pub fn default_remote(&self) -> &str {
        &self.config.default_remote
    }

    /// Returns an unbound handle for `remote`, or the default remote when
    /// `remote` is `None` or empty.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Config`] for unknown remotes,
    /// [`ResolveError::Trust`] when `https` trust material is missing,
    /// [`ResolveError::CatalogRemote`] for image catalogs and
    /// [`ResolveError::Unreachable`] when the capability probe fails.
    pub async fn session_for(&self, remote: Option<&str>) -> Result<SessionHandle, ResolveError> {
        let name = remote
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.config.default_remote);
        let resolved = self.lookup(name)?;
        if resolved.is_catalog() {
            return Err(ResolveError::CatalogRemote {
                remote: name.to_owned(),
            });
        }
        let server = self.connection(resolved).await?;
        Ok(SessionHandle::new(
            server,
            resolved.endpoint(),
            self.config.default_remote.clone(),
            name,
        ))
    }

    /// Returns the image source for `remote`.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Self::session_for`] for daemon remotes.
    pub async fn image_server(&self, remote: &str) -> Result<ImageServer, ResolveError> {
        let resolved = self.lookup(remote)?;
        if resolved.is_catalog() {
            return Ok(ImageServer::Catalog {
                remote: resolved.name.clone(),
                url: resolved.endpoint(),
                protocol: resolved.protocol.as_str().to_owned(),
            });
        }
        self.session_for(Some(remote)).await.map(ImageServer::Daemon)
    }

    /// Splits `<remote>:<name>` using the provider default for bare names.
    #[must_use]
    pub fn parse_remote(&self, qualified: &str) -> (String, String) {
        parse_remote(qualified, &self.config.default_remote)
    }

    fn lookup(&self, name: &str) -> Result<&ResolvedRemote, ResolveError> {
        self.config
            .remote(name)
            .ok_or_else(|| ResolveError::Config(ConfigError::UnknownRemote(name.to_owned())))
    }

    async fn connection(
        &self,
        remote: &ResolvedRemote,
    ) -> Result<Arc<dyn InstanceServer>, ResolveError> {
        let cell = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(remote.name.clone()).or_default())
        };
        cell.get_or_try_init(|| self.connect_and_check(remote))
            .await
            .map(Arc::clone)
    }

    async fn connect_and_check(
        &self,
        remote: &ResolvedRemote,
    ) -> Result<Arc<dyn InstanceServer>, ResolveError> {
        let trust = match remote.scheme {
            Scheme::Https => Some(TrustMaterial::load(&self.config.config_dir, &remote.name)?),
            Scheme::Unix => None,
        };
        let server = self.connector.connect(remote, trust.as_ref())?;
        let info = server
            .server_info()
            .await
            .map_err(|source| ResolveError::Unreachable {
                remote: remote.name.clone(),
                endpoint: remote.endpoint(),
                source,
            })?;
        info!(
            remote = %remote.name,
            endpoint = %remote.endpoint(),
            api_version = %info.api_version,
            "connected to remote"
        );
        Ok(server)
    }
}

/// Splits `<remote>:<name>` into its parts; bare names select `default`.
#[must_use]
pub fn parse_remote(qualified: &str, default: &str) -> (String, String) {
    match qualified.split_once(':') {
        Some((remote, name)) if !remote.is_empty() => (remote.to_owned(), name.to_owned()),
        Some((_, name)) => (default.to_owned(), name.to_owned()),
        None => (default.to_owned(), qualified.to_owned()),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}
