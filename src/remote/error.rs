//! Errors raised while resolving a remote into a session.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::DaemonError;

/// Errors raised by the remote resolver.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// The remote is unknown or its configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Required trust material for an `https` remote is missing.
    #[error("missing trust material for remote '{remote}': {path} ({message})")]
    Trust {
        /// Remote being resolved.
        remote: String,
        /// File that could not be read.
        path: Utf8PathBuf,
        /// Underlying reason.
        message: String,
    },
    /// The client could not be built for the remote.
    #[error("failed to connect to remote '{remote}': {source}")]
    Connect {
        /// Remote being resolved.
        remote: String,
        /// Underlying error.
        #[source]
        source: DaemonError,
    },
    /// The initial capability probe failed.
    #[error("remote '{remote}' at {endpoint} is unreachable: {source}")]
    Unreachable {
        /// Remote being resolved.
        remote: String,
        /// Endpoint that was probed.
        endpoint: String,
        /// Probe failure.
        #[source]
        source: DaemonError,
    },
    /// The remote only serves images and cannot host instances.
    #[error("remote '{remote}' is a read-only image catalog and cannot host instances")]
    CatalogRemote {
        /// Remote being resolved.
        remote: String,
    },
}
