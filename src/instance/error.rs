//! Errors raised by the instance engine.

use thiserror::Error;

use crate::daemon::DaemonError;
use crate::files::FileError;
use crate::remote::ResolveError;
use crate::wait::WaitError;

/// Errors raised by instance reconciliation.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The declaration is malformed; raised before any daemon call.
    #[error("invalid instance declaration: {0}")]
    Validation(String),
    /// The remote could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The image reference matched nothing on its image server.
    #[error("image '{image}' not found on remote '{remote}'")]
    ImageNotFound {
        /// Image alias or fingerprint.
        image: String,
        /// Image server queried.
        remote: String,
    },
    /// A daemon call for a lifecycle stage failed.
    #[error("failed to {stage} instance ({name}): {source}")]
    Lifecycle {
        /// Stage that failed, such as `create` or `start`.
        stage: String,
        /// Instance name.
        name: String,
        /// Daemon failure.
        #[source]
        source: DaemonError,
    },
    /// A convergence wait for a lifecycle stage failed.
    #[error("failed to {stage} instance ({name}): {source}")]
    Wait {
        /// Stage being waited on.
        stage: String,
        /// Instance name.
        name: String,
        /// Wait failure.
        #[source]
        source: Box<WaitError<DaemonError>>,
    },
    /// A file payload could not be transferred.
    #[error(transparent)]
    File(#[from] FileError),
    /// The instance does not exist.
    #[error("instance '{0}' not found")]
    NotFound(String),
}

impl InstanceError {
    pub(crate) fn lifecycle(stage: &str, name: &str, source: DaemonError) -> Self {
        Self::Lifecycle {
            stage: stage.to_owned(),
            name: name.to_owned(),
            source,
        }
    }

    pub(crate) fn wait(stage: &str, name: &str, source: WaitError<DaemonError>) -> Self {
        Self::Wait {
            stage: stage.to_owned(),
            name: name.to_owned(),
            source: Box::new(source),
        }
    }

    /// Returns `true` for benign absence.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Lifecycle { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns `true` when the daemon rejected a stale version token.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        match self {
            Self::Lifecycle { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}
