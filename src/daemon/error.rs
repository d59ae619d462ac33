//! Error type shared by every daemon capability.

use thiserror::Error;

/// Errors raised while talking to a daemon.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DaemonError {
    /// The addressed object does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),
    /// The version token no longer matches (HTTP 412).
    #[error("version token mismatch: {0}")]
    VersionMismatch(String),
    /// Any other error reply from the daemon.
    #[error("daemon returned status {status}: {message}")]
    Api {
        /// HTTP or envelope status code.
        status: u16,
        /// Daemon-provided message.
        message: String,
    },
    /// A background operation finished with a failure status.
    #[error("operation {id} failed: {message}")]
    OperationFailed {
        /// Operation identifier.
        id: String,
        /// Daemon-provided message.
        message: String,
    },
    /// The request never reached the daemon or the reply was cut short.
    #[error("transport error talking to {endpoint}: {message}")]
    Transport {
        /// Endpoint that was being contacted.
        endpoint: String,
        /// Underlying error message.
        message: String,
    },
    /// The reply could not be decoded.
    #[error("failed to decode daemon response: {0}")]
    Decode(String),
    /// The daemon lacks an API extension required by the call.
    #[error("daemon does not support {capability}; upgrade the daemon or drop the setting")]
    Unsupported {
        /// Missing API extension.
        capability: String,
    },
}

impl DaemonError {
    /// Classifies an HTTP or envelope status code with its message.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let text = message.into();
        match status {
            404 => Self::NotFound(text),
            412 => Self::VersionMismatch(text),
            _ => Self::Api {
                status,
                message: text,
            },
        }
    }

    /// Returns `true` for benign absence.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` when the error reports a concurrent modification.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch(_) | Self::Api { status: 409, .. }
        )
    }
}
