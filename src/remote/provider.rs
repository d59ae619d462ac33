//! Process-wide provider state.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::{Connector, HttpConnector, RemoteResolver, ResolveError};
use crate::config::{LxdEnvConfig, ProviderConfig, ResolvedConfig};
use crate::instance::InstanceEngine;
use crate::wait::{WaitPolicy, Waiter};

/// Shared state created once per provider instantiation: the resolver with
/// its cached connections, the creation mutex and the host's cancellation
/// token.
pub struct Provider {
    resolver: Arc<RemoteResolver>,
    creation: Mutex<()>,
    cancel: CancellationToken,
}

impl Provider {
    /// Creates provider state over an explicit connector.
    #[must_use]
    pub fn new(config: ResolvedConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            resolver: Arc::new(RemoteResolver::new(config, connector)),
            creation: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Resolves `config` against the environment layer and connects through
    /// the REST client.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Config`] when the configuration is invalid.
    pub fn from_config(config: &ProviderConfig, env: &LxdEnvConfig) -> Result<Self, ResolveError> {
        let resolved = config.resolve(env)?;
        Ok(Self::new(resolved, Arc::new(HttpConnector)))
    }

    /// Shared remote resolver.
    #[must_use]
    pub const fn resolver(&self) -> &Arc<RemoteResolver> {
        &self.resolver
    }

    /// Token observed by every waiter created from this provider.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every in-flight wait at its next poll boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Enters the critical section guarding non-concurrent-safe creation
    /// endpoints (load balancers, network zones and records). Instance
    /// operations never take it.
    pub async fn serialize_creation(&self) -> MutexGuard<'_, ()> {
        self.creation.lock().await
    }

    /// Waiter configured with the convergence policy and this provider's
    /// cancellation token.
    #[must_use]
    pub fn waiter(&self) -> Waiter {
        let refresh = self.resolver.config().refresh_interval;
        Waiter::new(WaitPolicy::convergence(refresh), self.cancellation())
    }

    /// Instance engine bound to this provider.
    #[must_use]
    pub fn instance_engine(&self) -> InstanceEngine {
        InstanceEngine::new(Arc::clone(&self.resolver), self.waiter())
    }
}
