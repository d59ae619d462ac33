//! Instance reconciliation engine.
//!
//! Drives create, read, update, delete, exists and import for one declared
//! instance against the daemon selected by the remote resolver. Each verb
//! lives in its own submodule as an `impl InstanceEngine` block.

mod address;
mod create;
mod delete;
mod error;
mod import;
mod model;
mod read;
mod update;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::daemon::{InstanceState, Operation, StateAction, StatePut};
use crate::remote::{RemoteResolver, SessionHandle};
use crate::wait::Waiter;

pub use address::{ACCESS_INTERFACE_KEY, SelectedAddresses, has_ipv4, select_addresses};
pub use error::InstanceError;
pub use model::{
    DEFAULT_PROFILE, Device, DeviceType, InstanceKind, InstanceResource, PRIVILEGED_KEY,
    ResourceData,
};

/// Per-operation timeout for start, stop and other lifecycle operations.
pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Status reported by a running instance.
pub const STATUS_RUNNING: &str = "Running";
/// Status reported by a stopped instance.
pub const STATUS_STOPPED: &str = "Stopped";
const NETWORK_READY: &str = "Ready";
const NETWORK_PENDING: &str = "Pending";

/// Reconciles declared instances with a daemon.
#[derive(Clone)]
pub struct InstanceEngine {
    resolver: Arc<RemoteResolver>,
    waiter: Waiter,
    lifecycle_timeout: Duration,
}

impl InstanceEngine {
    /// Creates an engine resolving sessions through `resolver` and waiting
    /// with `waiter`.
    #[must_use]
    pub const fn new(resolver: Arc<RemoteResolver>, waiter: Waiter) -> Self {
        Self {
            resolver,
            waiter,
            lifecycle_timeout: LIFECYCLE_TIMEOUT,
        }
    }

    /// Resolver the engine opens sessions through.
    #[must_use]
    pub const fn resolver(&self) -> &Arc<RemoteResolver> {
        &self.resolver
    }

    /// Returns `true` when the instance recorded in `data` exists.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] for any failure other than absence.
    pub async fn exists(&self, data: &ResourceData) -> Result<bool, InstanceError> {
        if !data.has_id() {
            return Ok(false);
        }
        let session = self.session(&data.state).await?;
        match session
            .server()
            .instance_state(session.scope(), &data.id)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(source) => Err(InstanceError::lifecycle("check", &data.id, source)),
        }
    }

    /// Resolves and binds the session addressed by a declaration.
    async fn session(&self, state: &InstanceResource) -> Result<SessionHandle, InstanceError> {
        let base = self.resolver.session_for(Some(&state.remote)).await?;
        Ok(base.bind_project(&state.project).bind_target(&state.target))
    }

    async fn change_state(
        &self,
        session: &SessionHandle,
        name: &str,
        action: StateAction,
    ) -> Result<Operation, InstanceError> {
        let stage = action.to_string();
        debug!(instance = name, %action, "changing state");
        let request = StatePut {
            action,
            timeout: self.lifecycle_timeout.as_secs(),
            force: false,
            stateful: false,
        };
        let operation = session
            .server()
            .change_state(session.scope(), name, &request)
            .await
            .map_err(|source| InstanceError::lifecycle(&stage, name, source))?;
        session
            .server()
            .wait_operation(&operation, self.lifecycle_timeout)
            .await
            .map_err(|source| InstanceError::lifecycle(&stage, name, source))
    }

    async fn wait_for_status(
        &self,
        session: &SessionHandle,
        name: &str,
        stage: &str,
        status: &str,
    ) -> Result<InstanceState, InstanceError> {
        self.waiter
            .wait_for(stage, &[status], || async {
                let state = session
                    .server()
                    .instance_state(session.scope(), name)
                    .await?;
                let label = state.status.clone();
                Ok((state, label))
            })
            .await
            .map_err(|source| InstanceError::wait(stage, name, source))
    }

    async fn wait_for_network(
        &self,
        session: &SessionHandle,
        name: &str,
    ) -> Result<InstanceState, InstanceError> {
        self.waiter
            .wait_for("network", &[NETWORK_READY], || async {
                let state = session
                    .server()
                    .instance_state(session.scope(), name)
                    .await?;
                let label = if has_ipv4(&state.interfaces()) {
                    NETWORK_READY
                } else {
                    NETWORK_PENDING
                };
                Ok((state, label.to_owned()))
            })
            .await
            .map_err(|source| InstanceError::wait("wait for network on", name, source))
    }
}
