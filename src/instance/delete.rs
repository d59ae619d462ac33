//! Delete: stop a running instance, wait for it to stop, then delete it.

use tracing::{debug, info};

use super::{InstanceEngine, InstanceError, ResourceData, STATUS_RUNNING, STATUS_STOPPED};
use crate::daemon::StateAction;

impl InstanceEngine {
    /// Deletes the instance recorded in `data`. Ephemeral instances that
    /// vanish once stopped count as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when stopping, waiting or deleting fails for
    /// any reason other than the instance having disappeared.
    pub async fn delete(&self, data: &ResourceData) -> Result<(), InstanceError> {
        let name = if data.id.is_empty() {
            data.state.name.clone()
        } else {
            data.id.clone()
        };
        info!(instance = %name, "deleting instance");
        let session = self.session(&data.state).await?;

        let runtime = match session.server().instance_state(session.scope(), &name).await {
            Ok(runtime) => runtime,
            Err(err) if err.is_not_found() => {
                debug!(instance = %name, "instance already gone");
                return Ok(());
            }
            Err(err) => return Err(InstanceError::lifecycle("delete", &name, err)),
        };

        if runtime.status == STATUS_RUNNING {
            match self.change_state(&session, &name, StateAction::Stop).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    debug!(instance = %name, "instance vanished while stopping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            let vanished = self
                .waiter
                .wait_for("stop", &[STATUS_STOPPED], || async {
                    match session.server().instance_state(session.scope(), &name).await {
                        Ok(state) => Ok((false, state.status)),
                        Err(err) if err.is_not_found() => Ok((true, STATUS_STOPPED.to_owned())),
                        Err(err) => Err(err),
                    }
                })
                .await
                .map_err(|source| InstanceError::wait("stop", &name, source))?;
            if vanished {
                debug!(instance = %name, "ephemeral instance removed on stop");
                return Ok(());
            }
        }

        let operation = match session.server().delete_instance(session.scope(), &name).await {
            Ok(operation) => operation,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(InstanceError::lifecycle("delete", &name, err)),
        };
        session
            .server()
            .wait_operation(&operation, self.lifecycle_timeout)
            .await
            .map_err(|err| InstanceError::lifecycle("delete", &name, err))?;
        info!(instance = %name, "instance deleted");
        Ok(())
    }
}
