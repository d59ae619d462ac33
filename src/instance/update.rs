//! Update: apply config, profiles, devices and limits in one guarded write,
//! then replace files.

use tracing::{debug, info};

use super::{InstanceEngine, InstanceError, InstanceResource, ResourceData};
use crate::daemon::InstancePut;
use crate::files;
use crate::reconcile::LIMITS_PREFIX;

impl InstanceEngine {
    /// Moves the instance from the `prior` declaration to `data.state`.
    ///
    /// The daemon sees at most one record update, guarded by the version
    /// token read at the start, followed by file deletions and then
    /// uploads.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Lifecycle`] when the record cannot be read
    /// or written (see [`InstanceError::is_conflict`] for stale tokens) and
    /// [`InstanceError::File`] when a file operation fails.
    pub async fn update(
        &self,
        prior: &InstanceResource,
        data: &mut ResourceData,
    ) -> Result<(), InstanceError> {
        let declared = data.state.clone();
        declared.validate()?;
        let name = if data.id.is_empty() {
            declared.name.clone()
        } else {
            data.id.clone()
        };
        info!(instance = %name, "updating instance");

        let session = self.session(&declared).await?;
        let (record, etag) = session
            .server()
            .instance(session.scope(), &name)
            .await
            .map_err(|err| InstanceError::lifecycle("read", &name, err))?;

        let current = record.to_put();
        let desired = apply_declaration(&current, prior, &declared);
        if desired == current {
            debug!(instance = %name, "record already matches declaration");
        } else {
            let operation = session
                .server()
                .update_instance(session.scope(), &name, &desired, &etag)
                .await
                .map_err(|err| InstanceError::lifecycle("update", &name, err))?;
            session
                .server()
                .wait_operation(&operation, self.lifecycle_timeout)
                .await
                .map_err(|err| InstanceError::lifecycle("update", &name, err))?;
        }

        for file in &prior.files {
            files::delete(&session, &name, &file.target_file).await?;
        }
        for file in &declared.files {
            files::upload(&session, &name, file).await?;
        }

        self.read(data).await
    }
}

/// Builds the record to submit, in the order config, profiles, devices,
/// limits. Writable fields the provider does not manage are carried over
/// from `current`.
fn apply_declaration(
    current: &InstancePut,
    prior: &InstanceResource,
    declared: &InstanceResource,
) -> InstancePut {
    let mut next = current.clone();
    let declared_config = declared.effective_config();

    for key in prior.config.keys() {
        if !declared_config.contains_key(key) {
            next.config.remove(key);
        }
    }
    for (key, value) in declared_config {
        next.config.insert(key, value);
    }

    next.profiles = declared.effective_profiles();

    for device in &prior.devices {
        next.devices.remove(&device.name);
    }
    for device in &declared.devices {
        next.devices.insert(device.name.clone(), device.to_wire());
    }

    for key in prior.limits.keys() {
        next.config.remove(&format!("{LIMITS_PREFIX}{key}"));
    }
    for (key, value) in &declared.limits {
        next.config
            .insert(format!("{LIMITS_PREFIX}{key}"), value.clone());
    }

    next
}
