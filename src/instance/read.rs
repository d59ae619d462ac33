//! Read: reflect the daemon record and runtime state into the resource.

use tracing::{debug, warn};

use super::{Device, InstanceEngine, InstanceError, InstanceKind, ResourceData, select_addresses};
use crate::reconcile::partition_instance_config;

/// Location reported by daemons that are not clustered.
const STANDALONE_LOCATION: &str = "none";

impl InstanceEngine {
    /// Refreshes `data.state` from the daemon. A missing instance clears
    /// `data.id` instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] for any daemon failure other than absence.
    pub async fn read(&self, data: &mut ResourceData) -> Result<(), InstanceError> {
        if !data.has_id() {
            return Ok(());
        }
        let name = data.id.clone();
        let session = self.session(&data.state).await?;

        let record = match session.server().instance(session.scope(), &name).await {
            Ok((record, _etag)) => record,
            Err(err) if err.is_not_found() => {
                debug!(instance = %name, "instance vanished; clearing id");
                data.id.clear();
                return Ok(());
            }
            Err(err) => return Err(InstanceError::lifecycle("read", &name, err)),
        };
        let runtime = match session.server().instance_state(session.scope(), &name).await {
            Ok(runtime) => runtime,
            Err(err) if err.is_not_found() => {
                data.id.clear();
                return Ok(());
            }
            Err(err) => return Err(InstanceError::lifecycle("read state of", &name, err)),
        };

        let state = &mut data.state;
        state.clear_computed();
        state.name.clone_from(&record.name);
        state.kind = InstanceKind::from_observed(&record.kind)?;
        let partitioned = partition_instance_config(&record.config);
        state.config = partitioned.config;
        state.limits = partitioned.limits;
        state.ephemeral = record.ephemeral;
        state.privileged = false;
        if !record.location.is_empty() && record.location != STANDALONE_LOCATION {
            state.target.clone_from(&record.location);
        }
        state.status.clone_from(&runtime.status);
        state.profiles.clone_from(&record.profiles);
        state.devices = record
            .devices
            .iter()
            .filter_map(|(device_name, wire)| match Device::from_wire(device_name, wire) {
                Ok(device) => Some(device),
                Err(err) => {
                    warn!(instance = %name, device = %device_name, error = %err, "skipping device");
                    None
                }
            })
            .collect();

        let addresses = select_addresses(&record.config, &runtime.interfaces());
        state.ip_address.clone_from(&addresses.ipv4);
        state.ipv4_address = addresses.ipv4;
        state.ipv6_address = addresses.ipv6;
        state.mac_address = addresses.mac;
        Ok(())
    }
}
