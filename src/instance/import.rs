//! Import: rebuild a resource from `[<remote>:]<name>[/<image>]`.

use tracing::info;

use super::{InstanceEngine, InstanceError, InstanceResource, ResourceData};

impl InstanceEngine {
    /// Reconstructs the resource named by `spec` from daemon state.
    ///
    /// The image alias cannot be recovered from the daemon, so `image` stays
    /// empty unless `spec` carries a `/<image>` suffix. `remote` is recorded
    /// only when it differs from the provider default.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] for an empty name and
    /// [`InstanceError::NotFound`] when the instance does not exist.
    pub async fn import(&self, spec: &str) -> Result<ResourceData, InstanceError> {
        let (qualified, image) = spec.split_once('/').unwrap_or((spec, ""));
        let (remote, name) = self.resolver.parse_remote(qualified);
        if name.trim().is_empty() {
            return Err(InstanceError::Validation(format!(
                "import id '{spec}' must look like [<remote>:]<name>[/<image>]"
            )));
        }

        let recorded_remote = if remote == self.resolver.default_remote() {
            String::new()
        } else {
            remote
        };
        info!(instance = %name, remote = %recorded_remote, "importing instance");

        let mut data = ResourceData::new(InstanceResource {
            name: name.clone(),
            image: image.to_owned(),
            remote: recorded_remote,
            ..InstanceResource::default()
        });
        data.id.clone_from(&name);
        self.read(&mut data).await?;
        if !data.has_id() {
            return Err(InstanceError::NotFound(name));
        }
        Ok(data)
    }
}
