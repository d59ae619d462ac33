//! Create: resolve the image, create, optionally start, gate on network and
//! upload files.

use tracing::{debug, info};

use super::{
    InstanceEngine, InstanceError, InstanceKind, InstanceResource, ResourceData, STATUS_RUNNING,
};
use crate::daemon::{InstanceSource, InstancesPost, StateAction};
use crate::files;
use crate::reconcile::expand_instance_config;
use crate::remote::{ImageServer, SessionHandle, parse_remote};

const SOURCE_IMAGE: &str = "image";

impl InstanceEngine {
    /// Creates the instance declared in `data.state`.
    ///
    /// Once the daemon has accepted the create, `data.id` holds the instance
    /// name and `data.partial` stays set until every later step succeeds, so
    /// a failure after that point leaves a recorded but unfinished resource.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] before any daemon call for a
    /// malformed declaration, [`InstanceError::ImageNotFound`] when the image
    /// cannot be resolved, and lifecycle, wait or file errors naming the
    /// failed stage otherwise.
    pub async fn create(&self, data: &mut ResourceData) -> Result<(), InstanceError> {
        let declared = data.state.clone();
        declared.validate()?;
        if declared.image.trim().is_empty() {
            return Err(InstanceError::Validation(String::from(
                "image must be set to create an instance",
            )));
        }
        let name = declared.name.clone();
        info!(instance = %name, remote = %declared.remote, "creating instance");

        let base = self.resolver.session_for(Some(&declared.remote)).await?;
        let source = self.resolve_image_source(&base, &declared).await?;
        let session = base
            .bind_project(&declared.project)
            .bind_target(&declared.target);

        let request = build_request(&declared, source);
        let operation = session
            .server()
            .create_instance(session.scope(), &request)
            .await
            .map_err(|err| InstanceError::lifecycle("create", &name, err))?;
        session
            .server()
            .wait_operation(&operation, self.lifecycle_timeout)
            .await
            .map_err(|err| InstanceError::lifecycle("create", &name, err))?;

        data.id.clone_from(&name);
        data.partial = true;
        debug!(instance = %name, "instance created");

        let defer_files =
            !declared.files.is_empty() && declared.kind == InstanceKind::VirtualMachine;
        if !defer_files {
            upload_all(&session, &declared).await?;
        }

        if declared.start_on_create || defer_files {
            self.change_state(&session, &name, StateAction::Start)
                .await?;
            self.wait_for_status(&session, &name, "start", STATUS_RUNNING)
                .await?;
            if declared.wait_for_network || defer_files {
                self.wait_for_network(&session, &name).await?;
            }
        }

        if defer_files {
            upload_all(&session, &declared).await?;
        }

        data.partial = false;
        info!(instance = %name, "instance ready");
        self.read(data).await
    }

    async fn resolve_image_source(
        &self,
        instance_session: &SessionHandle,
        declared: &InstanceResource,
    ) -> Result<InstanceSource, InstanceError> {
        let (image_remote, alias) = parse_remote(&declared.image, instance_session.remote());
        match self.resolver.image_server(&image_remote).await? {
            ImageServer::Catalog { url, protocol, .. } => {
                debug!(remote = %image_remote, %alias, "using catalog image");
                Ok(InstanceSource {
                    kind: SOURCE_IMAGE.to_owned(),
                    mode: Some(String::from("pull")),
                    server: Some(url),
                    protocol: Some(protocol),
                    alias: Some(alias),
                    fingerprint: None,
                })
            }
            ImageServer::Daemon(image_session) => {
                let scoped = image_session.bind_project(&declared.project);
                let server = scoped.server();
                let fingerprint = match server.image_alias(scoped.scope(), &alias).await {
                    Ok(entry) => entry.target,
                    Err(err) => {
                        debug!(%alias, error = %err, "alias lookup failed, trying fingerprint");
                        alias.clone()
                    }
                };
                let image = server
                    .image(scoped.scope(), &fingerprint)
                    .await
                    .map_err(|err| {
                        if err.is_not_found() {
                            InstanceError::ImageNotFound {
                                image: alias.clone(),
                                remote: image_remote.clone(),
                            }
                        } else {
                            InstanceError::lifecycle("resolve image for", &declared.name, err)
                        }
                    })?;

                let same_daemon = scoped.endpoint() == instance_session.endpoint();
                Ok(InstanceSource {
                    kind: SOURCE_IMAGE.to_owned(),
                    mode: (!same_daemon).then(|| String::from("pull")),
                    server: (!same_daemon).then(|| scoped.endpoint().to_owned()),
                    protocol: (!same_daemon).then(|| String::from("lxd")),
                    alias: None,
                    fingerprint: Some(image.fingerprint),
                })
            }
        }
    }
}

fn build_request(declared: &InstanceResource, source: InstanceSource) -> InstancesPost {
    let config = expand_instance_config(&declared.effective_config(), &declared.limits);
    InstancesPost {
        name: declared.name.clone(),
        kind: declared.kind.wire_type(),
        source,
        profiles: declared.effective_profiles(),
        config,
        devices: declared
            .devices
            .iter()
            .map(|device| (device.name.clone(), device.to_wire()))
            .collect(),
        ephemeral: declared.ephemeral,
    }
}

async fn upload_all(session: &SessionHandle, declared: &InstanceResource) -> Result<(), InstanceError> {
    for file in &declared.files {
        files::upload(session, &declared.name, file).await?;
    }
    Ok(())
}
