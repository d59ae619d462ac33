//! REST implementation of [`InstanceServer`].

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::debug;

use super::transport::{HttpMethod, RawRequest, RawResponse, Transport};
use super::{
    DaemonError, DaemonFuture, FileKind, FilePush, Image, ImageAlias, Instance, InstanceFile,
    InstancePut, InstanceServer, InstanceState, InstanceType, InstancesPost, Operation, Scope,
    ServerInfo, StatePut,
};

/// API extension required to create virtual machines.
pub const API_EXTENSION_VMS: &str = "virtual-machines";
/// API extension required to delete files inside instances.
pub const API_EXTENSION_FILE_DELETE: &str = "file_delete";
/// API extension required to address a cluster member.
pub const API_EXTENSION_CLUSTERING: &str = "clustering";

const API_ROOT: &str = "/1.0";

/// Standard response envelope wrapping every JSON reply.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Daemon client speaking the REST API over a [`Transport`].
pub struct LxdClient {
    transport: Box<dyn Transport>,
    info: OnceCell<ServerInfo>,
}

impl LxdClient {
    /// Creates a client over `transport`. No request is issued until the
    /// first call.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            info: OnceCell::new(),
        }
    }

    /// Returns the endpoint of the underlying transport.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    async fn cached_info(&self) -> Result<&ServerInfo, DaemonError> {
        self.info
            .get_or_try_init(|| async {
                let envelope = self.sync_call(HttpMethod::Get, API_ROOT, &Scope::default()).await?;
                decode_metadata::<ServerInfo>(envelope)
            })
            .await
    }

    async fn require_extension(&self, capability: &str) -> Result<(), DaemonError> {
        if self.cached_info().await?.has_extension(capability) {
            return Ok(());
        }
        Err(DaemonError::Unsupported {
            capability: capability.to_owned(),
        })
    }

    async fn guard_scope(&self, scope: &Scope) -> Result<(), DaemonError> {
        if scope.target.is_some() {
            self.require_extension(API_EXTENSION_CLUSTERING).await?;
        }
        Ok(())
    }

    async fn exchange(&self, request: RawRequest) -> Result<RawResponse, DaemonError> {
        debug!(
            endpoint = self.transport.endpoint(),
            method = %request.method,
            path = %request.path_and_query,
            "daemon request"
        );
        self.transport.send(request).await
    }

    async fn sync_call(
        &self,
        method: HttpMethod,
        path: &str,
        scope: &Scope,
    ) -> Result<Envelope, DaemonError> {
        let request = RawRequest {
            method,
            path_and_query: request_path(path, scope, &[])?,
            headers: Vec::new(),
            body: Vec::new(),
        };
        let response = self.exchange(request).await?;
        parse_envelope(&response)
    }

    async fn json_call<B: serde::Serialize + Sync>(
        &self,
        method: HttpMethod,
        path: &str,
        scope: &Scope,
        body: &B,
        headers: Vec<(String, String)>,
    ) -> Result<Envelope, DaemonError> {
        let payload = serde_json::to_vec(body).map_err(|err| DaemonError::Decode(err.to_string()))?;
        let mut all_headers = vec![(
            String::from("Content-Type"),
            String::from("application/json"),
        )];
        all_headers.extend(headers);
        let request = RawRequest {
            method,
            path_and_query: request_path(path, scope, &[])?,
            headers: all_headers,
            body: payload,
        };
        let response = self.exchange(request).await?;
        parse_envelope(&response)
    }

    async fn file_request(
        &self,
        method: HttpMethod,
        scope: &Scope,
        instance: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<RawResponse, DaemonError> {
        let request = RawRequest {
            method,
            path_and_query: request_path(
                &format!("{API_ROOT}/instances/{instance}/files"),
                scope,
                &[("path", path)],
            )?,
            headers,
            body,
        };
        self.exchange(request).await
    }
}

impl InstanceServer for LxdClient {
    fn server_info(&self) -> DaemonFuture<'_, ServerInfo> {
        Box::pin(async move { self.cached_info().await.cloned() })
    }

    fn image_alias<'a>(&'a self, scope: &'a Scope, alias: &'a str) -> DaemonFuture<'a, ImageAlias> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/images/aliases/{alias}");
            let envelope = self.sync_call(HttpMethod::Get, &path, scope).await?;
            decode_metadata(envelope)
        })
    }

    fn image<'a>(&'a self, scope: &'a Scope, fingerprint: &'a str) -> DaemonFuture<'a, Image> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/images/{fingerprint}");
            let envelope = self.sync_call(HttpMethod::Get, &path, scope).await?;
            decode_metadata(envelope)
        })
    }

    fn create_instance<'a>(
        &'a self,
        scope: &'a Scope,
        request: &'a InstancesPost,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            if request.kind == InstanceType::VirtualMachine {
                self.require_extension(API_EXTENSION_VMS).await?;
            }
            self.guard_scope(scope).await?;
            let path = format!("{API_ROOT}/instances");
            let envelope = self
                .json_call(HttpMethod::Post, &path, scope, request, Vec::new())
                .await?;
            decode_operation(envelope)
        })
    }

    fn instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, (Instance, String)> {
        Box::pin(async move {
            let request = RawRequest {
                method: HttpMethod::Get,
                path_and_query: request_path(&format!("{API_ROOT}/instances/{name}"), scope, &[])?,
                headers: Vec::new(),
                body: Vec::new(),
            };
            let response = self.exchange(request).await?;
            let etag = response.header("etag").unwrap_or_default().to_owned();
            let instance = decode_metadata(parse_envelope(&response)?)?;
            Ok((instance, etag))
        })
    }

    fn instance_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, InstanceState> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/instances/{name}/state");
            let envelope = self.sync_call(HttpMethod::Get, &path, scope).await?;
            decode_metadata(envelope)
        })
    }

    fn update_instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        record: &'a InstancePut,
        etag: &'a str,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/instances/{name}");
            let headers = if etag.is_empty() {
                Vec::new()
            } else {
                vec![(String::from("If-Match"), etag.to_owned())]
            };
            let envelope = self
                .json_call(HttpMethod::Put, &path, scope, record, headers)
                .await?;
            decode_operation(envelope)
        })
    }

    fn change_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        request: &'a StatePut,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/instances/{name}/state");
            let envelope = self
                .json_call(HttpMethod::Put, &path, scope, request, Vec::new())
                .await?;
            decode_operation(envelope)
        })
    }

    fn delete_instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            let path = format!("{API_ROOT}/instances/{name}");
            let envelope = self.sync_call(HttpMethod::Delete, &path, scope).await?;
            decode_operation(envelope)
        })
    }

    fn wait_operation<'a>(
        &'a self,
        operation: &'a Operation,
        timeout: Duration,
    ) -> DaemonFuture<'a, Operation> {
        Box::pin(async move {
            if operation.id.is_empty() {
                return Ok(operation.clone());
            }
            let seconds = timeout.as_secs().to_string();
            let request = RawRequest {
                method: HttpMethod::Get,
                path_and_query: request_path(
                    &format!("{API_ROOT}/operations/{}/wait", operation.id),
                    &Scope::default(),
                    &[("timeout", seconds.as_str())],
                )?,
                headers: Vec::new(),
                body: Vec::new(),
            };
            let response = self.exchange(request).await?;
            let finished: Operation = decode_metadata(parse_envelope(&response)?)?;
            if finished.failed() {
                return Err(DaemonError::OperationFailed {
                    id: finished.id,
                    message: finished.err,
                });
            }
            Ok(finished)
        })
    }

    fn push_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
        file: &'a FilePush,
    ) -> DaemonFuture<'a, ()> {
        Box::pin(async move {
            let headers = vec![
                (String::from("X-LXD-uid"), file.uid.to_string()),
                (String::from("X-LXD-gid"), file.gid.to_string()),
                (String::from("X-LXD-mode"), format!("{:04o}", file.mode)),
                (String::from("X-LXD-type"), file.kind.as_str().to_owned()),
                (String::from("X-LXD-write"), file.write.as_str().to_owned()),
                (
                    String::from("Content-Type"),
                    String::from("application/octet-stream"),
                ),
            ];
            let response = self
                .file_request(
                    HttpMethod::Post,
                    scope,
                    instance,
                    path,
                    headers,
                    file.content.clone(),
                )
                .await?;
            parse_envelope(&response).map(|_| ())
        })
    }

    fn delete_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, ()> {
        Box::pin(async move {
            self.require_extension(API_EXTENSION_FILE_DELETE).await?;
            let response = self
                .file_request(HttpMethod::Delete, scope, instance, path, Vec::new(), Vec::new())
                .await?;
            parse_envelope(&response).map(|_| ())
        })
    }

    fn file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, InstanceFile> {
        Box::pin(async move {
            let response = self
                .file_request(HttpMethod::Get, scope, instance, path, Vec::new(), Vec::new())
                .await?;
            if response.status >= 400 {
                parse_envelope(&response)?;
            }
            let kind = FileKind::from_header(response.header("x-lxd-type").unwrap_or("file"));
            let content = if kind == FileKind::Directory {
                let entries: Vec<String> = decode_metadata(parse_envelope(&response)?)?;
                entries.join("\n").into_bytes()
            } else {
                response.body.clone()
            };
            Ok(InstanceFile {
                content,
                uid: parse_header_number(&response, "x-lxd-uid", 10)?,
                gid: parse_header_number(&response, "x-lxd-gid", 10)?,
                mode: parse_header_number(&response, "x-lxd-mode", 8)?,
                kind,
            })
        })
    }
}

fn request_path(path: &str, scope: &Scope, extra: &[(&str, &str)]) -> Result<String, DaemonError> {
    let mut url = Url::parse("http://daemon.invalid")
        .map_err(|err| DaemonError::Decode(err.to_string()))?;
    url.set_path(path);
    let mut pairs = scope.query_pairs();
    pairs.extend_from_slice(extra);
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{query}", url.path()),
        _ => url.path().to_owned(),
    })
}

fn parse_envelope(response: &RawResponse) -> Result<Envelope, DaemonError> {
    let parsed = serde_json::from_slice::<Envelope>(&response.body);
    if response.status >= 400 {
        let message = parsed.as_ref().map_or_else(
            |_| String::from_utf8_lossy(&response.body).trim().to_owned(),
            |envelope| envelope.error.clone(),
        );
        return Err(DaemonError::from_status(response.status, message));
    }
    let envelope = parsed.map_err(|err| DaemonError::Decode(err.to_string()))?;
    if envelope.kind == "error" {
        let status = if envelope.error_code == 0 {
            response.status
        } else {
            envelope.error_code
        };
        return Err(DaemonError::from_status(status, envelope.error));
    }
    Ok(envelope)
}

fn decode_metadata<T: DeserializeOwned>(envelope: Envelope) -> Result<T, DaemonError> {
    serde_json::from_value(envelope.metadata).map_err(|err| DaemonError::Decode(err.to_string()))
}

fn decode_operation(envelope: Envelope) -> Result<Operation, DaemonError> {
    let from_url = envelope
        .operation
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned();
    let mut operation: Operation = if envelope.metadata.is_object() {
        decode_metadata(envelope)?
    } else {
        Operation::default()
    };
    if operation.id.is_empty() {
        operation.id = from_url;
    }
    Ok(operation)
}

fn parse_header_number(response: &RawResponse, name: &str, radix: u32) -> Result<u32, DaemonError> {
    response.header(name).map_or(Ok(0), |value| {
        u32::from_str_radix(value.trim(), radix)
            .map_err(|err| DaemonError::Decode(format!("invalid {name} header '{value}': {err}")))
    })
}
