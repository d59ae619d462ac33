//! Daemon capability set.
//!
//! The daemon exposes instance, image and file operations on one
//! connection. They are modelled as a single trait so that the engine,
//! the file facility and the in-memory double all share one seam; calls
//! that need an optional API extension are guarded per call by the
//! implementation.

mod client;
mod error;
mod transport;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use client::{API_EXTENSION_CLUSTERING, API_EXTENSION_FILE_DELETE, API_EXTENSION_VMS, LxdClient};
pub use error::DaemonError;
pub use transport::{HttpMethod, HttpsTransport, RawRequest, RawResponse, Transport, UnixTransport};
pub use types::{
    FileKind, FilePush, Image, ImageAlias, Instance, InstanceFile, InstancePut, InstanceSource,
    InstanceState, InstanceType, InstancesPost, NetworkAddress, NetworkState, Operation, Scope,
    ServerEnvironment, ServerInfo, StateAction, StatePut, StringMap, WriteMode,
};

/// Future returned by daemon operations.
pub type DaemonFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DaemonError>> + Send + 'a>>;

/// Operations the provider issues against one daemon.
pub trait InstanceServer: Send + Sync {
    /// Fetches server identity and API extensions.
    fn server_info(&self) -> DaemonFuture<'_, ServerInfo>;

    /// Resolves an image alias to its target fingerprint.
    fn image_alias<'a>(&'a self, scope: &'a Scope, alias: &'a str) -> DaemonFuture<'a, ImageAlias>;

    /// Fetches an image record by fingerprint.
    fn image<'a>(&'a self, scope: &'a Scope, fingerprint: &'a str) -> DaemonFuture<'a, Image>;

    /// Starts instance creation and returns the background operation.
    fn create_instance<'a>(
        &'a self,
        scope: &'a Scope,
        request: &'a InstancesPost,
    ) -> DaemonFuture<'a, Operation>;

    /// Fetches an instance record together with its version token.
    fn instance<'a>(&'a self, scope: &'a Scope, name: &'a str)
    -> DaemonFuture<'a, (Instance, String)>;

    /// Fetches runtime state for an instance.
    fn instance_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> DaemonFuture<'a, InstanceState>;

    /// Replaces the writable instance record, guarded by `etag`.
    fn update_instance<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        record: &'a InstancePut,
        etag: &'a str,
    ) -> DaemonFuture<'a, Operation>;

    /// Requests a runtime state change.
    fn change_state<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
        request: &'a StatePut,
    ) -> DaemonFuture<'a, Operation>;

    /// Starts instance deletion.
    fn delete_instance<'a>(&'a self, scope: &'a Scope, name: &'a str)
    -> DaemonFuture<'a, Operation>;

    /// Blocks until the operation completes or `timeout` passes. A failed
    /// operation is reported as [`DaemonError::OperationFailed`].
    fn wait_operation<'a>(
        &'a self,
        operation: &'a Operation,
        timeout: Duration,
    ) -> DaemonFuture<'a, Operation>;

    /// Writes a file or directory inside an instance.
    fn push_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
        file: &'a FilePush,
    ) -> DaemonFuture<'a, ()>;

    /// Removes a file inside an instance.
    fn delete_file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, ()>;

    /// Reads a file or directory listing from inside an instance.
    fn file<'a>(
        &'a self,
        scope: &'a Scope,
        instance: &'a str,
        path: &'a str,
    ) -> DaemonFuture<'a, InstanceFile>;
}
