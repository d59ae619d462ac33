//! Core library for the LXD infrastructure-as-code provider.
//!
//! The crate reconciles declared instances (containers and virtual
//! machines) with a container hypervisor daemon: it resolves which daemon,
//! project and cluster member each resource addresses, keeps declared and
//! daemon-computed configuration from drifting, and drives create, read,
//! update, delete and import including start-up gating and file uploads.

pub mod config;
pub mod daemon;
pub mod files;
pub mod instance;
pub mod reconcile;
pub mod remote;
pub mod test_support;
pub mod wait;

pub use config::{ConfigError, LxdEnvConfig, ProviderConfig, ResolvedConfig, ResolvedRemote};
pub use daemon::{DaemonError, InstanceServer, LxdClient};
pub use files::{FileError, FilePayload, file_resource_id, parse_file_resource_id};
pub use instance::{InstanceEngine, InstanceError, InstanceResource, ResourceData};
pub use remote::{Provider, RemoteResolver, ResolveError, SessionHandle};
pub use wait::{WaitError, WaitPolicy, Waiter};
