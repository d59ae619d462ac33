//! Command-line interface definitions for the `lxd-provider` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `lxd-provider` binary.
#[derive(Debug, Parser)]
#[command(
    name = "lxd-provider",
    about = "Reconcile declared LXD instances with a daemon",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Provider configuration file (TOML) declaring remotes.
    #[arg(long, value_name = "PATH", env = "LXD_PROVIDER_CONFIG", global = true)]
    pub(crate) provider_config: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `lxd-provider`.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum Command {
    /// Create or update the instance declared in a TOML file.
    #[command(name = "apply", about = "Create or update the instance declared in a TOML file")]
    Apply(ApplyCommand),
    /// Print the reflected state of an instance.
    #[command(name = "show", about = "Print the reflected state of an instance")]
    Show(InstanceCommand),
    /// Stop and delete an instance.
    #[command(name = "destroy", about = "Stop and delete an instance")]
    Destroy(InstanceCommand),
    /// Rebuild the state of an existing instance.
    #[command(name = "import", about = "Rebuild the state of an existing instance")]
    Import(ImportCommand),
}

/// Arguments for `lxd-provider apply`.
#[derive(Debug, Parser)]
pub(crate) struct ApplyCommand {
    /// Instance declaration file.
    #[arg(value_name = "FILE")]
    pub(crate) file: String,
}

/// Arguments for commands addressing one instance.
#[derive(Debug, Parser)]
pub(crate) struct InstanceCommand {
    /// Instance name, optionally qualified as `<remote>:<name>`.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// Project holding the instance.
    #[arg(long, value_name = "PROJECT")]
    pub(crate) project: Option<String>,
}

/// Arguments for `lxd-provider import`.
#[derive(Debug, Parser)]
pub(crate) struct ImportCommand {
    /// Import id of the form `[<remote>:]<name>[/<image>]`.
    #[arg(value_name = "SPEC")]
    pub(crate) spec: String,
}
