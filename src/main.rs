//! Binary entry point for the `lxd-provider` CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lxd_provider::{
    ConfigError, InstanceEngine, InstanceError, InstanceResource, LxdEnvConfig, Provider,
    ProviderConfig, ResolveError, ResourceData,
};

mod cli;

use cli::{ApplyCommand, Cli, Command, ImportCommand, InstanceCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("remote resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("failed to render state: {0}")]
    Render(String),
}

/// Output document for commands that report instance state.
#[derive(Debug, Serialize)]
struct StateReport<'a> {
    id: &'a str,
    partial: bool,
    #[serde(flatten)]
    state: &'a InstanceResource,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let provider = load_provider(cli.provider_config.as_deref())?;
    let engine = provider.instance_engine();
    match cli.command {
        Command::Apply(args) => apply(&engine, &args).await,
        Command::Show(args) => show(&engine, &args).await,
        Command::Destroy(args) => destroy(&engine, &args).await,
        Command::Import(args) => import(&engine, &args).await,
    }
}

fn load_provider(path: Option<&str>) -> Result<Provider, CliError> {
    let env = LxdEnvConfig::load_without_cli_args()?;
    let config = match path {
        Some(file) => ProviderConfig::from_toml_file(&Utf8PathBuf::from(file))?,
        None => ProviderConfig::default(),
    };
    Ok(Provider::from_config(&config, &env)?)
}

async fn apply(engine: &InstanceEngine, args: &ApplyCommand) -> Result<(), CliError> {
    let declared = InstanceResource::from_toml_file(&Utf8PathBuf::from(args.file.as_str()))?;
    let mut data = ResourceData::new(declared.clone());
    data.id.clone_from(&declared.name);

    if engine.exists(&data).await? {
        engine.read(&mut data).await?;
        let observed = data.state.clone();
        if declared.needs_update(&observed) || !declared.files.is_empty() {
            info!(instance = %declared.name, "applying changes to existing instance");
            let prior = InstanceResource {
                files: declared.files.clone(),
                ..observed
            };
            data.state = declared;
            engine.update(&prior, &mut data).await?;
        } else {
            info!(instance = %declared.name, "instance already matches declaration");
        }
    } else {
        let mut fresh = ResourceData::new(declared);
        engine.create(&mut fresh).await?;
        data = fresh;
    }
    print_state(&data)
}

async fn show(engine: &InstanceEngine, args: &InstanceCommand) -> Result<(), CliError> {
    let mut data = addressed(engine, args);
    engine.read(&mut data).await?;
    if !data.has_id() {
        return Err(InstanceError::NotFound(data.state.name).into());
    }
    print_state(&data)
}

async fn destroy(engine: &InstanceEngine, args: &InstanceCommand) -> Result<(), CliError> {
    let data = addressed(engine, args);
    engine.delete(&data).await?;
    info!(instance = %data.id, "instance destroyed");
    Ok(())
}

async fn import(engine: &InstanceEngine, args: &ImportCommand) -> Result<(), CliError> {
    let data = engine.import(&args.spec).await?;
    print_state(&data)
}

fn addressed(engine: &InstanceEngine, args: &InstanceCommand) -> ResourceData {
    let (remote, name) = engine.resolver().parse_remote(&args.name);
    let mut data = ResourceData::new(InstanceResource {
        name: name.clone(),
        remote,
        project: args.project.clone().unwrap_or_default(),
        ..InstanceResource::default()
    });
    data.id = name;
    data
}

fn print_state(data: &ResourceData) -> Result<(), CliError> {
    let report = StateReport {
        id: &data.id,
        partial: data.partial,
        state: &data.state,
    };
    let rendered =
        serde_json::to_string_pretty(&report).map_err(|err| CliError::Render(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Render(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
