//! Command dispatch and portal bootstrap.

mod ops;
mod serve;

use std::path::PathBuf;

use hotspot_config::{Config, SecretResolver, config_path, load_config, write_default_config};
use hotspot_core::{Portal, SharedMetrics};
use tracing::debug;

use crate::cli::{Command, GlobalOpts, InitConfigArgs};
use crate::error::CliError;
use crate::output;

fn config_file(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config_path)
}

/// Load the static configuration. A missing file yields defaults.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = config_file(global);
    debug!(path = %path.display(), "loading configuration");
    load_config(Some(&path)).map_err(|source| CliError::Config {
        path: path.display().to_string(),
        source,
    })
}

async fn build_portal(
    config: &Config,
    global: &GlobalOpts,
    metrics: SharedMetrics,
) -> Result<Portal, CliError> {
    let portal_config = config
        .to_portal_config(&SecretResolver::system())
        .map_err(|source| CliError::Config {
            path: config_file(global).display().to_string(),
            source,
        })?;
    Ok(Portal::build(portal_config, metrics).await?)
}

pub async fn dispatch(command: Command, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    match command {
        Command::Serve(args) => serve::handle(&args, config, global).await,
        Command::InitConfig(args) => init_config(&args, global),
        other => ops::handle(other, config, global).await,
    }
}

pub fn init_config(args: &InitConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = args.path.clone().unwrap_or_else(|| config_file(global));
    write_default_config(&path).map_err(|source| CliError::Config {
        path: path.display().to_string(),
        source,
    })?;
    output::print_output(&format!("Wrote {}", path.display()), global.quiet);
    Ok(())
}
