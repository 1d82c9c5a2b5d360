mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Logs go to stderr so command output stays parseable. `serve` logs at
/// info by default, one-shot commands only warn.
fn init_tracing(verbosity: u8, quiet_default: &str, json: bool) {
    let filter = match verbosity {
        0 => quiet_default,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // Writing the starter file must not require a readable one
    if let Command::InitConfig(args) = &cli.command {
        init_tracing(cli.global.verbose, "warn", false);
        return commands::init_config(args, &cli.global);
    }

    let config = commands::load(&cli.global)?;
    let base = if matches!(cli.command, Command::Serve(_)) {
        "info"
    } else {
        "warn"
    };
    init_tracing(cli.global.verbose, base, config.server.log_format == "json");

    tracing::debug!(command = ?cli.command, "dispatching command");
    commands::dispatch(cli.command, &config, &cli.global).await
}
