//! Clap derive structures for the `hotspot-portal` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// hotspot-portal -- access-state reconciliation for a MikroTik hotspot
#[derive(Debug, Parser)]
#[command(
    name = "hotspot-portal",
    version,
    about = "Keep hotspot quota, router state and payments in agreement",
    long_about = "Runs the portal's webhook and transaction endpoints with the\n\
        background jobs, or performs one reconciliation step from the shell.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'C', env = "PORTAL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "PORTAL_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the HTTP endpoints and run the background jobs
    Serve(ServeArgs),

    /// Project one user's access state onto the router
    #[command(name = "sync-user")]
    SyncUser(SyncUserArgs),

    /// Poll the payment provider for stale open transactions
    #[command(name = "reconcile-pending")]
    ReconcilePending(ReconcilePendingArgs),

    /// Block users still carrying manual debt at month end
    #[command(name = "enforce-debt")]
    EnforceDebt(EnforceDebtArgs),

    /// Check database and router reachability
    #[command(name = "router-check")]
    RouterCheck,

    /// List open transactions
    Pending(PendingArgs),

    /// Run one background job once and print its summary
    #[command(name = "run-job")]
    RunJob(RunJobArgs),

    /// Write a starter configuration file
    #[command(name = "init-config")]
    InitConfig(InitConfigArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address (overrides server.bind)
    #[arg(long, env = "PORTAL_BIND")]
    pub bind: Option<SocketAddr>,

    /// Do not start the background jobs
    #[arg(long)]
    pub no_jobs: bool,
}

#[derive(Debug, Args)]
pub struct SyncUserArgs {
    /// User id (UUID) or phone number
    pub user: String,
}

#[derive(Debug, Args)]
pub struct ReconcilePendingArgs {
    /// Only poll transactions older than this many seconds (defaults to the
    /// TRANSACTION_PENDING_GRACE_SECONDS setting)
    #[arg(long)]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct EnforceDebtArgs {
    /// Run even when today is not the last day of the month
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct PendingArgs {
    /// Only list transactions older than this many seconds
    #[arg(long, default_value_t = 0)]
    pub older_than_secs: u64,
}

#[derive(Debug, Args)]
pub struct RunJobArgs {
    /// Job name (reconcile-pending, expire-sweep, enforce-manual-debt,
    /// resync-all, refresh-settings, quota-notices)
    pub job: String,
}

#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Where to write the file (defaults to --config, then the platform path)
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }
}
