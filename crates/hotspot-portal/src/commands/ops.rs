//! One-shot operator commands. Each builds the portal, runs one engine
//! operation and prints its result; background jobs are never started.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hotspot_config::Config;
use hotspot_core::model::normalize_to_e164;
use hotspot_core::{CoreError, JobKind, NoopMetrics, Portal, SyncRequest, UserId};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::output::{self, render_list, render_single, should_color, summary_detail};

pub async fn handle(command: Command, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let portal = super::build_portal(config, global, Arc::new(NoopMetrics)).await?;
    let result = run(command, &portal, global).await;
    portal.shutdown().await;
    result
}

async fn run(command: Command, portal: &Portal, global: &GlobalOpts) -> Result<(), CliError> {
    let format = global.output;
    match command {
        Command::SyncUser(args) => {
            let user_id = resolve_user(portal, &args.user).await?;
            let report = portal
                .sync()
                .sync_user(SyncRequest::new(user_id).source("cli"))
                .await?;
            if report.is_partial() {
                warn!(user_id = %user_id, "sync finished with failed steps");
            }
            output::print_output(
                &render_single(format, &report, output::sync_detail),
                global.quiet,
            );
            Ok(())
        }

        Command::ReconcilePending(args) => {
            let grace = args
                .grace_secs
                .map_or_else(|| portal.settings().current().pending_grace, Duration::from_secs);
            let summary = portal.reconciler().reconcile_pending(grace).await?;
            output::print_output(
                &render_single(format, &json!(summary), summary_detail),
                global.quiet,
            );
            Ok(())
        }

        Command::EnforceDebt(args) => {
            let blocked = portal
                .jobs()
                .enforce_manual_debt(Utc::now(), args.force)
                .await?;
            output::print_output(
                &render_single(format, &json!({ "blocked": blocked }), summary_detail),
                global.quiet,
            );
            Ok(())
        }

        Command::RouterCheck => router_check(portal, global).await,

        Command::Pending(args) => {
            let now = Utc::now();
            let older_than = chrono::Duration::try_seconds(
                i64::try_from(args.older_than_secs).unwrap_or(i64::MAX),
            )
            .unwrap_or(chrono::Duration::MAX);
            let cutoff = now.checked_sub_signed(older_than).unwrap_or(now);
            let mut tx = portal.store().begin().await?;
            let open = tx.open_transactions(cutoff).await?;
            tx.commit().await?;

            let color = should_color(global.color);
            output::print_output(
                &render_list(format, &open, |t| output::transaction_row(t, now, color)),
                global.quiet,
            );
            Ok(())
        }

        Command::RunJob(args) => {
            let kind = JobKind::from_str(args.job.trim()).map_err(|_| CliError::Validation {
                field: "job".into(),
                reason: format!("unknown job '{}'", args.job),
            })?;
            let summary = portal.jobs().run(kind).await?;
            output::print_output(&render_single(format, &summary, summary_detail), global.quiet);
            Ok(())
        }

        Command::Serve(_) | Command::InitConfig(_) => Ok(()),
    }
}

/// Accepts a user id or any phone spelling the portal normalizes.
async fn resolve_user(portal: &Portal, raw: &str) -> Result<UserId, CliError> {
    if let Ok(id) = UserId::from_str(raw) {
        return Ok(id);
    }
    let phone = normalize_to_e164(raw)?;
    let mut tx = portal.store().begin().await?;
    let user = tx.find_user_by_phone(&phone).await?;
    tx.commit().await?;
    user.map(|u| u.id)
        .ok_or_else(|| CoreError::not_found("user", phone.as_str()).into())
}

#[derive(Debug, Serialize)]
struct RouterCheck {
    database: String,
    router: String,
    identity: Option<String>,
}

async fn router_check(portal: &Portal, global: &GlobalOpts) -> Result<(), CliError> {
    let health = portal.health().await;
    let identity = match portal.sync().gateway().system_identity().await {
        Ok(name) => Some(name),
        Err(e) => {
            warn!(error = %e, "router identity query failed");
            None
        }
    };
    let healthy = health.is_ok() && identity.is_some();
    let check = RouterCheck {
        database: health.database.err().unwrap_or_else(|| "ok".into()),
        router: health.router.err().unwrap_or_else(|| "ok".into()),
        identity,
    };

    output::print_output(
        &render_single(global.output, &check, |c| {
            format!(
                "Database:  {}\nRouter:    {}\nIdentity:  {}",
                c.database,
                c.router,
                c.identity.as_deref().unwrap_or("-")
            )
        }),
        global.quiet,
    );
    if healthy {
        Ok(())
    } else {
        Err(CliError::Unhealthy {
            summary: format!("database: {}, router: {}", check.database, check.router),
        })
    }
}
