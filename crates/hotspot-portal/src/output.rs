//! Output formatting: table, JSON, YAML.
//!
//! Renders command results in the format selected by `--output`. Table uses
//! `tabled`, structured formats use serde.

use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Utc};
use hotspot_core::sync::StepOutcome;
use hotspot_core::{SyncReport, Transaction, TransactionStatus};
use owo_colors::OwoColorize;
use serde_json::Value;
use tabled::{Table, Tabled, settings::Style};

use crate::cli::{ColorMode, OutputFormat};

// ── Color helpers ────────────────────────────────────────────────────

pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

fn paint_status(status: TransactionStatus, color: bool) -> String {
    let text = status.to_string();
    if !color {
        return text;
    }
    match status {
        TransactionStatus::Success => text.green().to_string(),
        TransactionStatus::Pending | TransactionStatus::Unknown => text.yellow().to_string(),
        _ => text.red().to_string(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

pub fn render_list<T, R>(format: OutputFormat, data: &[T], to_row: impl Fn(&T) -> R) -> String
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            render_table(&rows)
        }
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
    }
}

/// Single item; table format uses `detail_fn` for a key/value view.
pub fn render_single<T>(format: OutputFormat, data: &T, detail_fn: impl Fn(&T) -> String) -> String
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Table => detail_fn(data),
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
    }
}

pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

fn render_json<T: serde::Serialize + ?Sized>(data: &T, compact: bool) -> String {
    let rendered = if compact {
        serde_json::to_string(data)
    } else {
        serde_json::to_string_pretty(data)
    };
    rendered.unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

fn render_yaml<T: serde::Serialize + ?Sized>(data: &T) -> String {
    serde_yaml::to_string(data).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

// ── Rows & detail views ──────────────────────────────────────────────

#[derive(Tabled)]
pub struct TransactionRow {
    #[tabled(rename = "Order")]
    pub order_id: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Amount")]
    pub amount: i64,
    #[tabled(rename = "Method")]
    pub method: String,
    #[tabled(rename = "Age")]
    pub age: String,
}

fn age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        3600..86_400 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

pub fn transaction_row(txn: &Transaction, now: DateTime<Utc>, color: bool) -> TransactionRow {
    TransactionRow {
        order_id: txn.order_id.clone(),
        status: paint_status(txn.status, color),
        amount: txn.amount,
        method: txn.payment_method.clone().unwrap_or_else(|| "-".into()),
        age: age(txn.created_at, now),
    }
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Result")]
    result: String,
}

fn describe(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Ok { changed } => format!("ok ({changed} changed)"),
        StepOutcome::Skipped { reason } => format!("skipped: {reason}"),
        StepOutcome::Failed { errors } => format!("failed: {}", errors.join("; ")),
    }
}

pub fn sync_detail(report: &SyncReport) -> String {
    let mut out = format!(
        "User:          {}\n\
         Status:        {}\n\
         Profile:       {}\n\
         Binding:       {}\n\
         Address list:  {}\n",
        report.user_id, report.status, report.profile, report.binding_type, report.address_list,
    );
    if let Some(change) = report.debt_limit {
        out.push_str(&format!("Debt limit:    {change}\n"));
    }
    if report.lock_degraded {
        out.push_str("Lock:          process-local (shared lock store unreachable)\n");
    }
    let rows: Vec<StepRow> = report
        .steps
        .iter()
        .map(|s| StepRow {
            step: s.step.to_string(),
            result: describe(&s.outcome),
        })
        .collect();
    out.push_str(&render_table(&rows));
    out
}

/// Flat JSON object as `key: value` lines, keys in order.
pub fn summary_detail(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;
    use hotspot_core::UserId;
    use serde_json::json;

    use super::*;

    #[test]
    fn ages_are_compact() {
        let now = Utc::now();
        assert_eq!(age(now - Duration::seconds(42), now), "42s");
        assert_eq!(age(now - Duration::minutes(5), now), "5m");
        assert_eq!(age(now - Duration::hours(3), now), "3h");
        assert_eq!(age(now - Duration::days(2), now), "2d");
        assert_eq!(age(now + Duration::seconds(5), now), "0s");
    }

    #[test]
    fn transaction_rows_are_plain_without_color() {
        let now = Utc::now();
        let mut txn = Transaction::new(UserId::new(), None, "HS-20260101-ABCDEFGHIJ".into(), 50_000, now);
        txn.status = TransactionStatus::Pending;
        let row = transaction_row(&txn, now, false);
        assert_eq!(row.status, "pending");
        assert_eq!(row.method, "-");

        let table = render_list(OutputFormat::Table, &[txn], |t| transaction_row(t, now, false));
        assert!(table.contains("HS-20260101-ABCDEFGHIJ"), "{table}");
    }

    #[test]
    fn summaries_render_as_lines() {
        let value = json!({ "blocked": 2, "mode": "forced" });
        insta::assert_snapshot!(summary_detail(&value), @r"
        blocked: 2
        mode: forced
        ");
    }
}
