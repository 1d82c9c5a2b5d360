// ── Background jobs ──
//
// Periodic work owned by the portal: payment reconciliation, local expiry,
// end-of-month manual-debt enforcement, full router re-sync, settings
// refresh and quota/expiry reminders. Each job runs in its own task on a
// fixed interval and stops at the next tick boundary once the scheduler's
// token is cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::{User, UserId};
use crate::notify::{DispatchOutcome, NotificationDispatcher, NotificationEvent};
use crate::policy::{is_auto_debt_block, manual_eom_block_reason};
use crate::quota::{self, MutationMeta};
use crate::reconcile::Reconciler;
use crate::settings::SettingsProvider;
use crate::store::Store;
use crate::sync::{HotspotSync, SyncRequest};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobKind {
    ReconcilePending,
    ExpireSweep,
    EnforceManualDebt,
    ResyncAll,
    RefreshSettings,
    QuotaNotices,
}

/// Interval per job; a zero interval disables the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPeriods {
    pub reconcile_pending_secs: u64,
    pub expire_sweep_secs: u64,
    pub enforce_manual_debt_secs: u64,
    pub resync_all_secs: u64,
    pub refresh_settings_secs: u64,
    pub quota_notices_secs: u64,
}

impl Default for JobPeriods {
    fn default() -> Self {
        Self {
            reconcile_pending_secs: 60,
            expire_sweep_secs: 300,
            enforce_manual_debt_secs: 3_600,
            resync_all_secs: 900,
            refresh_settings_secs: 60,
            quota_notices_secs: 1_800,
        }
    }
}

impl JobPeriods {
    pub fn period(&self, kind: JobKind) -> Option<Duration> {
        let secs = match kind {
            JobKind::ReconcilePending => self.reconcile_pending_secs,
            JobKind::ExpireSweep => self.expire_sweep_secs,
            JobKind::EnforceManualDebt => self.enforce_manual_debt_secs,
            JobKind::ResyncAll => self.resync_all_secs,
            JobKind::RefreshSettings => self.refresh_settings_secs,
            JobKind::QuotaNotices => self.quota_notices_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

// ── Reminder rules ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaNotice {
    /// Send `event` and remember `key` in `last_quota_notice`.
    Send {
        event: NotificationEvent,
        key: String,
        remaining_mb: i64,
    },
    /// Back above every mark; forget the last notice.
    Clear,
    Nothing,
}

/// Decide the quota reminder for a user. `marks` are remaining-MB
/// thresholds, largest first. Each mark (and `habis`) is sent once until
/// the user climbs back above the highest mark.
pub fn quota_notice(user: &User, marks: &[i64]) -> QuotaNotice {
    if user.is_unlimited || user.purchased_mb <= 0 {
        return QuotaNotice::Nothing;
    }
    let remaining = user.remaining_mb();
    let remaining_mb = remaining.floor().to_i64().unwrap_or(0);

    let (event, key) = if remaining <= Decimal::ZERO {
        (NotificationEvent::QuotaHabis, "habis".to_owned())
    } else if let Some(mark) = marks.iter().rev().find(|m| remaining <= Decimal::from(**m)) {
        (NotificationEvent::QuotaLow, format!("low:{mark}"))
    } else if user.last_quota_notice.is_some() {
        return QuotaNotice::Clear;
    } else {
        return QuotaNotice::Nothing;
    };

    if user.last_quota_notice.as_deref() == Some(key.as_str()) {
        QuotaNotice::Nothing
    } else {
        QuotaNotice::Send {
            event,
            key,
            remaining_mb: remaining_mb.max(0),
        }
    }
}

/// Expiry within `days` and not yet reminded for this expiry.
pub fn expiry_notice_due(user: &User, days: i64, now: DateTime<Utc>) -> bool {
    let Some(expiry) = user.expiry else {
        return false;
    };
    let window = chrono::Duration::days(days);
    days > 0
        && expiry > now
        && expiry - now <= window
        && user.last_expiry_notice_at.is_none_or(|at| at < expiry - window)
}

/// Last local calendar day of the month.
pub fn is_end_of_month(now: DateTime<Utc>, offset: FixedOffset) -> bool {
    now.with_timezone(&offset)
        .date_naive()
        .succ_opt()
        .is_some_and(|next| next.day() == 1)
}

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Jobs {
    store: Arc<dyn Store>,
    reconciler: Arc<Reconciler>,
    sync: HotspotSync,
    settings: Arc<SettingsProvider>,
    notifier: Option<Arc<NotificationDispatcher>>,
}

impl std::fmt::Debug for Jobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobs")
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

impl Jobs {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Arc<Reconciler>,
        sync: HotspotSync,
        settings: Arc<SettingsProvider>,
        notifier: Option<Arc<NotificationDispatcher>>,
    ) -> Self {
        Self {
            store,
            reconciler,
            sync,
            settings,
            notifier,
        }
    }

    /// Run one job once and summarise what it did.
    pub async fn run(&self, kind: JobKind) -> Result<Value, CoreError> {
        let now = Utc::now();
        match kind {
            JobKind::ReconcilePending => {
                let grace = self.settings.current().pending_grace;
                let summary = self.reconciler.reconcile_pending(grace).await?;
                Ok(json!(summary))
            }
            JobKind::ExpireSweep => {
                let expired = self.reconciler.expire_sweep(now).await?;
                Ok(json!({ "expired": expired }))
            }
            JobKind::EnforceManualDebt => {
                let blocked = self.enforce_manual_debt(now, false).await?;
                Ok(json!({ "blocked": blocked }))
            }
            JobKind::ResyncAll => {
                let summary = self.sync.resync_all("job").await?;
                Ok(json!(summary))
            }
            JobKind::RefreshSettings => {
                self.settings.refresh().await?;
                Ok(json!({ "refreshed": true }))
            }
            JobKind::QuotaNotices => {
                let sent = self.quota_notices(now).await?;
                Ok(json!({ "sent": sent }))
            }
        }
    }

    /// Hard-block users still carrying manual debt at month end. Runs only
    /// on the last local day of the month unless `force` is set. Users
    /// under an auto-debt block are moved to the end-of-month block.
    pub async fn enforce_manual_debt(&self, now: DateTime<Utc>, force: bool) -> Result<usize, CoreError> {
        let settings = self.settings.current();
        if !force && !is_end_of_month(now, settings.utc_offset) {
            return Ok(0);
        }
        let month = now.with_timezone(&settings.utc_offset).format("%Y-%m").to_string();
        let ids = {
            let mut tx = self.store.begin().await?;
            let ids = tx.users_with_manual_debt().await?;
            tx.commit().await?;
            ids
        };

        let mut blocked = Vec::new();
        for id in ids {
            let mut tx = self.store.begin().await?;
            let Some(mut user) = tx.lock_user(id).await? else {
                continue;
            };
            let eligible = user.manual_debt_mb > 0
                && (!user.is_blocked || is_auto_debt_block(user.blocked_reason.as_deref()));
            if !eligible {
                tx.rollback().await?;
                continue;
            }
            let before = user.snapshot();
            user.block(manual_eom_block_reason(user.manual_debt_mb, "eom_job"), None, now);
            user.updated_at = now;
            tx.update_user(&user).await?;
            let meta = MutationMeta::new("eom_job", format!("manual_eom_block:{month}"), now);
            quota::record_ledger(
                tx.as_mut(),
                &user,
                &before,
                &meta,
                json!({ "op": "manual_eom_block", "debt_mb": user.manual_debt_mb }),
            )
            .await;
            tx.commit().await?;
            info!(user = %user.id, debt_mb = user.manual_debt_mb, "manual debt unpaid at month end, user blocked");
            blocked.push(user);
        }

        for user in &blocked {
            if let Err(e) = self
                .sync
                .sync_user(SyncRequest::new(user.id).source("eom_job"))
                .await
            {
                warn!(user = %user.id, error = %e, "sync after month-end block failed");
            }
            if let Some(notifier) = &self.notifier {
                let mut params = BTreeMap::new();
                params.insert("debt_mb".to_owned(), user.manual_debt_mb.to_string());
                notifier
                    .notify_user(user, NotificationEvent::ManualDebtBlocked, params)
                    .await;
            }
        }
        Ok(blocked.len())
    }

    /// Quota and expiry reminders. A reminder is remembered only once it
    /// was actually sent, so skipped ones retry on the next run.
    pub async fn quota_notices(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let Some(notifier) = &self.notifier else {
            return Ok(0);
        };
        let settings = self.settings.current();
        let ids = {
            let mut tx = self.store.begin().await?;
            let ids = tx.active_user_ids().await?;
            tx.commit().await?;
            ids
        };

        let mut sent = 0;
        for id in ids {
            let user = {
                let mut tx = self.store.begin().await?;
                let user = tx.get_user(id).await?;
                tx.commit().await?;
                match user {
                    Some(u) if !u.is_blocked => u,
                    _ => continue,
                }
            };

            let mut quota_key = None;
            match quota_notice(&user, &settings.quota_notice_mb) {
                QuotaNotice::Send {
                    event,
                    key,
                    remaining_mb,
                } => {
                    let mut params = BTreeMap::new();
                    params.insert("remaining_mb".to_owned(), remaining_mb.to_string());
                    if notifier.notify_user(&user, event, params).await == DispatchOutcome::Sent {
                        sent += 1;
                        quota_key = Some(Some(key));
                    }
                }
                QuotaNotice::Clear => quota_key = Some(None),
                QuotaNotice::Nothing => {}
            }

            let mut expiry_sent = false;
            if expiry_notice_due(&user, settings.expiry_notice_days, now) {
                let mut params = BTreeMap::new();
                let expiry = user
                    .expiry
                    .map(|e| e.with_timezone(&settings.utc_offset).format("%d-%m-%Y %H:%M").to_string())
                    .unwrap_or_default();
                params.insert("expiry".to_owned(), expiry);
                if notifier
                    .notify_user(&user, NotificationEvent::ExpirySoon, params)
                    .await
                    == DispatchOutcome::Sent
                {
                    sent += 1;
                    expiry_sent = true;
                }
            }

            if quota_key.is_some() || expiry_sent {
                self.remember_notice(id, quota_key, expiry_sent, now).await?;
            }
        }
        debug!(sent, "reminders dispatched");
        Ok(sent)
    }

    async fn remember_notice(
        &self,
        id: UserId,
        quota_key: Option<Option<String>>,
        expiry_sent: bool,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.store.begin().await?;
        let Some(mut user) = tx.lock_user(id).await? else {
            return Ok(());
        };
        if let Some(key) = quota_key {
            user.last_quota_notice = key;
        }
        if expiry_sent {
            user.last_expiry_notice_at = Some(now);
        }
        user.updated_at = now;
        tx.update_user(&user).await?;
        tx.commit().await
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Owns the job tasks. Dropping without `shutdown` leaves them running
/// until the token is cancelled elsewhere.
#[derive(Debug)]
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(jobs: Arc<Jobs>, periods: &JobPeriods, cancel: CancellationToken) -> Self {
        let mut handles = Vec::new();
        for kind in JobKind::iter() {
            let Some(period) = periods.period(kind) else {
                debug!(job = %kind, "job disabled");
                continue;
            };
            handles.push(tokio::spawn(job_task(
                Arc::clone(&jobs),
                kind,
                period,
                cancel.child_token(),
            )));
        }
        info!(jobs = handles.len(), "scheduler started");
        Self { cancel, handles }
    }

    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every job and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn job_task(jobs: Arc<Jobs>, kind: JobKind, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                match jobs.run(kind).await {
                    Ok(summary) => debug!(job = %kind, %summary, "job finished"),
                    Err(e) => warn!(job = %kind, error = %e, "job failed"),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::normalize_to_e164;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn user(purchased: i64, used: i64) -> User {
        let mut u = User::new(normalize_to_e164("081234567890").unwrap(), "Sari", Utc::now());
        u.purchased_mb = purchased;
        u.used_mb = Decimal::from(used);
        u
    }

    #[test]
    fn quota_marks_fire_once_each() {
        let marks = [500, 100];
        let mut u = user(10_240, 9_800);
        let QuotaNotice::Send { key, remaining_mb, .. } = quota_notice(&u, &marks) else {
            panic!("expected a notice");
        };
        assert_eq!((key.as_str(), remaining_mb), ("low:500", 440));

        u.last_quota_notice = Some(key);
        assert_eq!(quota_notice(&u, &marks), QuotaNotice::Nothing);

        u.used_mb = Decimal::from(10_200);
        assert!(matches!(
            quota_notice(&u, &marks),
            QuotaNotice::Send { ref key, .. } if key == "low:100"
        ));

        u.used_mb = Decimal::from(10_300);
        assert!(matches!(
            quota_notice(&u, &marks),
            QuotaNotice::Send { event: NotificationEvent::QuotaHabis, .. }
        ));

        // new purchase lifts the user above every mark
        u.purchased_mb += 10_240;
        assert_eq!(quota_notice(&u, &marks), QuotaNotice::Clear);
    }

    #[test]
    fn unlimited_users_get_no_quota_notice() {
        let mut u = user(0, 50_000);
        u.is_unlimited = true;
        assert_eq!(quota_notice(&u, &[500]), QuotaNotice::Nothing);
    }

    #[test]
    fn expiry_reminder_once_per_expiry() {
        let now = Utc::now();
        let mut u = user(1_024, 0);
        u.expiry = Some(now + chrono::Duration::days(2));
        assert!(expiry_notice_due(&u, 3, now));
        u.last_expiry_notice_at = Some(now);
        assert!(!expiry_notice_due(&u, 3, now));

        // renewed: the old reminder predates the new window
        u.expiry = Some(now + chrono::Duration::days(32));
        assert!(!expiry_notice_due(&u, 3, now));
        assert!(expiry_notice_due(&u, 3, now + chrono::Duration::days(30)));
    }

    #[test]
    fn end_of_month_uses_local_date() {
        let wib = FixedOffset::east_opt(7 * 3600).unwrap();
        // 2026-03-31 20:00 UTC is already 1 April in WIB
        let t = Utc.with_ymd_and_hms(2026, 3, 31, 20, 0, 0).unwrap();
        assert!(!is_end_of_month(t, wib));
        assert!(is_end_of_month(t, FixedOffset::east_opt(0).unwrap()));
        let t = Utc.with_ymd_and_hms(2026, 2, 28, 10, 0, 0).unwrap();
        assert!(is_end_of_month(t, wib));
    }

    #[test]
    fn zero_period_disables_job() {
        let periods = JobPeriods {
            resync_all_secs: 0,
            ..JobPeriods::default()
        };
        assert_eq!(periods.period(JobKind::ResyncAll), None);
        assert_eq!(
            periods.period(JobKind::ReconcilePending),
            Some(Duration::from_secs(60))
        );
        assert_eq!(JobKind::EnforceManualDebt.to_string(), "enforce-manual-debt");
    }
}
