#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hotspot_core::error::CoreError;
use hotspot_core::jobs::JobKind;
use hotspot_core::locks::LockManager;
use hotspot_core::metrics::InMemoryMetrics;
use hotspot_core::model::normalize_to_e164;
use hotspot_core::notify::{Channel, NotificationDispatcher, TemplateSet, Transport};
use hotspot_core::policy::{AccessStatus, auto_debt_block_reason, is_manual_eom_block};
use hotspot_core::settings::Settings;
use hotspot_routeros::{BindingType, BreakerConfig};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;

use common::{Harness, harness, harness_full};

#[derive(Debug, Default)]
struct Outbox {
    down: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Transport for Outbox {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), CoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CoreError::Messaging {
                message: "device offline".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_owned(), text.to_owned()));
        Ok(())
    }
}

fn notifying_harness() -> (Harness, Arc<Outbox>) {
    let outbox = Arc::new(Outbox::default());
    let breaker = BreakerConfig {
        failure_threshold: 100,
        reset_timeout: Duration::from_secs(60),
        half_open_successes: 1,
    };
    let metrics = Arc::new(InMemoryMetrics::new());
    let dispatcher = NotificationDispatcher::new(TemplateSet::default(), metrics)
        .with_transport(Arc::clone(&outbox) as Arc<dyn Transport>, breaker);
    let h = harness_full(Settings::default(), LockManager::local(), Some(Arc::new(dispatcher)));
    (h, outbox)
}

fn second_phone(u: &mut hotspot_core::model::User, local: &str) {
    u.phone = normalize_to_e164(local).unwrap();
    u.hotspot_username = u.phone.localized();
}

// ── Month-end manual debt ───────────────────────────────────────────

#[tokio::test]
async fn month_end_blocks_only_unblocked_debtors() {
    let h = harness();
    let debtor = h.user_with(|u| u.manual_debt_mb = 500).await;
    h.device(&debtor, "AA:BB:CC:DD:EE:01", "172.16.2.10").await;
    let clean = h.user_with(|u| second_phone(u, "081200000001")).await;
    let admin_blocked = h
        .user_with(|u| {
            second_phone(u, "081200000002");
            u.manual_debt_mb = 300;
            u.block("admin|abuse", None, Utc::now());
        })
        .await;

    let blocked = h.portal.jobs().enforce_manual_debt(Utc::now(), true).await.unwrap();
    assert_eq!(blocked, 1);

    let debtor = h.reload(&debtor).await;
    assert!(debtor.is_blocked);
    assert!(is_manual_eom_block(debtor.blocked_reason.as_deref()));
    // month-end blocks are enforced on the router as well
    assert_eq!(
        h.router.binding_for("AA:BB:CC:DD:EE:01").unwrap().binding_type,
        BindingType::Blocked
    );
    assert!(!h.reload(&clean).await.is_blocked);
    assert_eq!(
        h.reload(&admin_blocked).await.blocked_reason.as_deref(),
        Some("admin|abuse")
    );

    let again = h.portal.jobs().enforce_manual_debt(Utc::now(), true).await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn month_end_job_waits_for_last_local_day() {
    let h = harness();
    let debtor = h.user_with(|u| u.manual_debt_mb = 500).await;

    let mid_month = Utc.with_ymd_and_hms(2026, 3, 15, 5, 0, 0).unwrap();
    assert_eq!(h.portal.jobs().enforce_manual_debt(mid_month, false).await.unwrap(), 0);
    assert!(!h.reload(&debtor).await.is_blocked);

    // 31 March 12:00 local (UTC+7)
    let last_day = Utc.with_ymd_and_hms(2026, 3, 31, 5, 0, 0).unwrap();
    assert_eq!(h.portal.jobs().enforce_manual_debt(last_day, false).await.unwrap(), 1);
}

#[tokio::test]
async fn month_end_upgrades_auto_debt_block() {
    let h = harness();
    let user = h
        .user_with(|u| {
            u.manual_debt_mb = 200;
            u.block(auto_debt_block_reason(Decimal::from(700), 500, "sync"), None, Utc::now());
        })
        .await;

    assert_eq!(h.portal.jobs().enforce_manual_debt(Utc::now(), true).await.unwrap(), 1);
    let user = h.reload(&user).await;
    assert!(is_manual_eom_block(user.blocked_reason.as_deref()));
}

// ── Reminders ───────────────────────────────────────────────────────

#[tokio::test]
async fn quota_reminders_fire_once_per_mark() {
    let (h, outbox) = notifying_harness();
    let mut user = h.user_with(|u| u.used_mb = Decimal::from(9_840)).await;
    let jobs = h.portal.jobs();

    assert_eq!(jobs.quota_notices(Utc::now()).await.unwrap(), 1);
    assert_eq!(h.reload(&user).await.last_quota_notice.as_deref(), Some("low:500"));
    assert_eq!(jobs.quota_notices(Utc::now()).await.unwrap(), 0);

    user = h.reload(&user).await;
    user.used_mb = Decimal::from(10_200);
    h.update(&user).await;
    assert_eq!(jobs.quota_notices(Utc::now()).await.unwrap(), 1);
    assert_eq!(h.reload(&user).await.last_quota_notice.as_deref(), Some("low:100"));

    let sent = outbox.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(to, _)| to == "+6281234567890"));
    assert!(sent[1].1.contains("40 MB"), "{}", sent[1].1);
}

#[tokio::test]
async fn failed_reminder_is_retried() {
    let (h, outbox) = notifying_harness();
    let user = h.user_with(|u| u.used_mb = Decimal::from(10_240)).await;
    outbox.down.store(true, Ordering::SeqCst);

    assert_eq!(h.portal.jobs().quota_notices(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.reload(&user).await.last_quota_notice, None);

    outbox.down.store(false, Ordering::SeqCst);
    assert_eq!(h.portal.jobs().quota_notices(Utc::now()).await.unwrap(), 1);
    assert_eq!(h.reload(&user).await.last_quota_notice.as_deref(), Some("habis"));
}

#[tokio::test]
async fn expiry_reminder_is_sent_once() {
    let (h, outbox) = notifying_harness();
    let user = h
        .user_with(|u| u.expiry = Some(Utc::now() + chrono::Duration::days(2)))
        .await;
    let jobs = h.portal.jobs();

    assert_eq!(jobs.quota_notices(Utc::now()).await.unwrap(), 1);
    assert!(h.reload(&user).await.last_expiry_notice_at.is_some());
    assert_eq!(jobs.quota_notices(Utc::now()).await.unwrap(), 0);
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn blocked_users_get_no_reminders() {
    let (h, outbox) = notifying_harness();
    h.user_with(|u| {
        u.used_mb = Decimal::from(10_240);
        u.block("admin|abuse", None, Utc::now());
    })
    .await;

    assert_eq!(h.portal.jobs().quota_notices(Utc::now()).await.unwrap(), 0);
    assert!(outbox.sent.lock().unwrap().is_empty());
}

// ── Runner ──────────────────────────────────────────────────────────

#[tokio::test]
async fn job_runs_report_json_summaries() {
    let h = harness();
    h.user().await;
    let jobs = h.portal.jobs();

    let resync = jobs.run(JobKind::ResyncAll).await.unwrap();
    insta::assert_json_snapshot!(resync, @r#"
    {
      "failed": 0,
      "partial": 0,
      "synced": 1
    }
    "#);

    let sweep = jobs.run(JobKind::ExpireSweep).await.unwrap();
    insta::assert_json_snapshot!(sweep, @r#"
    {
      "expired": 0
    }
    "#);

    // no dispatcher configured
    let notices = jobs.run(JobKind::QuotaNotices).await.unwrap();
    assert_eq!(notices["sent"], 0);
}

#[tokio::test]
async fn resync_job_projects_every_active_user() {
    let h = harness();
    let active = h.user().await;
    let expired = h
        .user_with(|u| {
            second_phone(u, "081200000003");
            u.expiry = Some(Utc::now() - chrono::Duration::days(1));
        })
        .await;

    h.portal.jobs().run(JobKind::ResyncAll).await.unwrap();
    assert_eq!(h.router.profile_of(&active.hotspot_username).as_deref(), Some("active"));
    assert_eq!(h.router.profile_of(&expired.hotspot_username).as_deref(), Some("expired"));
    assert_eq!(
        hotspot_core::policy::access_status(
            &h.reload(&expired).await,
            &h.portal.settings().current().policy,
            Utc::now()
        ),
        AccessStatus::Expired
    );
}

#[tokio::test]
async fn portal_start_is_idempotent_and_shutdown_stops_jobs() {
    let h = harness();
    let cancel = h.portal.cancellation();

    h.portal.start().await;
    h.portal.start().await;
    assert!(!cancel.is_cancelled());

    tokio::time::timeout(Duration::from_secs(5), h.portal.shutdown())
        .await
        .unwrap();
    assert!(cancel.is_cancelled());
}
