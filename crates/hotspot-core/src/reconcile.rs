// ── Transaction reconciliation ──
//
// Drives payment transactions through `unknown → pending → terminal` from
// four inputs: provider webhooks, status polls, user cancellation and the
// local expiry sweep. Every row change happens under the transaction row
// lock and is preceded by an appended event. A successful order then runs
// its effects, each behind an effect gate that makes it at-most-once per
// `(order_id, effect)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use strum::{AsRefStr, Display};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, ForbiddenStatus};
use crate::locks::{LockGuard, LockManager};
use crate::metrics::{self, SharedMetrics};
use crate::model::{
    ApprovalStatus, DebtId, EventSource, OrderKind, PackageId, Transaction, TransactionEvent,
    TransactionStatus, User, UserId, new_debt_order_id, new_package_order_id,
};
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::payment::{CheckoutRequest, PaymentProvider, ProviderStatus};
use crate::policy::{self, is_auto_debt_block, is_manual_eom_block};
use crate::quota::{self, MutationMeta};
use crate::settings::SettingsProvider;
use crate::store::{Store, StoreTx};
use crate::sync::{HotspotSync, SyncRequest};

/// Ledger source of effect markers.
pub const EFFECT_SOURCE: &str = "txn_effect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Effect {
    ApplyPackage,
    SettleDebt,
    HotspotSync,
}

/// Ledger idempotency key of an effect marker: `<order_id>:<effect>`.
pub fn effect_key(order_id: &str, effect: Effect) -> String {
    format!("{order_id}:{effect}")
}

/// Result of `begin_order_effect`. When `should_apply` is set the caller
/// holds `lock` (if any) until the effect has been written.
#[derive(Debug)]
pub struct EffectGate {
    pub should_apply: bool,
    pub lock: Option<LockGuard>,
}

impl EffectGate {
    fn skip() -> Self {
        Self {
            should_apply: false,
            lock: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EffectOutcome {
    Applied,
    Duplicate,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectReport {
    pub effect: Effect,
    #[serde(flatten)]
    pub outcome: EffectOutcome,
}

/// What one provider observation did to its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub order_id: String,
    pub previous: TransactionStatus,
    pub observed: TransactionStatus,
    pub status: TransactionStatus,
    pub transitioned: bool,
    pub effects: Vec<EffectReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IgnoreReason {
    InvalidSignature,
    UnknownOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Ignored { reason: IgnoreReason },
    Recorded(Observation),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Data carried from a money effect to the follow-up notification.
struct Settled {
    user: User,
    event: NotificationEvent,
    params: BTreeMap<String, String>,
}

/// Roll back a money effect. An existing marker means another delivery
/// applied it first.
async fn abort_effect(tx: Box<dyn StoreTx>, err: CoreError) -> Result<Option<Settled>, CoreError> {
    tx.rollback().await?;
    match err {
        CoreError::AlreadyApplied { .. } => Ok(None),
        other => Err(other),
    }
}

// ── Pure helpers ────────────────────────────────────────────────────

/// Price of `mb` of debt, rounded up to whole rupiah, never below 1.
pub fn debt_amount(mb: i64, price_per_gb: i64) -> i64 {
    let raw = mb.max(0).saturating_mul(price_per_gb.max(1));
    raw.saturating_add(1023).div_euclid(1024).max(1)
}

/// After a debt payment: lift auto-debt blocks, and end-of-month blocks
/// once no manual debt is left.
pub fn should_unblock_after_settlement(user: &User) -> bool {
    let reason = user.blocked_reason.as_deref();
    user.is_blocked
        && (is_auto_debt_block(reason) || (is_manual_eom_block(reason) && user.manual_debt_mb == 0))
}

/// Fold an observation into the row. Returns whether anything changed.
/// Terminal rows never change; a pending row may still pick up payment
/// details from a repeated pending notification.
pub fn apply_observation(txn: &mut Transaction, status: &ProviderStatus, now: DateTime<Utc>) -> bool {
    let next = status.status();
    let transition = txn.status.can_transition_to(next);
    let refresh = txn.status == TransactionStatus::Pending && next == TransactionStatus::Pending;
    if !transition && !refresh {
        return false;
    }

    if transition {
        txn.status = next;
    }
    if let Some(method) = &status.payment_type {
        txn.payment_method = Some(method.clone());
    }
    if let Some(va) = &status.va_number {
        txn.va_number = Some(va.clone());
    }
    if let Some(qr) = &status.qr_code_url {
        txn.qr_code_url = Some(qr.clone());
    }
    if let Some(expiry) = status.expiry_time {
        txn.expiry_time = Some(expiry);
    }
    if next == TransactionStatus::Success {
        txn.paid_at = Some(status.settlement_time.unwrap_or(now));
    }
    txn.raw_payload = Some(status.raw.clone());
    txn.updated_at = now;
    true
}

fn ensure_active(user: &User) -> Result<(), CoreError> {
    if user.is_active && user.approval_status == ApprovalStatus::Approved {
        Ok(())
    } else {
        Err(CoreError::forbidden(
            ForbiddenStatus::Inactive,
            "account is not active",
        ))
    }
}

// ── Engine ──────────────────────────────────────────────────────────

pub struct Reconciler {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    sync: HotspotSync,
    locks: Arc<LockManager>,
    settings: Arc<SettingsProvider>,
    metrics: SharedMetrics,
    notifier: Option<Arc<NotificationDispatcher>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provider", &self.provider.name())
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        sync: HotspotSync,
        locks: Arc<LockManager>,
        settings: Arc<SettingsProvider>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            provider,
            sync,
            locks,
            settings,
            metrics,
            notifier: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // ── Checkout ─────────────────────────────────────────────────────

    /// Create a package order and its hosted checkout.
    #[instrument(skip(self), fields(user = %user_id, package = %package_id))]
    pub async fn initiate_package_purchase(
        &self,
        user_id: UserId,
        package_id: PackageId,
    ) -> Result<Transaction, CoreError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", user_id))?;
        ensure_active(&user)?;
        if policy::is_network_hard_block_required(&user) {
            return Err(CoreError::forbidden(
                ForbiddenStatus::Blocked,
                "account is blocked",
            ));
        }
        let package = tx
            .get_package(package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| CoreError::not_found("package", package_id))?;
        tx.commit().await?;

        let txn = Transaction::new(
            user.id,
            Some(package.id),
            new_package_order_id(now),
            package.price,
            now,
        );
        self.checkout(txn, &user, package.name.clone()).await
    }

    /// Create a debt order: one manual debt item, or every outstanding debt
    /// when `debt` is `None`. Blocked users may pay.
    #[instrument(skip(self), fields(user = %user_id))]
    pub async fn initiate_debt_payment(
        &self,
        user_id: UserId,
        debt: Option<DebtId>,
    ) -> Result<Transaction, CoreError> {
        let now = Utc::now();
        let settings = self.settings.current();
        let mut tx = self.store.begin().await?;
        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", user_id))?;
        ensure_active(&user)?;

        let mb = match debt {
            Some(id) => {
                let item = tx
                    .lock_debt(id)
                    .await?
                    .filter(|d| d.user_id == user.id)
                    .ok_or_else(|| CoreError::not_found("debt", id))?;
                if item.is_paid {
                    return Err(CoreError::Conflict {
                        message: format!("debt {id} is already paid"),
                    });
                }
                item.remaining_mb()
            }
            None => quota::ceil_mb(user.quota_debt_total_mb()),
        };
        tx.commit().await?;
        if mb <= 0 {
            return Err(CoreError::validation("debt", "no outstanding debt"));
        }

        let txn = Transaction::new(
            user.id,
            None,
            new_debt_order_id(debt),
            debt_amount(mb, settings.debt_price_per_gb),
            now,
        );
        self.checkout(txn, &user, format!("Pelunasan tunggakan kuota {mb} MB"))
            .await
    }

    async fn checkout(
        &self,
        mut txn: Transaction,
        user: &User,
        item_name: String,
    ) -> Result<Transaction, CoreError> {
        let settings = self.settings.current();
        {
            let mut tx = self.store.begin().await?;
            tx.insert_transaction(&txn).await?;
            tx.insert_transaction_event(&TransactionEvent::new(
                txn.id,
                EventSource::App,
                "created",
                txn.status,
                Some(json!({ "amount": txn.amount, "item": item_name })),
                txn.created_at,
            ))
            .await?;
            tx.commit().await?;
        }

        let request = CheckoutRequest {
            order_id: txn.order_id.clone(),
            gross_amount: txn.amount,
            item_name,
            customer_name: user.full_name.clone(),
            customer_phone: user.phone.as_str().to_owned(),
            expiry_minutes: settings.payment_expiry_minutes,
        };
        let session = self.provider.create_checkout(&request).await;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        match session {
            Ok(session) => {
                txn.status = TransactionStatus::Pending;
                txn.snap_token = Some(session.token);
                txn.redirect_url = Some(session.redirect_url);
                txn.expiry_time =
                    Some(now + chrono::Duration::minutes(i64::from(settings.payment_expiry_minutes)));
                txn.updated_at = now;
                tx.update_transaction(&txn).await?;
                tx.insert_transaction_event(&TransactionEvent::new(
                    txn.id,
                    EventSource::App,
                    "checkout_created",
                    txn.status,
                    None,
                    now,
                ))
                .await?;
                tx.commit().await?;
                info!(order_id = %txn.order_id, amount = txn.amount, "checkout created");
                Ok(txn)
            }
            Err(e) => {
                txn.status = TransactionStatus::Failed;
                txn.updated_at = now;
                tx.update_transaction(&txn).await?;
                tx.insert_transaction_event(&TransactionEvent::new(
                    txn.id,
                    EventSource::App,
                    "checkout_failed",
                    txn.status,
                    Some(json!({ "error": e.to_string() })),
                    now,
                ))
                .await?;
                tx.commit().await?;
                warn!(order_id = %txn.order_id, error = %e, "checkout failed");
                Err(e)
            }
        }
    }

    // ── Queries & user actions ───────────────────────────────────────

    pub async fn get_by_order_id(&self, order_id: &str) -> Result<Transaction, CoreError> {
        let mut tx = self.store.begin().await?;
        let txn = tx.get_transaction(order_id).await?;
        tx.commit().await?;
        txn.ok_or_else(|| CoreError::not_found("transaction", order_id))
    }

    /// Poll the provider for an open order, then return the stored row.
    pub async fn refresh(&self, order_id: &str) -> Result<Transaction, CoreError> {
        let txn = self.get_by_order_id(order_id).await?;
        if txn.status.is_terminal() || txn.snap_token.is_none() {
            return Ok(txn);
        }
        match self.provider.status(order_id).await {
            Ok(status) => {
                self.observe(&status, EventSource::StatusPoll).await?;
            }
            Err(CoreError::NotFound { .. }) => {
                debug!(order_id, "order not known to provider yet");
            }
            Err(e) => warn!(order_id, error = %e, "status poll failed"),
        }
        self.get_by_order_id(order_id).await
    }

    /// Cancel an open order. `user_id` restricts the call to the owner.
    #[instrument(skip(self))]
    pub async fn cancel_by_user(
        &self,
        order_id: &str,
        user_id: Option<UserId>,
    ) -> Result<Transaction, CoreError> {
        let txn = self.get_by_order_id(order_id).await?;
        if user_id.is_some_and(|id| id != txn.user_id) {
            return Err(CoreError::not_found("transaction", order_id));
        }
        match txn.status {
            TransactionStatus::Cancelled => return Ok(txn),
            s if s.is_terminal() => {
                return Err(CoreError::Conflict {
                    message: format!("transaction {order_id} is already {s}"),
                });
            }
            _ => {}
        }

        if txn.snap_token.is_none() {
            self.close_locally(order_id, TransactionStatus::Cancelled, "user_cancel")
                .await?;
        } else {
            match self.provider.cancel(order_id).await {
                Ok(status) => {
                    self.observe(&status, EventSource::App).await?;
                }
                Err(CoreError::NotFound { .. }) => {
                    self.close_locally(order_id, TransactionStatus::Cancelled, "user_cancel")
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        self.get_by_order_id(order_id).await
    }

    // ── Provider inputs ──────────────────────────────────────────────

    /// Handle a provider notification body. Bad signatures and unknown
    /// orders are ignored; only a malformed body is an error.
    #[instrument(skip_all)]
    pub async fn handle_webhook(&self, payload: serde_json::Value) -> Result<WebhookOutcome, CoreError> {
        let status = ProviderStatus::from_json(payload)?;
        if !self.provider.verify_notification(&status) {
            self.metrics
                .increment_labeled(metrics::WEBHOOK_INVALID_SIGNATURE, self.provider.name());
            warn!(order_id = %status.order_id, "webhook signature mismatch, ignored");
            return Ok(WebhookOutcome::Ignored {
                reason: IgnoreReason::InvalidSignature,
            });
        }
        match self.observe(&status, EventSource::Webhook).await {
            Ok(observation) => Ok(WebhookOutcome::Recorded(observation)),
            Err(CoreError::NotFound { .. }) => {
                warn!(order_id = %status.order_id, "webhook for unknown order, ignored");
                Ok(WebhookOutcome::Ignored {
                    reason: IgnoreReason::UnknownOrder,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Record an observation, move the row forward when allowed, and run
    /// the success effects for a successful order.
    pub async fn observe(
        &self,
        status: &ProviderStatus,
        source: EventSource,
    ) -> Result<Observation, CoreError> {
        let now = Utc::now();
        let observed = status.status();

        let mut tx = self.store.begin().await?;
        let Some(mut txn) = tx.lock_transaction(&status.order_id).await? else {
            tx.rollback().await?;
            return Err(CoreError::not_found("transaction", &status.order_id));
        };
        let previous = txn.status;
        let event_type = if status.transaction_status.is_empty() {
            "unknown".to_owned()
        } else {
            status.transaction_status.to_ascii_lowercase()
        };
        tx.insert_transaction_event(&TransactionEvent::new(
            txn.id,
            source,
            event_type,
            observed,
            Some(status.raw.clone()),
            now,
        ))
        .await?;
        if apply_observation(&mut txn, status, now) {
            tx.update_transaction(&txn).await?;
        }
        tx.commit().await?;

        if previous != txn.status {
            info!(order_id = %txn.order_id, from = %previous, to = %txn.status, %source, "transaction moved");
        }

        let mut effects = Vec::new();
        if observed == TransactionStatus::Success {
            if txn.status == TransactionStatus::Success {
                effects = self.run_effects(&txn).await;
            } else {
                warn!(order_id = %txn.order_id, status = %txn.status, "payment settled after the order closed");
                self.alert(&format!(
                    "Payment for {} settled after the order was {}; manual review needed.",
                    txn.order_id, txn.status
                ))
                .await;
            }
        }

        Ok(Observation {
            order_id: txn.order_id,
            previous,
            observed,
            status: txn.status,
            transitioned: previous != txn.status,
            effects,
        })
    }

    /// Poll open orders older than `grace`.
    pub async fn reconcile_pending(&self, grace: Duration) -> Result<PendingSummary, CoreError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let open = {
            let mut tx = self.store.begin().await?;
            let open = tx.open_transactions(cutoff).await?;
            tx.commit().await?;
            open
        };

        let mut summary = PendingSummary::default();
        for txn in open.into_iter().filter(|t| t.snap_token.is_some()) {
            summary.checked += 1;
            match self.provider.status(&txn.order_id).await {
                Ok(status) => match self.observe(&status, EventSource::StatusPoll).await {
                    Ok(obs) if obs.transitioned => summary.updated += 1,
                    Ok(_) => {}
                    Err(e) => {
                        summary.failed += 1;
                        warn!(order_id = %txn.order_id, error = %e, "recording polled status failed");
                    }
                },
                Err(CoreError::NotFound { .. }) => {
                    debug!(order_id = %txn.order_id, "order not known to provider");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(order_id = %txn.order_id, error = %e, "status poll failed");
                }
            }
        }
        if summary.checked > 0 {
            info!(checked = summary.checked, updated = summary.updated, failed = summary.failed, "pending reconciliation done");
        }
        Ok(summary)
    }

    /// Close open orders whose payment window has passed. Orders known to
    /// the provider are polled first so a settled payment is never expired.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let window = chrono::Duration::minutes(i64::from(self.settings.current().payment_expiry_minutes));
        let open = {
            let mut tx = self.store.begin().await?;
            let open = tx.open_transactions(now).await?;
            tx.commit().await?;
            open
        };

        let mut expired = 0;
        for txn in open {
            let deadline = txn.expiry_time.unwrap_or(txn.created_at + window);
            if deadline > now {
                continue;
            }
            if txn.snap_token.is_some() {
                match self.provider.status(&txn.order_id).await {
                    Ok(status) if status.status().is_terminal() => {
                        self.observe(&status, EventSource::StatusPoll).await?;
                        continue;
                    }
                    Ok(_) | Err(CoreError::NotFound { .. }) => {}
                    Err(e) => {
                        warn!(order_id = %txn.order_id, error = %e, "status check before expiry failed, retrying later");
                        continue;
                    }
                }
            }
            if self
                .close_locally(&txn.order_id, TransactionStatus::Expired, "expired_locally")
                .await?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "expired stale orders");
        }
        Ok(expired)
    }

    async fn close_locally(
        &self,
        order_id: &str,
        status: TransactionStatus,
        event_type: &str,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let Some(mut txn) = tx.lock_transaction(order_id).await? else {
            tx.rollback().await?;
            return Err(CoreError::not_found("transaction", order_id));
        };
        if !txn.status.can_transition_to(status) {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.insert_transaction_event(&TransactionEvent::new(
            txn.id,
            EventSource::App,
            event_type,
            status,
            None,
            now,
        ))
        .await?;
        txn.status = status;
        txn.updated_at = now;
        tx.update_transaction(&txn).await?;
        tx.commit().await?;
        info!(order_id, %status, "transaction closed locally");
        Ok(true)
    }

    // ── Effects ──────────────────────────────────────────────────────

    /// Take the effect lock, then check the durable marker. Re-entry
    /// yields `should_apply = false` and counts a duplicate.
    pub async fn begin_order_effect(
        &self,
        user_id: UserId,
        order_id: &str,
        effect: Effect,
    ) -> Result<EffectGate, CoreError> {
        let key = effect_key(order_id, effect);
        let ttl = self.settings.current().effect_lock_ttl;
        let Some(lock) = self.locks.try_lock(&format!("{EFFECT_SOURCE}:{key}"), ttl).await else {
            self.duplicate(order_id, effect);
            return Ok(EffectGate::skip());
        };

        let mut tx = self.store.begin().await?;
        let marker = tx.ledger_entry(user_id, EFFECT_SOURCE, &key).await?;
        tx.commit().await?;
        if marker.is_some() {
            lock.release().await;
            self.duplicate(order_id, effect);
            return Ok(EffectGate::skip());
        }
        Ok(EffectGate {
            should_apply: true,
            lock: Some(lock),
        })
    }

    fn duplicate(&self, order_id: &str, effect: Effect) {
        self.metrics.increment(metrics::WEBHOOK_DUPLICATE);
        debug!(order_id, %effect, "effect already applied or in progress");
    }

    async fn run_effects(&self, txn: &Transaction) -> Vec<EffectReport> {
        let kind = match txn.order_kind() {
            Ok(kind) => kind,
            Err(e) => {
                let effect = Effect::SettleDebt;
                return vec![self.effect_failed(txn, effect, &e)];
            }
        };
        let money = if kind.is_debt() {
            Effect::SettleDebt
        } else {
            Effect::ApplyPackage
        };

        let mut reports = Vec::with_capacity(2);
        let settled = match self.begin_order_effect(txn.user_id, &txn.order_id, money).await {
            Ok(gate) if gate.should_apply => {
                let result = match kind {
                    OrderKind::Package => self.apply_package_effect(txn).await,
                    OrderKind::DebtItem(_) | OrderKind::DebtAggregate => {
                        self.settle_debt_effect(txn, kind).await
                    }
                };
                if let Some(lock) = gate.lock {
                    lock.release().await;
                }
                match result {
                    Ok(Some(settled)) => {
                        reports.push(EffectReport {
                            effect: money,
                            outcome: EffectOutcome::Applied,
                        });
                        Some(settled)
                    }
                    Ok(None) => {
                        self.duplicate(&txn.order_id, money);
                        reports.push(EffectReport {
                            effect: money,
                            outcome: EffectOutcome::Duplicate,
                        });
                        None
                    }
                    Err(e) => {
                        reports.push(self.effect_failed(txn, money, &e));
                        return reports;
                    }
                }
            }
            Ok(_) => {
                reports.push(EffectReport {
                    effect: money,
                    outcome: EffectOutcome::Duplicate,
                });
                None
            }
            Err(e) => {
                reports.push(self.effect_failed(txn, money, &e));
                return reports;
            }
        };

        reports.push(self.sync_effect(txn).await);

        if let Some(settled) = settled {
            if let Some(notifier) = &self.notifier {
                notifier
                    .notify_user(&settled.user, settled.event, settled.params)
                    .await;
            }
        }
        reports
    }

    async fn apply_package_effect(&self, txn: &Transaction) -> Result<Option<Settled>, CoreError> {
        let now = Utc::now();
        let key = effect_key(&txn.order_id, Effect::ApplyPackage);
        let package_id = txn.package_id.ok_or_else(|| {
            CoreError::Internal(format!("package order {} has no package", txn.order_id))
        })?;

        let mut tx = self.store.begin().await?;
        let mut user = tx
            .lock_user(txn.user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", txn.user_id))?;
        // re-check under the row lock
        if tx.ledger_entry(user.id, EFFECT_SOURCE, &key).await?.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }
        let package = tx
            .get_package(package_id)
            .await?
            .ok_or_else(|| CoreError::not_found("package", package_id))?;
        let meta = MutationMeta::new(EFFECT_SOURCE, key, now).as_marker();
        if let Err(e) = quota::apply_package(tx.as_mut(), &mut user, &package, &meta).await {
            return abort_effect(tx, e).await;
        }
        tx.commit().await?;

        let offset = self.settings.current().utc_offset;
        let mut params = BTreeMap::new();
        params.insert("order_id".to_owned(), txn.order_id.clone());
        params.insert("package".to_owned(), package.name.clone());
        params.insert(
            "expiry".to_owned(),
            user.expiry
                .map(|e| e.with_timezone(&offset).format("%d-%m-%Y %H:%M").to_string())
                .unwrap_or_default(),
        );
        Ok(Some(Settled {
            user,
            event: NotificationEvent::PaymentSuccess,
            params,
        }))
    }

    async fn settle_debt_effect(
        &self,
        txn: &Transaction,
        kind: OrderKind,
    ) -> Result<Option<Settled>, CoreError> {
        let now = Utc::now();
        let key = effect_key(&txn.order_id, Effect::SettleDebt);

        let mut tx = self.store.begin().await?;
        let mut user = tx
            .lock_user(txn.user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", txn.user_id))?;
        if tx.ledger_entry(user.id, EFFECT_SOURCE, &key).await?.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }
        let meta = MutationMeta::new(EFFECT_SOURCE, key, now).as_marker();
        let settled = match kind {
            OrderKind::DebtItem(id) => {
                quota::settle_manual_debt_item_to_zero(tx.as_mut(), &mut user, id, &meta).await
            }
            OrderKind::DebtAggregate => quota::clear_all_debts_to_zero(tx.as_mut(), &mut user, &meta)
                .await
                .map(|cleared| cleared.auto_paid_mb + cleared.manual.paid_mb),
            OrderKind::Package => Err(CoreError::Internal(format!(
                "order {} is not a debt order",
                txn.order_id
            ))),
        };
        let paid_mb = match settled {
            Ok(mb) => mb,
            Err(e) => return abort_effect(tx, e).await,
        };

        if should_unblock_after_settlement(&user) {
            let before = user.snapshot();
            let reason = user.blocked_reason.clone();
            user.unblock();
            user.updated_at = now;
            tx.update_user(&user).await?;
            let unblock = MutationMeta::new(EFFECT_SOURCE, format!("{}:unblock", txn.order_id), now);
            quota::record_ledger(
                tx.as_mut(),
                &user,
                &before,
                &unblock,
                json!({ "op": "unblock_after_debt_payment", "previous_reason": reason }),
            )
            .await;
            info!(user = %user.id, order_id = %txn.order_id, "debt settled, user unblocked");
        }
        tx.commit().await?;

        let mut params = BTreeMap::new();
        params.insert("order_id".to_owned(), txn.order_id.clone());
        params.insert("paid_mb".to_owned(), paid_mb.to_string());
        Ok(Some(Settled {
            user,
            event: NotificationEvent::DebtSettled,
            params,
        }))
    }

    async fn sync_effect(&self, txn: &Transaction) -> EffectReport {
        let effect = Effect::HotspotSync;
        let gate = match self.begin_order_effect(txn.user_id, &txn.order_id, effect).await {
            Ok(gate) => gate,
            Err(e) => return self.effect_failed(txn, effect, &e),
        };
        if !gate.should_apply {
            return EffectReport {
                effect,
                outcome: EffectOutcome::Duplicate,
            };
        }

        let result = self.sync_and_mark(txn).await;
        if let Some(lock) = gate.lock {
            lock.release().await;
        }
        match result {
            Ok(()) => EffectReport {
                effect,
                outcome: EffectOutcome::Applied,
            },
            Err(e) => self.effect_failed(txn, effect, &e),
        }
    }

    /// Sync, then write the marker. A partial sync still counts as done;
    /// an aborted one leaves no marker so the next delivery retries.
    async fn sync_and_mark(&self, txn: &Transaction) -> Result<(), CoreError> {
        let report = self
            .sync
            .sync_user(SyncRequest::new(txn.user_id).source("payment"))
            .await?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let user = tx
            .get_user(txn.user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", txn.user_id))?;
        let meta = MutationMeta::new(EFFECT_SOURCE, effect_key(&txn.order_id, Effect::HotspotSync), now);
        let marked = quota::record_marker(
            tx.as_mut(),
            &user,
            &user.snapshot(),
            &meta,
            json!({
                "op": "hotspot_sync",
                "status": report.status_token(),
                "access_status": report.status,
                "profile": report.profile,
            }),
        )
        .await;
        match marked {
            Ok(()) | Err(CoreError::AlreadyApplied { .. }) => tx.commit().await,
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    fn effect_failed(&self, txn: &Transaction, effect: Effect, error: &CoreError) -> EffectReport {
        self.metrics.increment_labeled(metrics::EFFECT_FAILED, effect.as_ref());
        warn!(order_id = %txn.order_id, %effect, error = %error, "order effect failed");
        EffectReport {
            effect,
            outcome: EffectOutcome::Failed {
                error: error.to_string(),
            },
        }
    }

    async fn alert(&self, message: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.alert_admins(message).await;
        }
    }
}
