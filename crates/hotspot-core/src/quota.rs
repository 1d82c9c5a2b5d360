// ── Quota & debt ledger ──
//
// Mutations of purchased quota, usage and debts. Every operation expects the
// user row to be locked by the caller's transaction (`StoreTx::lock_user`),
// persists the user and appends one ledger row carrying before/after
// snapshots. Ledger failures never abort the mutation itself, unless the
// row is an effect marker.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::{DebtId, LedgerEntry, Package, QuotaSnapshot, User, UserId, UserQuotaDebt};
use crate::store::{LedgerAppend, StoreTx};

/// Who triggered a mutation and the key that makes it idempotent.
#[derive(Debug, Clone)]
pub struct MutationMeta {
    pub source: String,
    pub idempotency_key: String,
    pub actor: Option<UserId>,
    pub now: DateTime<Utc>,
    /// The ledger row doubles as an order-effect marker and must land in
    /// the same transaction as the mutation.
    pub marker: bool,
}

impl MutationMeta {
    pub fn new(source: impl Into<String>, idempotency_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            idempotency_key: idempotency_key.into(),
            actor: None,
            now,
            marker: false,
        }
    }

    /// Make the ledger append part of the mutation: a failed append is
    /// returned as an error, an existing row as [`CoreError::AlreadyApplied`].
    #[must_use]
    pub fn as_marker(mut self) -> Self {
        self.marker = true;
        self
    }

    #[must_use]
    pub fn by(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManualPayment {
    pub paid_mb: i64,
    pub closed: Vec<DebtId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InjectionOutcome {
    pub auto_paid_mb: i64,
    pub manual_paid_mb: i64,
    pub residual_mb: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DebtClearance {
    pub auto_paid_mb: i64,
    pub manual: ManualPayment,
}

// ── Operations ──────────────────────────────────────────────────────

/// Credit a purchased package.
pub async fn apply_package(
    tx: &mut dyn StoreTx,
    user: &mut User,
    package: &Package,
    meta: &MutationMeta,
) -> Result<(), CoreError> {
    let before = user.snapshot();
    let now = meta.now;

    if package.is_unlimited() {
        user.is_unlimited = true;
        user.purchased_mb = 0;
    } else {
        // a lapsed unlimited period does not survive a quota purchase
        if user.is_unlimited && user.expiry.is_none_or(|e| e < now) {
            user.is_unlimited = false;
        }
        user.purchased_mb = user.purchased_mb.saturating_add(package.quota_mb());
    }

    let base = user.expiry.map_or(now, |e| e.max(now));
    user.expiry = Some(base + Duration::days(package.duration_days));
    ensure_hotspot_password(user);
    normalize_offset(user);

    let details = json!({
        "op": "apply_package",
        "package_id": package.id,
        "package_name": package.name,
        "quota_mb": package.quota_mb(),
        "duration_days": package.duration_days,
        "unlimited": package.is_unlimited(),
    });
    persist(tx, user, &before, meta, details).await?;
    info!(user = %user.id, package = %package.name, "package applied");
    Ok(())
}

pub async fn add_manual_debt(
    tx: &mut dyn StoreTx,
    user: &mut User,
    amount_mb: i64,
    debt_date: Option<NaiveDate>,
    note: Option<String>,
    meta: &MutationMeta,
) -> Result<UserQuotaDebt, CoreError> {
    if amount_mb <= 0 {
        return Err(CoreError::validation("amount_mb", "debt amount must be positive"));
    }
    let before = user.snapshot();
    let debt = UserQuotaDebt {
        id: DebtId::new(),
        user_id: user.id,
        debt_date,
        amount_mb,
        paid_mb: 0,
        is_paid: false,
        created_by: meta.actor,
        note,
        last_paid_source: None,
        paid_at: None,
        created_at: meta.now,
    };
    tx.insert_debt(&debt).await?;
    user.manual_debt_mb = user.manual_debt_mb.saturating_add(amount_mb);

    let details = json!({ "op": "add_manual_debt", "debt_id": debt.id, "amount_mb": amount_mb });
    persist(tx, user, &before, meta, details).await?;
    Ok(debt)
}

/// Pay open manual debt items oldest first; partial payments allowed.
pub async fn apply_manual_debt_payment(
    tx: &mut dyn StoreTx,
    user: &mut User,
    pay_mb: i64,
    meta: &MutationMeta,
) -> Result<ManualPayment, CoreError> {
    if pay_mb <= 0 {
        return Ok(ManualPayment::default());
    }
    let before = user.snapshot();
    let payment = pay_manual_oldest_first(tx, user, pay_mb, meta).await?;
    let details = json!({ "op": "manual_debt_payment", "requested_mb": pay_mb, "result": payment });
    persist(tx, user, &before, meta, details).await?;
    Ok(payment)
}

/// Pay the remainder of a single debt item. Returns the MB applied.
pub async fn settle_manual_debt_item_to_zero(
    tx: &mut dyn StoreTx,
    user: &mut User,
    debt_id: DebtId,
    meta: &MutationMeta,
) -> Result<i64, CoreError> {
    let mut debt = tx
        .lock_debt(debt_id)
        .await?
        .filter(|d| d.user_id == user.id)
        .ok_or_else(|| CoreError::not_found("debt", debt_id))?;

    let before = user.snapshot();
    let applied = debt.pay(debt.remaining_mb(), &meta.source, meta.now);
    if applied > 0 {
        tx.update_debt(&debt).await?;
        user.manual_debt_mb = (user.manual_debt_mb - applied).max(0);
    }

    let details = json!({ "op": "settle_debt_item", "debt_id": debt_id, "paid_mb": applied });
    persist(tx, user, &before, meta, details).await?;
    Ok(applied)
}

/// Cover the current auto-debt by raising purchased quota. Returns MB added.
pub async fn settle_auto_debt_to_zero(
    tx: &mut dyn StoreTx,
    user: &mut User,
    meta: &MutationMeta,
) -> Result<i64, CoreError> {
    let before = user.snapshot();
    let added = raise_purchased_for_auto_debt(user);
    let details = json!({ "op": "settle_auto_debt", "added_mb": added });
    persist(tx, user, &before, meta, details).await?;
    Ok(added)
}

/// Spend injected quota on debts: auto first, then manual oldest first.
/// Whatever is left becomes purchased quota.
pub async fn consume_injected_mb_for_debt(
    tx: &mut dyn StoreTx,
    user: &mut User,
    injected_mb: i64,
    meta: &MutationMeta,
) -> Result<InjectionOutcome, CoreError> {
    let before = user.snapshot();
    let mut left = injected_mb.max(0);

    let auto_paid = if user.is_unlimited {
        0
    } else {
        ceil_mb(user.quota_debt_auto_mb()).min(left)
    };
    user.purchased_mb = user.purchased_mb.saturating_add(auto_paid);
    left -= auto_paid;

    let manual = pay_manual_oldest_first(tx, user, left, meta).await?;
    left -= manual.paid_mb;

    user.purchased_mb = user.purchased_mb.saturating_add(left);
    normalize_offset(user);

    let outcome = InjectionOutcome {
        auto_paid_mb: auto_paid,
        manual_paid_mb: manual.paid_mb,
        residual_mb: left,
    };
    let details = json!({
        "op": "inject_quota",
        "injected_mb": injected_mb,
        "result": outcome,
        "closed_debts": manual.closed,
    });
    persist(tx, user, &before, meta, details).await?;
    Ok(outcome)
}

/// Settle every debt. Unlimited users have no auto-debt to settle.
pub async fn clear_all_debts_to_zero(
    tx: &mut dyn StoreTx,
    user: &mut User,
    meta: &MutationMeta,
) -> Result<DebtClearance, CoreError> {
    let before = user.snapshot();
    let auto_paid_mb = if user.is_unlimited {
        0
    } else {
        raise_purchased_for_auto_debt(user)
    };
    let manual = pay_manual_oldest_first(tx, user, i64::MAX, meta).await?;
    let clearance = DebtClearance { auto_paid_mb, manual };
    let details = json!({ "op": "clear_all_debts", "result": clearance });
    persist(tx, user, &before, meta, details).await?;
    Ok(clearance)
}

/// Waive auto-debt without touching usage. Returns the MB forgiven.
pub async fn forgive_auto_debt(
    tx: &mut dyn StoreTx,
    user: &mut User,
    mb: i64,
    meta: &MutationMeta,
) -> Result<i64, CoreError> {
    if mb <= 0 {
        return Err(CoreError::validation("mb", "forgiven amount must be positive"));
    }
    let before = user.snapshot();
    let forgiven = ceil_mb(user.quota_debt_auto_mb()).min(mb);
    user.auto_debt_offset_mb = user.auto_debt_offset_mb.saturating_add(forgiven);
    normalize_offset(user);
    let details = json!({ "op": "forgive_auto_debt", "requested_mb": mb, "forgiven_mb": forgiven });
    persist(tx, user, &before, meta, details).await?;
    Ok(forgiven)
}

/// Overwrite usage from router counters.
pub async fn record_usage(
    tx: &mut dyn StoreTx,
    user: &mut User,
    used_mb: Decimal,
    meta: &MutationMeta,
) -> Result<(), CoreError> {
    if used_mb.is_sign_negative() {
        return Err(CoreError::validation("used_mb", "usage cannot be negative"));
    }
    let before = user.snapshot();
    user.used_mb = used_mb;
    normalize_offset(user);
    let details = json!({ "op": "record_usage", "used_mb": used_mb });
    persist(tx, user, &before, meta, details).await
}

// ── Ledger ──────────────────────────────────────────────────────────

fn ledger_entry(
    user: &User,
    before: &QuotaSnapshot,
    meta: &MutationMeta,
    details: serde_json::Value,
) -> LedgerEntry {
    LedgerEntry::new(
        user.id,
        meta.actor,
        &meta.source,
        &meta.idempotency_key,
        before,
        &user.snapshot(),
        details,
        meta.now,
    )
}

/// Append a ledger row for an already-persisted mutation. Duplicates are
/// expected on replays; any other failure is logged and swallowed.
pub async fn record_ledger(
    tx: &mut dyn StoreTx,
    user: &User,
    before: &QuotaSnapshot,
    meta: &MutationMeta,
    details: serde_json::Value,
) {
    let entry = ledger_entry(user, before, meta, details);
    match tx.append_ledger(&entry).await {
        Ok(LedgerAppend::Inserted) => {}
        Ok(LedgerAppend::Duplicate) => debug!(
            user = %user.id,
            source = %meta.source,
            key = %meta.idempotency_key,
            "ledger entry already recorded"
        ),
        Err(e) => warn!(
            user = %user.id,
            source = %meta.source,
            key = %meta.idempotency_key,
            error = %e,
            "ledger append failed"
        ),
    }
}

/// Strict append for effect markers. The caller must roll back on error.
pub async fn record_marker(
    tx: &mut dyn StoreTx,
    user: &User,
    before: &QuotaSnapshot,
    meta: &MutationMeta,
    details: serde_json::Value,
) -> Result<(), CoreError> {
    let entry = ledger_entry(user, before, meta, details);
    match tx.append_ledger(&entry).await? {
        LedgerAppend::Inserted => Ok(()),
        LedgerAppend::Duplicate => Err(CoreError::AlreadyApplied {
            key: meta.idempotency_key.clone(),
        }),
    }
}

async fn persist(
    tx: &mut dyn StoreTx,
    user: &mut User,
    before: &QuotaSnapshot,
    meta: &MutationMeta,
    details: serde_json::Value,
) -> Result<(), CoreError> {
    user.updated_at = meta.now;
    tx.update_user(user).await?;
    if meta.marker {
        return record_marker(tx, user, before, meta, details).await;
    }
    record_ledger(tx, user, before, meta, details).await;
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn pay_manual_oldest_first(
    tx: &mut dyn StoreTx,
    user: &mut User,
    budget_mb: i64,
    meta: &MutationMeta,
) -> Result<ManualPayment, CoreError> {
    let mut payment = ManualPayment::default();
    if budget_mb <= 0 {
        return Ok(payment);
    }
    let mut debts = tx.lock_open_debts(user.id).await?;
    debts.sort_by(UserQuotaDebt::settlement_order);

    let mut left = budget_mb;
    for mut debt in debts {
        if left == 0 {
            break;
        }
        let applied = debt.pay(left, &meta.source, meta.now);
        if applied == 0 {
            continue;
        }
        tx.update_debt(&debt).await?;
        left -= applied;
        payment.paid_mb += applied;
        if debt.is_paid {
            payment.closed.push(debt.id);
        }
    }
    user.manual_debt_mb = (user.manual_debt_mb - payment.paid_mb).max(0);
    Ok(payment)
}

fn raise_purchased_for_auto_debt(user: &mut User) -> i64 {
    let added = ceil_mb(user.quota_debt_auto_mb());
    user.purchased_mb = user.purchased_mb.saturating_add(added);
    normalize_offset(user);
    added
}

/// Offset only covers actual overspend: zero once usage fits in the
/// purchased quota, never more than the overspend otherwise.
pub(crate) fn normalize_offset(user: &mut User) {
    let overspend = user.used_mb - Decimal::from(user.purchased_mb);
    if overspend <= Decimal::ZERO {
        user.auto_debt_offset_mb = 0;
    } else {
        user.auto_debt_offset_mb = user.auto_debt_offset_mb.clamp(0, ceil_mb(overspend));
    }
}

/// Whole MB, rounded up; negatives count as zero.
pub(crate) fn ceil_mb(value: Decimal) -> i64 {
    value.max(Decimal::ZERO).ceil().to_i64().unwrap_or(i64::MAX)
}

pub(crate) fn ensure_hotspot_password(user: &mut User) {
    let valid = user
        .hotspot_password
        .as_deref()
        .is_some_and(|p| p.len() == 6 && p.bytes().all(|b| b.is_ascii_digit()));
    if !valid {
        let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
        user.hotspot_password = Some(format!("{code:06}"));
    }
}
