// ── Policy engine ──
//
// Pure functions from (user, policy config, now) to access decisions.
// Every other component asks these functions instead of re-deriving
// status from raw fields, so the router projection, HTTP responses and
// notifications can never disagree.

use chrono::{DateTime, Utc};
use hotspot_routeros::BindingType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::model::{ApprovalStatus, User};

/// Block-reason prefix written when auto-debt passes the configured limit.
/// Such a block is app-level only: the device keeps a non-blocked binding.
pub const AUTO_DEBT_BLOCK_PREFIX: &str = "quota_debt_limit|";

/// Block-reason prefix written when manual debt is still open at month end.
pub const MANUAL_DEBT_EOM_BLOCK_PREFIX: &str = "quota_manual_debt_eom|";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessStatus {
    Active,
    Fup,
    Habis,
    Expired,
    Unlimited,
    Inactive,
    Blocked,
}

impl AccessStatus {
    /// Token the frontend expects (`active` and `unlimited` both read `ok`).
    pub fn frontend_token(self) -> &'static str {
        match self {
            Self::Active | Self::Unlimited => "ok",
            Self::Fup => "fup",
            Self::Habis => "habis",
            Self::Expired => "expired",
            Self::Inactive => "inactive",
            Self::Blocked => "blocked",
        }
    }
}

/// Inputs the policy reads from dynamic settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub fup_threshold_mb: i64,
    pub bypass_statuses: Vec<AccessStatus>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fup_threshold_mb: 3072,
            bypass_statuses: default_bypass_statuses(),
        }
    }
}

pub fn default_bypass_statuses() -> Vec<AccessStatus> {
    vec![
        AccessStatus::Active,
        AccessStatus::Fup,
        AccessStatus::Unlimited,
    ]
}

/// Authoritative access status. First matching rule wins.
pub fn access_status(user: &User, config: &PolicyConfig, now: DateTime<Utc>) -> AccessStatus {
    if user.is_blocked {
        return AccessStatus::Blocked;
    }
    if !user.is_active || user.approval_status != ApprovalStatus::Approved {
        return AccessStatus::Inactive;
    }
    if user.is_unlimited {
        return AccessStatus::Unlimited;
    }
    if user.expiry.is_some_and(|expiry| expiry < now) {
        return AccessStatus::Expired;
    }

    let remaining = user.remaining_mb();
    if user.purchased_mb <= 0 || remaining <= Decimal::ZERO {
        return AccessStatus::Habis;
    }

    let threshold = Decimal::from(config.fup_threshold_mb);
    if user.purchased_mb > config.fup_threshold_mb && remaining <= threshold {
        return AccessStatus::Fup;
    }
    AccessStatus::Active
}

pub fn should_bypass_hotspot_login(user: &User, config: &PolicyConfig, now: DateTime<Utc>) -> bool {
    config
        .bypass_statuses
        .contains(&access_status(user, config, now))
}

/// Network-level block: any block except the app-level auto-debt one.
pub fn is_network_hard_block_required(user: &User) -> bool {
    user.is_blocked && !is_auto_debt_block(user.blocked_reason.as_deref())
}

pub fn allowed_binding_type(user: &User, config: &PolicyConfig, now: DateTime<Utc>) -> BindingType {
    if is_network_hard_block_required(user) {
        BindingType::Blocked
    } else if should_bypass_hotspot_login(user, config, now) {
        BindingType::Bypassed
    } else {
        BindingType::Regular
    }
}

// ── Block reasons ───────────────────────────────────────────────────

pub fn is_auto_debt_block(reason: Option<&str>) -> bool {
    reason.is_some_and(|r| r.starts_with(AUTO_DEBT_BLOCK_PREFIX))
}

pub fn is_manual_eom_block(reason: Option<&str>) -> bool {
    reason.is_some_and(|r| r.starts_with(MANUAL_DEBT_EOM_BLOCK_PREFIX))
}

/// `quota_debt_limit|debt_mb=700.00|limit_mb=500|source=sync`
pub fn auto_debt_block_reason(debt_mb: Decimal, limit_mb: i64, source: &str) -> String {
    format!(
        "{AUTO_DEBT_BLOCK_PREFIX}debt_mb={:.2}|limit_mb={limit_mb}|source={source}",
        debt_mb.round_dp(2)
    )
}

/// `quota_manual_debt_eom|debt_mb=300|source=eom_job`
pub fn manual_eom_block_reason(debt_mb: i64, source: &str) -> String {
    format!("{MANUAL_DEBT_EOM_BLOCK_PREFIX}debt_mb={debt_mb}|source={source}")
}

/// Auto-debt strictly above a positive limit (unlimited users never qualify).
pub fn auto_debt_limit_exceeded(user: &User, limit_mb: i64) -> bool {
    limit_mb > 0 && !user.is_unlimited && user.quota_debt_auto_mb() > Decimal::from(limit_mb)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::normalize_to_e164;
    use chrono::Duration;

    fn approved(purchased: i64, used: i64) -> User {
        let now = Utc::now();
        let mut u = User::new(normalize_to_e164("081200000001").unwrap(), "T", now);
        u.is_active = true;
        u.approval_status = ApprovalStatus::Approved;
        u.purchased_mb = purchased;
        u.used_mb = Decimal::from(used);
        u.expiry = Some(now + Duration::days(10));
        u
    }

    #[test]
    fn status_precedence() {
        let cfg = PolicyConfig::default();
        let now = Utc::now();

        let mut u = approved(10_240, 0);
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Active);

        u.used_mb = Decimal::from(8000);
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Fup);

        u.used_mb = Decimal::from(10_240);
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Habis);

        u.expiry = Some(now - Duration::minutes(1));
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Expired);

        u.is_unlimited = true;
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Unlimited);

        u.approval_status = ApprovalStatus::Pending;
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Inactive);

        u.block("manual", None, now);
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Blocked);
    }

    #[test]
    fn small_packages_never_enter_fup() {
        let cfg = PolicyConfig::default();
        let u = approved(2048, 2000);
        assert_eq!(access_status(&u, &cfg, Utc::now()), AccessStatus::Active);
    }

    #[test]
    fn auto_debt_block_is_not_a_hard_block() {
        let cfg = PolicyConfig::default();
        let now = Utc::now();
        let mut u = approved(1000, 1700);
        u.block(
            auto_debt_block_reason(Decimal::from(700), 500, "sync"),
            None,
            now,
        );
        assert!(u.is_blocked);
        assert!(!is_network_hard_block_required(&u));
        assert_eq!(access_status(&u, &cfg, now), AccessStatus::Blocked);
        assert_eq!(allowed_binding_type(&u, &cfg, now), BindingType::Regular);
    }

    #[test]
    fn manual_eom_block_is_a_hard_block() {
        let cfg = PolicyConfig::default();
        let now = Utc::now();
        let mut u = approved(1000, 0);
        u.block(manual_eom_block_reason(300, "eom_job"), None, now);
        assert!(is_network_hard_block_required(&u));
        assert_eq!(allowed_binding_type(&u, &cfg, now), BindingType::Blocked);
    }

    #[test]
    fn bypass_statuses_are_configurable() {
        let now = Utc::now();
        let u = approved(10_240, 8000);
        let strict = PolicyConfig {
            bypass_statuses: vec![AccessStatus::Active],
            ..PolicyConfig::default()
        };
        assert!(!should_bypass_hotspot_login(&u, &strict, now));
        assert!(should_bypass_hotspot_login(&u, &PolicyConfig::default(), now));
    }

    #[test]
    fn block_reason_format() {
        assert_eq!(
            auto_debt_block_reason(Decimal::new(7005, 1), 500, "sync"),
            "quota_debt_limit|debt_mb=700.50|limit_mb=500|source=sync"
        );
        assert!(is_auto_debt_block(Some("quota_debt_limit|debt_mb=1")));
        assert!(is_manual_eom_block(Some(&manual_eom_block_reason(5, "x"))));
        assert!(!is_auto_debt_block(None));
    }

    #[test]
    fn frontend_tokens() {
        assert_eq!(AccessStatus::Active.frontend_token(), "ok");
        assert_eq!(AccessStatus::Unlimited.frontend_token(), "ok");
        assert_eq!(AccessStatus::Habis.frontend_token(), "habis");
    }
}
