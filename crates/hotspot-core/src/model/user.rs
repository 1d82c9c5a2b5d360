// ── Users ──

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::ids::UserId;
use super::phone::PhoneNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    User,
    Commander,
    Admin,
    SuperAdmin,
}

impl UserRole {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// A portal user with quota, debt and hotspot provisioning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub phone: PhoneNumber,
    pub full_name: String,
    pub blok: Option<String>,
    pub kamar: Option<String>,
    pub role: UserRole,
    pub approval_status: ApprovalStatus,
    pub is_active: bool,

    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    /// Weak reference to the admin who blocked; resolved on demand.
    pub blocked_by: Option<UserId>,

    pub hotspot_username: String,
    pub hotspot_password: Option<String>,
    pub hotspot_profile: Option<String>,
    pub hotspot_server: Option<String>,
    pub is_provisioned: bool,

    pub purchased_mb: i64,
    pub used_mb: Decimal,
    pub expiry: Option<DateTime<Utc>>,
    pub is_unlimited: bool,
    pub auto_debt_offset_mb: i64,
    pub manual_debt_mb: i64,

    /// Status the last quota notification was sent for.
    pub last_quota_notice: Option<String>,
    pub last_expiry_notice_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A freshly registered, unapproved user.
    pub fn new(phone: PhoneNumber, full_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let hotspot_username = phone.localized();
        Self {
            id: UserId::new(),
            phone,
            full_name: full_name.into(),
            blok: None,
            kamar: None,
            role: UserRole::User,
            approval_status: ApprovalStatus::Pending,
            is_active: false,
            is_blocked: false,
            blocked_reason: None,
            blocked_at: None,
            blocked_by: None,
            hotspot_username,
            hotspot_password: None,
            hotspot_profile: None,
            hotspot_server: None,
            is_provisioned: false,
            purchased_mb: 0,
            used_mb: Decimal::ZERO,
            expiry: None,
            is_unlimited: false,
            auto_debt_offset_mb: 0,
            manual_debt_mb: 0,
            last_quota_notice: None,
            last_expiry_notice_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `purchased_mb - used_mb`, may be negative.
    pub fn remaining_mb(&self) -> Decimal {
        Decimal::from(self.purchased_mb) - self.used_mb
    }

    /// Usage beyond purchased quota not yet covered by the offset.
    pub fn quota_debt_auto_mb(&self) -> Decimal {
        let debt =
            self.used_mb - Decimal::from(self.purchased_mb) - Decimal::from(self.auto_debt_offset_mb);
        debt.max(Decimal::ZERO)
    }

    pub fn quota_debt_manual_mb(&self) -> i64 {
        self.manual_debt_mb.max(0)
    }

    pub fn quota_debt_total_mb(&self) -> Decimal {
        self.quota_debt_auto_mb() + Decimal::from(self.quota_debt_manual_mb())
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            purchased_mb: self.purchased_mb,
            used_mb: self.used_mb,
            expiry: self.expiry,
            is_unlimited: self.is_unlimited,
            auto_debt_offset_mb: self.auto_debt_offset_mb,
            manual_debt_mb: self.manual_debt_mb,
            quota_debt_auto_mb: self.quota_debt_auto_mb(),
            quota_debt_total_mb: self.quota_debt_total_mb(),
            is_blocked: self.is_blocked,
            blocked_reason: self.blocked_reason.clone(),
            hotspot_profile: self.hotspot_profile.clone(),
        }
    }

    pub fn block(&mut self, reason: impl Into<String>, by: Option<UserId>, now: DateTime<Utc>) {
        self.is_blocked = true;
        self.blocked_reason = Some(reason.into());
        self.blocked_at = Some(now);
        self.blocked_by = by;
    }

    pub fn unblock(&mut self) {
        self.is_blocked = false;
        self.blocked_reason = None;
        self.blocked_at = None;
        self.blocked_by = None;
    }
}

/// Quota-relevant fields captured before and after a ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub purchased_mb: i64,
    pub used_mb: Decimal,
    pub expiry: Option<DateTime<Utc>>,
    pub is_unlimited: bool,
    pub auto_debt_offset_mb: i64,
    pub manual_debt_mb: i64,
    pub quota_debt_auto_mb: Decimal,
    pub quota_debt_total_mb: Decimal,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub hotspot_profile: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::phone::normalize_to_e164;

    fn user() -> User {
        User::new(normalize_to_e164("081234567890").unwrap(), "Sari", Utc::now())
    }

    #[test]
    fn new_user_uses_local_username() {
        assert_eq!(user().hotspot_username, "081234567890");
    }

    #[test]
    fn auto_debt_respects_offset() {
        let mut u = user();
        u.purchased_mb = 1000;
        u.used_mb = Decimal::new(12005, 1); // 1200.5
        assert_eq!(u.quota_debt_auto_mb(), Decimal::new(2005, 1));
        u.auto_debt_offset_mb = 150;
        assert_eq!(u.quota_debt_auto_mb(), Decimal::new(505, 1));
        u.auto_debt_offset_mb = 500;
        assert_eq!(u.quota_debt_auto_mb(), Decimal::ZERO);
    }

    #[test]
    fn total_debt_sums_both_kinds() {
        let mut u = user();
        u.purchased_mb = 100;
        u.used_mb = Decimal::from(150);
        u.manual_debt_mb = 200;
        assert_eq!(u.quota_debt_total_mb(), Decimal::from(250));
    }
}
