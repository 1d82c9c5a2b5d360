// ── Manual quota debt ──

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DebtId, UserId};

/// An admin-recorded debt item. `paid_mb <= amount_mb`; `is_paid` iff fully paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuotaDebt {
    pub id: DebtId,
    pub user_id: UserId,
    pub debt_date: Option<NaiveDate>,
    pub amount_mb: i64,
    pub paid_mb: i64,
    pub is_paid: bool,
    pub created_by: Option<UserId>,
    pub note: Option<String>,
    pub last_paid_source: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserQuotaDebt {
    pub fn remaining_mb(&self) -> i64 {
        (self.amount_mb - self.paid_mb).max(0)
    }

    /// Apply up to `mb` to this item; returns the amount actually applied.
    pub fn pay(&mut self, mb: i64, source: &str, now: DateTime<Utc>) -> i64 {
        let applied = mb.clamp(0, self.remaining_mb());
        if applied == 0 {
            return 0;
        }
        self.paid_mb += applied;
        self.is_paid = self.paid_mb >= self.amount_mb;
        self.last_paid_source = Some(source.to_owned());
        self.paid_at = Some(now);
        applied
    }

    /// Oldest first: dated items by date, undated items last, ties by creation.
    pub fn settlement_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        match (a.debt_date, b.debt_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then(a.created_at.cmp(&b.created_at))
    }
}
