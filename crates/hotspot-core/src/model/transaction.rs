// ── Payment transactions ──
//
// States: unknown → pending → {success, failed, expired, cancelled}.
// Terminal states never change; observations after a terminal state are
// recorded as events only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::ids::{DebtId, PackageId, TransactionId, UserId};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Unknown,
    Pending,
    Success,
    Failed,
    Expired,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Monotonic transition rule.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            _ if self.is_terminal() => false,
            Self::Unknown => next != Self::Unknown,
            Self::Pending => next.is_terminal(),
            _ => false,
        }
    }

    /// Translate the provider's `transaction_status` (+ `fraud_status`).
    pub fn from_provider(transaction_status: &str, fraud_status: Option<&str>) -> Self {
        match transaction_status.trim().to_ascii_lowercase().as_str() {
            "capture" if fraud_status.is_some_and(|f| f.eq_ignore_ascii_case("challenge")) => {
                Self::Pending
            }
            "settlement" | "capture" => Self::Success,
            "pending" => Self::Pending,
            "deny" | "failure" => Self::Failed,
            "cancel" => Self::Cancelled,
            "expire" => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

/// What an order pays for, derived from its order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Package,
    /// `DEBT-<debt_id>~<suffix>`
    DebtItem(DebtId),
    /// `DEBT-<suffix>`
    DebtAggregate,
}

pub const DEBT_ORDER_PREFIX: &str = "DEBT-";
pub const PACKAGE_ORDER_PREFIX: &str = "HS-";

impl OrderKind {
    pub fn parse(order_id: &str) -> Result<Self, CoreError> {
        let Some(rest) = order_id.strip_prefix(DEBT_ORDER_PREFIX) else {
            return Ok(Self::Package);
        };
        match rest.split_once('~') {
            Some((debt_id, _)) => debt_id.parse::<DebtId>().map(Self::DebtItem).map_err(|_| {
                CoreError::validation("order_id", format!("malformed debt order id '{order_id}'"))
            }),
            None => Ok(Self::DebtAggregate),
        }
    }

    pub fn is_debt(self) -> bool {
        !matches!(self, Self::Package)
    }
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_ascii_uppercase()
}

pub fn new_package_order_id(now: DateTime<Utc>) -> String {
    format!("{PACKAGE_ORDER_PREFIX}{}-{}", now.format("%Y%m%d"), short_suffix())
}

pub fn new_debt_order_id(debt: Option<DebtId>) -> String {
    match debt {
        Some(id) => format!("{DEBT_ORDER_PREFIX}{id}~{}", short_suffix()),
        None => format!("{DEBT_ORDER_PREFIX}{}", short_suffix()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub package_id: Option<PackageId>,
    pub order_id: String,
    pub amount: i64,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    pub va_number: Option<String>,
    pub qr_code_url: Option<String>,
    pub snap_token: Option<String>,
    pub redirect_url: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        package_id: Option<PackageId>,
        order_id: String,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            user_id,
            package_id,
            order_id,
            amount,
            status: TransactionStatus::Unknown,
            payment_method: None,
            va_number: None,
            qr_code_url: None,
            snap_token: None,
            redirect_url: None,
            expiry_time: None,
            paid_at: None,
            raw_payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn order_kind(&self) -> Result<OrderKind, CoreError> {
        OrderKind::parse(&self.order_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventSource {
    App,
    Webhook,
    StatusPoll,
}

/// Append-only record of every observation of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub source: EventSource,
    pub event_type: String,
    pub status: TransactionStatus,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(
        transaction_id: TransactionId,
        source: EventSource,
        event_type: impl Into<String>,
        status: TransactionStatus,
        payload: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            source,
            event_type: event_type.into(),
            status,
            payload,
            created_at: now,
        }
    }
}
