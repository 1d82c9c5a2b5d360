// ── Mutation ledger & audits ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::UserId;
use super::mac::MacAddress;
use super::user::QuotaSnapshot;

/// Append-only record of a quota/debt mutation. Unique on
/// `(user_id, source, idempotency_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub actor_id: Option<UserId>,
    pub source: String,
    pub idempotency_key: String,
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    pub event_details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        actor_id: Option<UserId>,
        source: impl Into<String>,
        idempotency_key: impl Into<String>,
        before: &QuotaSnapshot,
        after: &QuotaSnapshot,
        event_details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            actor_id,
            source: source.into(),
            idempotency_key: idempotency_key.into(),
            before_state: serde_json::to_value(before).unwrap_or_default(),
            after_state: serde_json::to_value(after).unwrap_or_default(),
            event_details,
            created_at: now,
        }
    }
}

/// Recorded whenever a device's address-list IP moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressListAudit {
    pub id: Uuid,
    pub user_id: UserId,
    pub mac: MacAddress,
    pub previous_ip: Option<String>,
    pub new_ip: String,
    pub list_name: String,
    pub created_at: DateTime<Utc>,
}
