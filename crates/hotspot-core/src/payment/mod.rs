// ── Payment provider seam ──
//
// The reconciliation engine talks to the provider through `PaymentProvider`.
// `MidtransClient` is the production implementation (Snap checkout + Core
// API status/cancel); tests substitute wiremock-backed instances.

pub mod midtrans;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha512};

use crate::error::CoreError;
use crate::model::TransactionStatus;

pub use midtrans::{MidtransClient, MidtransConfig};

/// Checkout request for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRequest {
    pub order_id: String,
    pub gross_amount: i64,
    pub item_name: String,
    pub customer_name: String,
    pub customer_phone: String,
    /// Provider-side payment window.
    pub expiry_minutes: u32,
}

/// Hosted checkout session returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub token: String,
    pub redirect_url: String,
}

/// One observation of an order at the provider, from a status poll or a
/// webhook body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub order_id: String,
    pub transaction_status: String,
    pub fraud_status: Option<String>,
    pub status_code: String,
    /// Exactly as sent (`"50000.00"`), used verbatim in signatures.
    pub gross_amount: String,
    pub payment_type: Option<String>,
    pub va_number: Option<String>,
    pub qr_code_url: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub settlement_time: Option<DateTime<Utc>>,
    pub signature_key: Option<String>,
    pub raw: Value,
}

impl ProviderStatus {
    /// Internal status for this observation.
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_provider(&self.transaction_status, self.fraud_status.as_deref())
    }

    /// Parse a provider body. Only `order_id` is mandatory; missing
    /// optional fields stay `None`.
    pub fn from_json(raw: Value) -> Result<Self, CoreError> {
        let text = |key: &str| -> Option<String> {
            match raw.get(key)? {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        let order_id = text("order_id")
            .ok_or_else(|| CoreError::validation("order_id", "payment payload without order_id"))?;

        Ok(Self {
            transaction_status: text("transaction_status").unwrap_or_default(),
            fraud_status: text("fraud_status"),
            status_code: text("status_code").unwrap_or_default(),
            gross_amount: text("gross_amount").unwrap_or_default(),
            payment_type: text("payment_type"),
            va_number: va_number(&raw),
            qr_code_url: qr_code_url(&raw),
            expiry_time: text("expiry_time").and_then(|t| midtrans::parse_time(&t)),
            settlement_time: text("settlement_time").and_then(|t| midtrans::parse_time(&t)),
            signature_key: text("signature_key"),
            order_id,
            raw,
        })
    }
}

fn va_number(raw: &Value) -> Option<String> {
    raw.get("va_numbers")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|va| va.get("va_number"))
        .or_else(|| raw.get("permata_va_number"))
        .or_else(|| raw.get("bill_key"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn qr_code_url(raw: &Value) -> Option<String> {
    raw.get("actions")?
        .as_array()?
        .iter()
        .find(|a| {
            a.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n == "generate-qr-code")
        })?
        .get("url")?
        .as_str()
        .map(str::to_owned)
}

/// `hex(sha512(order_id + status_code + gross_amount + server_key))`
pub fn notification_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two hex signatures, ignoring case. Every byte of the decoded
/// digests is visited regardless of where they first differ.
pub fn signature_matches(received: &str, expected: &str) -> bool {
    let (Ok(received), Ok(expected)) = (
        hex::decode(received.to_ascii_lowercase()),
        hex::decode(expected.to_ascii_lowercase()),
    ) else {
        return false;
    };
    if received.len() != expected.len() {
        return false;
    }
    received
        .iter()
        .zip(&expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[async_trait]
pub trait PaymentProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn create_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutSession, CoreError>;

    async fn status(&self, order_id: &str) -> Result<ProviderStatus, CoreError>;

    async fn cancel(&self, order_id: &str) -> Result<ProviderStatus, CoreError>;

    /// Whether a webhook body carries a valid signature.
    fn verify_notification(&self, notification: &ProviderStatus) -> bool;
}
