// Midtrans client
//
// Snap (`/snap/v1/transactions`) creates hosted checkouts; the Core API
// (`/v2/{order_id}/status`, `/v2/{order_id}/cancel`) reports and cancels.
// Both authenticate with HTTP basic auth: server key as user, empty
// password. The Core API answers HTTP 200 even for errors and carries the
// real code in the body's `status_code`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::{
    CheckoutRequest, CheckoutSession, PaymentProvider, ProviderStatus, notification_signature,
    signature_matches,
};
use crate::error::CoreError;

const SANDBOX_SNAP: &str = "https://app.sandbox.midtrans.com/";
const SANDBOX_API: &str = "https://api.sandbox.midtrans.com/";
const PRODUCTION_SNAP: &str = "https://app.midtrans.com/";
const PRODUCTION_API: &str = "https://api.midtrans.com/";

/// Order ids are `[A-Za-z0-9-_.~]` in practice; anything else is escaped.
const ORDER_ID: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Midtrans reports local times in WIB.
const PROVIDER_UTC_OFFSET_SECS: i32 = 7 * 3600;

#[derive(Debug, Clone)]
pub struct MidtransConfig {
    pub server_key: SecretString,
    pub is_production: bool,
    pub timeout: Duration,
    /// Overrides for tests or proxies; default to the public endpoints.
    pub snap_base: Option<Url>,
    pub api_base: Option<Url>,
}

impl MidtransConfig {
    pub fn new(server_key: SecretString, is_production: bool, timeout: Duration) -> Self {
        Self {
            server_key,
            is_production,
            timeout,
            snap_base: None,
            api_base: None,
        }
    }

    /// Point both APIs at one base URL.
    #[must_use]
    pub fn with_base(mut self, base: Url) -> Self {
        self.snap_base = Some(base.clone());
        self.api_base = Some(base);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MidtransClient {
    http: reqwest::Client,
    snap_base: Url,
    api_base: Url,
    server_key: SecretString,
}

impl MidtransClient {
    pub fn new(config: MidtransConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("hotspot-portal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::Config {
                message: format!("failed to build payment HTTP client: {e}"),
            })?;
        let (snap, api) = if config.is_production {
            (PRODUCTION_SNAP, PRODUCTION_API)
        } else {
            (SANDBOX_SNAP, SANDBOX_API)
        };
        Ok(Self {
            http,
            snap_base: match config.snap_base {
                Some(u) => u,
                None => parse_base(snap)?,
            },
            api_base: match config.api_base {
                Some(u) => u,
                None => parse_base(api)?,
            },
            server_key: config.server_key,
        })
    }

    fn url(base: &Url, path: &str) -> Result<Url, CoreError> {
        base.join(path).map_err(|e| CoreError::Internal(format!("bad provider URL {path}: {e}")))
    }

    fn order_path(order_id: &str, action: &str) -> String {
        format!("v2/{}/{action}", utf8_percent_encode(order_id, ORDER_ID))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, CoreError> {
        let resp = req
            .basic_auth(self.server_key.expose_secret(), Some(""))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_err)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_err)?;
        let value: Value = serde_json::from_str(&body).map_err(|e| CoreError::Payment {
            message: format!("unreadable provider response ({status}): {e}"),
            status: Some(status.as_u16()),
        })?;
        if !status.is_success() {
            return Err(CoreError::Payment {
                message: provider_message(&value).unwrap_or_else(|| status.to_string()),
                status: Some(status.as_u16()),
            });
        }
        Ok(value)
    }

    /// Core API call with the in-body status code checked.
    async fn core_api(&self, order_id: &str, req: reqwest::RequestBuilder) -> Result<ProviderStatus, CoreError> {
        let value = self.send(req).await?;
        let code = value
            .get("status_code")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<u16>().ok());
        match code {
            Some(404) => Err(CoreError::not_found("payment", order_id)),
            Some(c) if c >= 400 => Err(CoreError::Payment {
                message: provider_message(&value).unwrap_or_else(|| format!("status_code {c}")),
                status: Some(c),
            }),
            _ => ProviderStatus::from_json(value),
        }
    }
}

#[async_trait]
impl PaymentProvider for MidtransClient {
    fn name(&self) -> &'static str {
        "midtrans"
    }

    async fn create_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutSession, CoreError> {
        let url = Self::url(&self.snap_base, "snap/v1/transactions")?;
        debug!(order_id = %req.order_id, amount = req.gross_amount, "POST {}", url);
        let body = json!({
            "transaction_details": {
                "order_id": req.order_id,
                "gross_amount": req.gross_amount,
            },
            "item_details": [{
                "id": req.order_id,
                "price": req.gross_amount,
                "quantity": 1,
                "name": req.item_name,
            }],
            "customer_details": {
                "first_name": req.customer_name,
                "phone": req.customer_phone,
            },
            "expiry": {
                "unit": "minutes",
                "duration": req.expiry_minutes,
            },
        });
        let value = self.send(self.http.post(url).json(&body)).await?;
        serde_json::from_value(value).map_err(|e| CoreError::Payment {
            message: format!("checkout response without token: {e}"),
            status: None,
        })
    }

    async fn status(&self, order_id: &str) -> Result<ProviderStatus, CoreError> {
        let url = Self::url(&self.api_base, &Self::order_path(order_id, "status"))?;
        debug!(order_id, "GET {}", url);
        self.core_api(order_id, self.http.get(url)).await
    }

    async fn cancel(&self, order_id: &str) -> Result<ProviderStatus, CoreError> {
        let url = Self::url(&self.api_base, &Self::order_path(order_id, "cancel"))?;
        debug!(order_id, "POST {}", url);
        self.core_api(order_id, self.http.post(url)).await
    }

    fn verify_notification(&self, n: &ProviderStatus) -> bool {
        let Some(received) = n.signature_key.as_deref() else {
            return false;
        };
        let expected = notification_signature(
            &n.order_id,
            &n.status_code,
            &n.gross_amount,
            self.server_key.expose_secret(),
        );
        let ok = signature_matches(received, &expected);
        if !ok {
            warn!(order_id = %n.order_id, "payment notification signature mismatch");
        }
        ok
    }
}

fn parse_base(raw: &str) -> Result<Url, CoreError> {
    Url::parse(raw).map_err(|e| CoreError::Config {
        message: format!("invalid provider URL {raw}: {e}"),
    })
}

fn transport_err(e: reqwest::Error) -> CoreError {
    CoreError::Payment {
        message: if e.is_timeout() {
            format!("provider timed out: {e}")
        } else {
            format!("provider unreachable: {e}")
        },
        status: e.status().map(|s| s.as_u16()),
    }
}

fn provider_message(value: &Value) -> Option<String> {
    value
        .get("status_message")
        .and_then(Value::as_str)
        .or_else(|| {
            value
                .get("error_messages")
                .and_then(Value::as_array)
                .and_then(|m| m.first())
                .and_then(Value::as_str)
        })
        .map(str::to_owned)
}

/// Provider timestamps: `YYYY-MM-DD HH:MM:SS` in WIB, or RFC 3339.
pub(crate) fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(PROVIDER_UTC_OFFSET_SECS)?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TransactionStatus;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, MidtransClient) {
        let server = MockServer::start().await;
        let config = MidtransConfig::new("SB-server-key".to_owned().into(), false, Duration::from_secs(2))
            .with_base(Url::parse(&server.uri()).unwrap());
        (server, MidtransClient::new(config).unwrap())
    }

    fn checkout() -> CheckoutRequest {
        CheckoutRequest {
            order_id: "HS-20260101-ABCDEFGHIJ".into(),
            gross_amount: 50_000,
            item_name: "Paket 10 GB".into(),
            customer_name: "Sari".into(),
            customer_phone: "081234567890".into(),
            expiry_minutes: 60,
        }
    }

    #[tokio::test]
    async fn creates_checkout_with_basic_auth() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/snap/v1/transactions"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "snap-token",
                "redirect_url": "https://app.sandbox.midtrans.com/snap/v4/redirection/snap-token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = client.create_checkout(&checkout()).await.unwrap();
        assert_eq!(session.token, "snap-token");
    }

    #[tokio::test]
    async fn checkout_rejection_is_payment_error() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/snap/v1/transactions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_messages": ["transaction_details.order_id has already been taken"]
            })))
            .mount(&server)
            .await;

        let err = client.create_checkout(&checkout()).await.unwrap_err();
        match err {
            CoreError::Payment { message, status } => {
                assert_eq!(status, Some(400));
                assert!(message.contains("already been taken"));
            }
            other => panic!("expected payment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reads_settlement() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/v2/HS-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status_code": "200",
                "order_id": "HS-1",
                "transaction_status": "settlement",
                "gross_amount": "50000.00",
                "settlement_time": "2026-01-01 10:00:00"
            })))
            .mount(&server)
            .await;

        let status = client.status("HS-1").await.unwrap();
        assert_eq!(status.status(), TransactionStatus::Success);
        assert_eq!(status.settlement_time.unwrap().to_rfc3339(), "2026-01-01T03:00:00+00:00");
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/v2/HS-2/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status_code": "404",
                "status_message": "Transaction doesn't exist."
            })))
            .mount(&server)
            .await;

        let err = client.status("HS-2").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        let config = MidtransConfig::new("k".to_owned().into(), false, Duration::from_millis(100))
            .with_base(Url::parse(&server.uri()).unwrap());
        let client = MidtransClient::new(config).unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = client.status("HS-3").await.unwrap_err();
        assert!(matches!(err, CoreError::Payment { .. }), "{err:?}");
    }

    #[test]
    fn verifies_signature() {
        let config = MidtransConfig::new("server-key".to_owned().into(), false, Duration::from_secs(1));
        let client = MidtransClient::new(config).unwrap();
        let mut n = ProviderStatus::from_json(json!({
            "order_id": "HS-1",
            "status_code": "200",
            "gross_amount": "50000.00",
            "transaction_status": "settlement",
        }))
        .unwrap();
        assert!(!client.verify_notification(&n));
        n.signature_key = Some(notification_signature("HS-1", "200", "50000.00", "server-key"));
        assert!(client.verify_notification(&n));
        n.gross_amount = "1.00".into();
        assert!(!client.verify_notification(&n));
    }

    #[test]
    fn signature_check_tolerates_case_but_not_truncation() {
        let config = MidtransConfig::new("server-key".to_owned().into(), false, Duration::from_secs(1));
        let client = MidtransClient::new(config).unwrap();
        let sig = notification_signature("HS-1", "200", "50000.00", "server-key");
        let mut n = ProviderStatus::from_json(json!({
            "order_id": "HS-1",
            "status_code": "200",
            "gross_amount": "50000.00",
            "transaction_status": "settlement",
            "signature_key": sig.to_ascii_uppercase(),
        }))
        .unwrap();
        assert!(client.verify_notification(&n));
        n.signature_key = Some(sig[..64].to_owned());
        assert!(!client.verify_notification(&n));
    }
}
