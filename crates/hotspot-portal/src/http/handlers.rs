//! Request handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use hotspot_core::{Transaction, TransactionStatus, WebhookOutcome};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::AppState;
use super::error::{ApiError, ApiResult};

// ── Payment webhook ─────────────────────────────────────────────────

/// Provider notification. Answers 200 for every parsed payload, recorded or
/// ignored, so the provider stops retrying.
pub async fn payment_webhook(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<WebhookOutcome>> {
    let Json(payload) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let outcome = state.portal.reconciler().handle_webhook(payload).await?;
    if let WebhookOutcome::Recorded(observation) = &outcome {
        info!(
            order_id = %observation.order_id,
            status = %observation.status,
            transitioned = observation.transitioned,
            "webhook recorded"
        );
    }
    Ok(Json(outcome))
}

// ── Public transaction routes ───────────────────────────────────────

/// Transaction fields safe to show to whoever holds the order id.
#[derive(Debug, Serialize)]
pub struct PublicTransaction {
    pub order_id: String,
    pub status: TransactionStatus,
    pub amount: i64,
    pub payment_method: Option<String>,
    pub va_number: Option<String>,
    pub qr_code_url: Option<String>,
    pub snap_token: Option<String>,
    pub redirect_url: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Transaction> for PublicTransaction {
    fn from(t: Transaction) -> Self {
        Self {
            order_id: t.order_id,
            status: t.status,
            amount: t.amount,
            payment_method: t.payment_method,
            va_number: t.va_number,
            qr_code_url: t.qr_code_url,
            snap_token: t.snap_token,
            redirect_url: t.redirect_url,
            expiry_time: t.expiry_time,
            paid_at: t.paid_at,
            created_at: t.created_at,
        }
    }
}

/// Current state of an order, polling the provider first while it is open.
pub async fn transaction_by_order_id(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<PublicTransaction>> {
    let txn = state.portal.reconciler().refresh(&order_id).await?;
    Ok(Json(txn.into()))
}

pub async fn cancel_transaction(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<PublicTransaction>> {
    let txn = state.portal.reconciler().cancel_by_user(&order_id, None).await?;
    Ok(Json(txn.into()))
}

// ── Operations ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub database: String,
    pub router: String,
}

fn probe(result: Result<(), String>) -> String {
    result.err().unwrap_or_else(|| "ok".to_owned())
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.portal.health().await;
    let (code, status) = if health.is_ok() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = HealthBody {
        status,
        database: probe(health.database),
        router: probe(health.router),
    };
    (code, Json(body))
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let text = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        text,
    ))
}
