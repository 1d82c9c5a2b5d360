// ── HTTP adapter ──
//
// Thin `axum` layer over the portal facade. Handlers call one engine
// operation each; all error translation happens in `ApiError`.

pub mod context;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use hotspot_core::Portal;
use tower_http::trace::TraceLayer;

use crate::metrics::PrometheusMetrics;

pub use error::{ApiError, ApiResult, ErrorEnvelope};

#[derive(Debug, Clone)]
pub struct AppState {
    pub portal: Arc<Portal>,
    pub metrics: Arc<PrometheusMetrics>,
}

impl AppState {
    pub fn new(portal: Arc<Portal>, metrics: Arc<PrometheusMetrics>) -> Self {
        Self { portal, metrics }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payment", post(handlers::payment_webhook))
        .route(
            "/transactions/public/by-order-id/{order_id}",
            get(handlers::transaction_by_order_id),
        )
        .route(
            "/transactions/public/{order_id}/cancel",
            post(handlers::cancel_transaction),
        )
        // probes stay unauthenticated
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            context::request_context,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
