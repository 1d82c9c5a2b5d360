//! HTTP surface of the hotspot portal.
//!
//! The engine lives in `hotspot-core`; this crate only translates requests
//! into its operations and its errors into JSON envelopes:
//!
//! - **[`http`]**: `axum` router for the payment webhook, the public
//!   transaction routes, health and metrics.
//! - **[`metrics`]**: Prometheus backend for the core `Metrics` seam.

pub mod http;
pub mod metrics;

pub use http::{AppState, create_router};
pub use metrics::PrometheusMetrics;
