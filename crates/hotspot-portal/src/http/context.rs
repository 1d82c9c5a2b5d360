// ── Request context ──
//
// Tags every request with an id (taken from `X-Request-Id` when sane,
// generated otherwise) and the resolved client address. Both go on the
// tracing span; the id is echoed back and reaches error envelopes through a
// task-local.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use hotspot_core::{ForwardedHeaders, resolve_client_ip};
use tracing::Instrument;
use uuid::Uuid;

use super::AppState;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

const MAX_REQUEST_ID_LEN: usize = 128;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Id of the request being handled, if called from inside one.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(&REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    let sane = !raw.is_empty()
        && raw.len() <= MAX_REQUEST_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    sane.then(|| raw.to_owned())
}

fn forwarded(headers: &HeaderMap) -> ForwardedHeaders<'_> {
    ForwardedHeaders {
        x_forwarded_for: headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        x_real_ip: headers.get("x-real-ip").and_then(|v| v.to_str().ok()),
    }
}

pub async fn request_context(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let request_id =
        incoming_request_id(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());

    // absent when the router is driven without a listener (tests)
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| {
            let settings = state.portal.settings().current();
            resolve_client_ip(peer.ip(), forwarded(req.headers()), &settings)
        });

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        client_ip = client_ip.map(tracing::field::display),
    );
    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(req))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
