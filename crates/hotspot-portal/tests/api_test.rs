#![allow(clippy::unwrap_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hotspot_core::TransactionStatus;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{provider_body, test_app};

// ── Webhook ─────────────────────────────────────────────────────────

#[tokio::test]
async fn settlement_webhook_credits_once_and_answers_200() {
    let app = test_app();
    let user = app.user().await;
    let package = app.package().await;
    let txn = app
        .portal
        .reconciler()
        .initiate_package_purchase(user.id, package.id)
        .await
        .unwrap();
    let body = provider_body(&txn.order_id, "settlement", "50000.00");

    let first = app.post_json("/webhooks/payment", &body).await;
    assert_eq!(first.status, StatusCode::OK);
    let first = first.json();
    assert_eq!(first["result"], "recorded");
    assert_eq!(first["status"], "success");
    assert_eq!(first["transitioned"], true);

    let second = app.post_json("/webhooks/payment", &body).await;
    assert_eq!(second.status, StatusCode::OK);
    let second = second.json();
    assert_eq!(second["transitioned"], false);
    let outcomes: Vec<&str> = second["effects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["outcome"].as_str().unwrap_or_default())
        .collect();
    assert!(outcomes.iter().all(|o| *o == "duplicate"), "{second}");

    assert_eq!(app.reload(&user).await.purchased_mb, 10_240 + 5_120);

    let metrics = app.get("/metrics").await;
    assert!(
        metrics
            .text
            .contains("hotspot_payment_webhook_duplicate_total{label=\"\"} 2"),
        "{}",
        metrics.text
    );
}

#[tokio::test]
async fn forged_and_unknown_webhooks_are_ignored_with_200() {
    let app = test_app();

    let mut forged = provider_body("HS-20260101-NOSUCHORDR", "settlement", "50000.00");
    forged["signature_key"] = json!("deadbeef");
    let reply = app.post_json("/webhooks/payment", &forged).await;
    assert_eq!(reply.status, StatusCode::OK);
    insta::assert_json_snapshot!(reply.json(), @r#"
    {
      "reason": "invalid_signature",
      "result": "ignored"
    }
    "#);

    let unknown = provider_body("HS-20260101-NOSUCHORDR", "settlement", "50000.00");
    let reply = app.post_json("/webhooks/payment", &unknown).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["reason"], "unknown_order");

    let metrics = app.get("/metrics").await.text;
    assert!(
        metrics.contains("hotspot_payment_webhook_invalid_signature_total{label=\"fake\"} 1"),
        "{metrics}"
    );
}

#[tokio::test]
async fn unparseable_webhook_gets_error_envelope() {
    let app = test_app();

    let reply = app.post_raw("/webhooks/payment", "{not json").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let body = reply.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "bad_request");
    assert_eq!(body["status_code"], 400);
    assert_eq!(
        body["request_id"].as_str(),
        reply.headers["x-request-id"].to_str().ok()
    );

    let reply = app
        .post_json("/webhooks/payment", &json!({ "transaction_status": "settlement" }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.json()["details"]["field"], "order_id");
}

// ── Public transaction routes ───────────────────────────────────────

#[tokio::test]
async fn order_lookup_polls_provider_and_hides_owner() {
    let app = test_app();
    let user = app.user().await;
    let package = app.package().await;
    let txn = app
        .portal
        .reconciler()
        .initiate_package_purchase(user.id, package.id)
        .await
        .unwrap();
    app.provider.script(&txn.order_id, "settlement");

    let reply = app
        .get(&format!("/transactions/public/by-order-id/{}", txn.order_id))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["order_id"], txn.order_id.as_str());
    assert_eq!(body["status"], "success");
    assert_eq!(body["amount"], 50_000);
    assert!(body.get("user_id").is_none());
    assert!(body.get("raw_payload").is_none());
}

#[tokio::test]
async fn unknown_order_is_404_envelope() {
    let app = test_app();
    let reply = app
        .get("/transactions/public/by-order-id/HS-20260101-MISSINGXXX")
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    let body = reply.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Not Found");
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn cancel_is_idempotent_but_not_after_success() {
    let app = test_app();
    let user = app.user().await;
    let package = app.package().await;
    let engine = app.portal.reconciler();

    let open = engine.initiate_package_purchase(user.id, package.id).await.unwrap();
    let uri = format!("/transactions/public/{}/cancel", open.order_id);
    let reply = app.post_json(&uri, &json!({})).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["status"], "cancelled");
    assert_eq!(app.post_json(&uri, &json!({})).await.status, StatusCode::OK);

    let paid = engine.initiate_package_purchase(user.id, package.id).await.unwrap();
    engine
        .handle_webhook(provider_body(&paid.order_id, "settlement", "50000.00"))
        .await
        .unwrap();
    let reply = app
        .post_json(&format!("/transactions/public/{}/cancel", paid.order_id), &json!({}))
        .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.json()["code"], "conflict");
    assert_eq!(
        engine.get_by_order_id(&paid.order_id).await.unwrap().status,
        TransactionStatus::Success
    );
}

// ── Operations ──────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok_without_router_pool() {
    let app = test_app();
    let reply = app.get("/health").await;
    assert_eq!(reply.status, StatusCode::OK);
    insta::assert_json_snapshot!(reply.json(), @r#"
    {
      "database": "ok",
      "router": "ok",
      "status": "ok"
    }
    "#);
}

#[tokio::test]
async fn metrics_are_prometheus_text() {
    let app = test_app();
    let reply = app.get("/metrics").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(
        reply.headers["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
}

#[tokio::test]
async fn caller_request_id_is_echoed() {
    let app = test_app();
    let request = Request::get("/transactions/public/by-order-id/HS-20260101-MISSINGXXX")
        .header("x-request-id", "trace-abc-123")
        .body(Body::empty())
        .unwrap();
    let reply = app.request(request).await;
    assert_eq!(reply.headers["x-request-id"], "trace-abc-123");
    assert_eq!(reply.json()["request_id"], "trace-abc-123");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = test_app();
    assert_eq!(app.get("/nope").await.status, StatusCode::NOT_FOUND);
}
