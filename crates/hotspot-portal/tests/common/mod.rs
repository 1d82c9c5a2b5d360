// HTTP test fixtures.
//
// The router, provider and store fakes are the engine's own; this module
// wires them into a portal whose counters go to Prometheus, and drives the
// axum router in-process with `oneshot`.

#![allow(dead_code, clippy::unwrap_used)]

#[path = "../../../hotspot-core/tests/common/mod.rs"]
mod engine;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use chrono::{Duration, Utc};
use hotspot_core::jobs::JobPeriods;
use hotspot_core::locks::LockManager;
use hotspot_core::model::{ApprovalStatus, Package, PackageId, User, normalize_to_e164};
use hotspot_core::portal::{Portal, PortalParts};
use hotspot_core::settings::{Settings, SettingsProvider};
use hotspot_core::store::{MemoryStore, Store};
use hotspot_portal::{AppState, PrometheusMetrics, create_router};
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;

pub use engine::{FakeProvider, MemoryRouter, provider_body};

pub struct TestApp {
    pub router: Router,
    pub portal: Arc<Portal>,
    pub store: MemoryStore,
    pub gateway: Arc<MemoryRouter>,
    pub provider: Arc<FakeProvider>,
    pub metrics: Arc<PrometheusMetrics>,
}

pub fn test_app() -> TestApp {
    let store = MemoryStore::new();
    let gateway = MemoryRouter::new();
    let provider = FakeProvider::new();
    let metrics = Arc::new(PrometheusMetrics::new().unwrap());
    let portal = Arc::new(Portal::assemble(PortalParts {
        store: Arc::new(store.clone()),
        gateway: gateway.clone(),
        provider: provider.clone(),
        settings: Arc::new(SettingsProvider::fixed(Settings::default())),
        locks: Arc::new(LockManager::local()),
        metrics: metrics.clone(),
        notifier: None,
        jobs: JobPeriods::default(),
    }));
    let router = create_router(AppState::new(Arc::clone(&portal), Arc::clone(&metrics)));
    TestApp {
        router,
        portal,
        store,
        gateway,
        provider,
        metrics,
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::Null)
    }
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Reply {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        Reply {
            status,
            headers,
            text: String::from_utf8(bytes.to_vec()).unwrap(),
        }
    }

    pub async fn get(&self, uri: &str) -> Reply {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Reply {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        self.request(request).await
    }

    pub async fn post_raw(&self, uri: &str, body: &'static str) -> Reply {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        self.request(request).await
    }

    /// Approved user with 10 GB purchased and 30 days left.
    pub async fn user(&self) -> User {
        let now = Utc::now();
        let mut user = User::new(normalize_to_e164("081234567890").unwrap(), "Sari", now);
        user.is_active = true;
        user.approval_status = ApprovalStatus::Approved;
        user.purchased_mb = 10_240;
        user.used_mb = Decimal::ZERO;
        user.expiry = Some(now + Duration::days(30));
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.commit().await.unwrap();
        user
    }

    pub async fn package(&self) -> Package {
        let package = Package {
            id: PackageId::new(),
            name: "5 GB / 7 hari".into(),
            price: 50_000,
            quota_gb: Decimal::from(5),
            duration_days: 7,
            is_active: true,
        };
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_package(&package).await.unwrap();
        tx.commit().await.unwrap();
        package
    }

    pub async fn reload(&self, user: &User) -> User {
        let mut tx = self.store.begin().await.unwrap();
        let fresh = tx.get_user(user.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();
        fresh
    }
}
