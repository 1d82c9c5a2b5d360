//! Access-state reconciliation engine for a managed Wi-Fi hotspot portal.
//!
//! The crate decides, for every subscriber, what the network should let them
//! do, and keeps a MikroTik router, a payment provider and the portal
//! database agreeing on that decision:
//!
//! - **Policy** ([`policy`]): Pure derivation of [`AccessStatus`] and the
//!   router binding type from a user row. Every other component asks here.
//!
//! - **Quota & debt ledger** ([`quota`]): Row-locked mutations of purchased,
//!   used and owed megabytes, each mirrored by an idempotent ledger entry.
//!
//! - **[`HotspotSync`]**: Converges router state (hotspot user, IP bindings,
//!   address lists, DHCP leases) with policy under a per-user lock. Also
//!   enforces the automatic debt-limit block.
//!
//! - **[`Reconciler`]**: Checkout, provider webhooks, polling and expiry.
//!   Paid transactions fire their effects at most once each.
//!
//! - **[`DeviceBinding`]**: Binds the requesting device to its owner and
//!   cleans router state on logout.
//!
//! - **[`NotificationDispatcher`]**: WhatsApp and Telegram delivery behind
//!   circuit breakers.
//!
//! - **[`Portal`]**: Facade that builds all of the above from a
//!   [`PortalConfig`] and runs the periodic [`Jobs`].

pub mod binding;
pub mod client_ip;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod payment;
pub mod policy;
pub mod portal;
pub mod quota;
pub mod reconcile;
pub mod settings;
pub mod store;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use binding::{BindOutcome, DeviceBinding, ResetSummary};
pub use client_ip::{ForwardedHeaders, resolve_client_ip};
pub use config::{
    DatabaseConfig, PaymentConfig, PortalConfig, RedisConfig, TelegramBotConfig,
    WhatsAppGatewayConfig,
};
pub use error::{CoreError, ErrorKind, ForbiddenStatus};
pub use gateway::{HotspotGateway, RouterOsGateway};
pub use jobs::{JobKind, JobPeriods, Jobs, Scheduler};
pub use locks::{LockGuard, LockManager, LockStore, RedisLockStore};
pub use metrics::{InMemoryMetrics, Metrics, NoopMetrics, SharedMetrics};
pub use notify::{Channel, NotificationDispatcher, NotificationEvent, Transport};
pub use payment::{MidtransClient, MidtransConfig, PaymentProvider, ProviderStatus};
pub use policy::{AccessStatus, PolicyConfig, access_status};
pub use portal::{Health, Portal, PortalParts};
pub use reconcile::{Observation, PendingSummary, Reconciler, WebhookOutcome};
pub use settings::{Settings, SettingsProvider};
pub use store::{MemoryStore, PostgresStore, Store, StoreTx};
pub use sync::{HotspotSync, SyncReport, SyncRequest};

pub use model::{
    DebtId, EventSource, LedgerEntry, MacAddress, Package, PackageId, PhoneNumber, Transaction,
    TransactionId, TransactionStatus, User, UserDevice, UserId, UserQuotaDebt, UserRole,
};
