// ── Portal facade ──
//
// Builds every service from a `PortalConfig`, owns their shared handles and
// the job scheduler. `start()` launches background jobs, `shutdown()` stops
// them and closes the router pool. Callers reach the services through the
// accessors; nothing here holds business logic.

use std::sync::Arc;

use hotspot_routeros::{PoolConfig, RouterCredentials, RouterOsPool, TlsMode, TransportConfig};
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::binding::DeviceBinding;
use crate::config::PortalConfig;
use crate::error::CoreError;
use crate::gateway::{HotspotGateway, RouterOsGateway};
use crate::jobs::{JobPeriods, Jobs, Scheduler};
use crate::locks::{LockManager, LockStore, RedisLockStore};
use crate::metrics::SharedMetrics;
use crate::notify::{
    NotificationDispatcher, TelegramConfig, TelegramTransport, TemplateSet, WhatsAppConfig,
    WhatsAppTransport,
};
use crate::payment::{MidtransClient, MidtransConfig, PaymentProvider};
use crate::reconcile::Reconciler;
use crate::settings::{Settings, SettingsProvider};
use crate::store::{MemoryStore, PostgresStore, Store};
use crate::sync::HotspotSync;

/// Pre-built collaborators for `Portal::assemble`.
pub struct PortalParts {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn HotspotGateway>,
    pub provider: Arc<dyn PaymentProvider>,
    pub settings: Arc<SettingsProvider>,
    pub locks: Arc<LockManager>,
    pub metrics: SharedMetrics,
    pub notifier: Option<Arc<NotificationDispatcher>>,
    pub jobs: JobPeriods,
}

impl std::fmt::Debug for PortalParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalParts")
            .field("gateway", &self.gateway)
            .field("provider", &self.provider)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

pub struct Portal {
    store: Arc<dyn Store>,
    settings: Arc<SettingsProvider>,
    metrics: SharedMetrics,
    router_pool: Option<Arc<RouterOsPool>>,
    sync: HotspotSync,
    reconciler: Arc<Reconciler>,
    binding: DeviceBinding,
    jobs: Arc<Jobs>,
    periods: JobPeriods,
    cancel: CancellationToken,
    scheduler: Mutex<Option<Scheduler>>,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("router_pool", &self.router_pool)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl Portal {
    /// Connect to every configured backend. The router is not contacted
    /// until the first sync.
    pub async fn build(config: PortalConfig, metrics: SharedMetrics) -> Result<Self, CoreError> {
        let store: Arc<dyn Store> = match &config.database {
            Some(db) => Arc::new(
                PostgresStore::connect(db.url.expose_secret(), db.max_connections, db.acquire_timeout)
                    .await?,
            ),
            None => {
                warn!("no database configured, using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let settings = Arc::new(SettingsProvider::from_store(
            Arc::clone(&store),
            config.settings_from_env,
        ));
        if let Err(e) = settings.refresh().await {
            warn!(error = %e, "initial settings load failed, using env and defaults");
        }
        let current = settings.current();

        let shared: Option<Arc<dyn LockStore>> = match &config.redis {
            Some(redis) => {
                let store = RedisLockStore::open(
                    redis.url.expose_secret(),
                    redis.key_prefix.clone(),
                    redis.timeout,
                )?;
                if let Err(e) = store.ping().await {
                    warn!(error = %e, "redis unreachable at startup, locks fall back per call");
                }
                Some(Arc::new(store))
            }
            None => None,
        };
        let locks = Arc::new(LockManager::new(shared));

        let pool = Arc::new(RouterOsPool::new(router_pool_config(&current, &config)));
        let gateway: Arc<dyn HotspotGateway> = Arc::new(RouterOsGateway::new(
            Arc::clone(&pool),
            current.managed_comment_prefix.clone(),
        ));

        let mut midtrans = MidtransConfig::new(
            config.payment.server_key.clone(),
            config.payment.production,
            current.midtrans_timeout,
        );
        if let Some(base) = &config.payment.base_url {
            midtrans = midtrans.with_base(base.clone());
        }
        let provider: Arc<dyn PaymentProvider> = Arc::new(MidtransClient::new(midtrans)?);

        let notifier = build_notifier(&config, &current, Arc::clone(&metrics))?;

        let mut portal = Self::assemble(PortalParts {
            store,
            gateway,
            provider,
            settings,
            locks,
            metrics,
            notifier,
            jobs: config.jobs,
        });
        portal.router_pool = Some(pool);
        info!(router = %current.router.host, "portal assembled");
        Ok(portal)
    }

    /// Wire services from ready-made collaborators.
    pub fn assemble(parts: PortalParts) -> Self {
        let sync = HotspotSync::new(
            Arc::clone(&parts.store),
            parts.gateway,
            Arc::clone(&parts.settings),
            Arc::clone(&parts.locks),
            Arc::clone(&parts.metrics),
        );
        let mut reconciler = Reconciler::new(
            Arc::clone(&parts.store),
            parts.provider,
            sync.clone(),
            parts.locks,
            Arc::clone(&parts.settings),
            Arc::clone(&parts.metrics),
        );
        if let Some(notifier) = &parts.notifier {
            reconciler = reconciler.with_notifier(Arc::clone(notifier));
        }
        let reconciler = Arc::new(reconciler);
        let binding = DeviceBinding::new(
            Arc::clone(&parts.store),
            sync.clone(),
            Arc::clone(&parts.settings),
        );
        let jobs = Arc::new(Jobs::new(
            Arc::clone(&parts.store),
            Arc::clone(&reconciler),
            sync.clone(),
            Arc::clone(&parts.settings),
            parts.notifier,
        ));

        Self {
            store: parts.store,
            settings: parts.settings,
            metrics: parts.metrics,
            router_pool: None,
            sync,
            reconciler,
            binding,
            jobs,
            periods: parts.jobs,
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
        }
    }

    /// Launch the background jobs. A second call is a no-op.
    pub async fn start(&self) {
        let mut slot = self.scheduler.lock().await;
        if slot.is_none() {
            *slot = Some(Scheduler::start(
                Arc::clone(&self.jobs),
                &self.periods,
                self.cancel.child_token(),
            ));
        }
    }

    /// Stop the jobs, waiting for in-flight runs, then drop router sessions.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
        if let Some(pool) = &self.router_pool {
            pool.close().await;
        }
        info!("portal stopped");
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsProvider> {
        &self.settings
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn sync(&self) -> &HotspotSync {
        &self.sync
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn jobs(&self) -> &Arc<Jobs> {
        &self.jobs
    }

    /// Storage and router reachability.
    pub async fn health(&self) -> Health {
        let database = self.store.health_check().await.map_err(|e| e.to_string());
        let router = match &self.router_pool {
            Some(pool) => pool.health_check().await.map_err(|e| e.to_string()),
            None => Ok(()),
        };
        Health { database, router }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub database: Result<(), String>,
    pub router: Result<(), String>,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        self.database.is_ok() && self.router.is_ok()
    }
}

fn router_pool_config(settings: &Settings, config: &PortalConfig) -> PoolConfig {
    let router = &settings.router;
    let tls = match (&config.router_ca, router.use_ssl) {
        (_, false) => TlsMode::Disabled,
        (Some(ca), true) => TlsMode::CustomCa(ca.clone()),
        (None, true) => TlsMode::DangerAcceptInvalid,
    };
    let transport = TransportConfig {
        host: router.host.clone(),
        port: router.port,
        tls,
        ..TransportConfig::default()
    };
    let credentials = RouterCredentials {
        username: router.username.clone(),
        password: router.password.clone(),
    };
    let mut pool = PoolConfig::new(transport, credentials);
    pool.size = router.pool_size;
    pool.breaker = settings.breaker;
    pool
}

fn build_notifier(
    config: &PortalConfig,
    settings: &Settings,
    metrics: SharedMetrics,
) -> Result<Option<Arc<NotificationDispatcher>>, CoreError> {
    if config.whatsapp.is_none() && config.telegram.is_none() {
        return Ok(None);
    }
    let mut dispatcher = NotificationDispatcher::new(TemplateSet::default(), metrics);
    if let Some(wa) = &config.whatsapp {
        let transport = WhatsAppTransport::new(WhatsAppConfig {
            url: wa.url.clone(),
            token: wa.token.clone(),
            timeout: wa.timeout,
        })?;
        dispatcher = dispatcher.with_transport(Arc::new(transport), settings.breaker);
    }
    if let Some(tg) = &config.telegram {
        let transport = TelegramTransport::new(TelegramConfig {
            bot_token: tg.bot_token.clone(),
            timeout: settings.telegram_timeout,
            api_base: None,
        })?;
        dispatcher = dispatcher.with_transport(Arc::new(transport), settings.breaker);
        if let Some(chat) = &tg.admin_chat_id {
            dispatcher = dispatcher.with_admin_chat(chat.clone());
        }
    }
    Ok(Some(Arc::new(dispatcher)))
}
