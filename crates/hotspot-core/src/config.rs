// ── Runtime portal configuration ──
//
// Static wiring for one portal process: where the database and lock store
// live and which payment and messaging providers to talk to. Built by the
// config crate or the binary and handed to `Portal::build`; core never
// reads config files. Router and policy knobs are dynamic settings and
// live in `Settings` instead.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::jobs::JobPeriods;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: SecretString,
    /// Prepended to every lock key.
    pub key_prefix: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub server_key: SecretString,
    pub production: bool,
    /// Override both provider bases (tests, proxies).
    pub base_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppGatewayConfig {
    pub url: Url,
    pub token: SecretString,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramBotConfig {
    pub bot_token: SecretString,
    /// Chat that receives operator alerts.
    pub admin_chat_id: Option<String>,
}

/// Everything `Portal::build` needs.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// `None` runs on the in-memory store (demos, tests).
    pub database: Option<DatabaseConfig>,
    /// `None` keeps locks process-local.
    pub redis: Option<RedisConfig>,
    pub payment: PaymentConfig,
    pub whatsapp: Option<WhatsAppGatewayConfig>,
    pub telegram: Option<TelegramBotConfig>,
    /// CA bundle for router TLS; without it self-signed certificates are
    /// accepted.
    pub router_ca: Option<PathBuf>,
    /// Fall back to process env for settings missing from the database.
    pub settings_from_env: bool,
    pub jobs: JobPeriods,
}

impl PortalConfig {
    /// In-memory store, local locks, no messaging.
    pub fn local(payment: PaymentConfig) -> Self {
        Self {
            database: None,
            redis: None,
            payment,
            whatsapp: None,
            telegram: None,
            router_ca: None,
            settings_from_env: true,
            jobs: JobPeriods::default(),
        }
    }
}
