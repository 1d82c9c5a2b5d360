//! Static configuration for the hotspot portal binary.
//!
//! One TOML file plus `PORTAL_`-prefixed environment overrides, credential
//! resolution (env + keyring + plaintext), and translation to
//! `hotspot_core::PortalConfig`. Router and policy knobs are not here: they
//! are dynamic settings read by the core from the database.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use hotspot_core::{
    DatabaseConfig, JobPeriods, PaymentConfig, PortalConfig, RedisConfig, TelegramBotConfig,
    WhatsAppGatewayConfig,
};

/// Keyring service name every stored secret lives under.
pub const KEYRING_SERVICE: &str = "hotspot-portal";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no value found for secret '{secret}' (checked env, keyring and config file)")]
    MissingSecret { secret: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Read dynamic settings missing from the database from process env.
    #[serde(default = "default_true")]
    pub settings_from_env: bool,

    #[serde(default)]
    pub server: ServerSection,

    /// Absent runs on the in-memory store.
    pub database: Option<DatabaseSection>,

    /// Absent keeps locks process-local.
    pub redis: Option<RedisSection>,

    #[serde(default)]
    pub payment: PaymentSection,

    pub whatsapp: Option<WhatsAppSection>,

    pub telegram: Option<TelegramSection>,

    #[serde(default)]
    pub router: RouterSection,

    #[serde(default)]
    pub jobs: JobPeriods,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_from_env: true,
            server: ServerSection::default(),
            database: None,
            redis: None,
            payment: PaymentSection::default(),
            whatsapp: None,
            telegram: None,
            router: RouterSection::default(),
            jobs: JobPeriods::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Seconds to wait for in-flight requests on shutdown.
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_format: default_log_format(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseSection {
    /// Connection URL (plaintext; prefer `url_env` or the keyring).
    pub url: Option<String>,

    /// Environment variable holding the URL.
    pub url_env: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSection {
    pub url: Option<String>,
    pub url_env: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentSection {
    /// Provider server key (plaintext; prefer `server_key_env` or keyring).
    pub server_key: Option<String>,

    #[serde(default = "default_server_key_env")]
    pub server_key_env: Option<String>,

    #[serde(default)]
    pub production: bool,

    /// Override the provider API base (sandbox proxies, tests).
    pub base_url: Option<String>,
}

impl Default for PaymentSection {
    fn default() -> Self {
        Self {
            server_key: None,
            server_key_env: default_server_key_env(),
            production: false,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppSection {
    pub url: String,
    pub token: Option<String>,
    pub token_env: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub bot_token_env: Option<String>,

    /// Chat that receives operator alerts.
    pub admin_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouterSection {
    /// CA bundle for RouterOS API-SSL; without it self-signed certificates
    /// are accepted.
    pub ca_cert: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_grace() -> u64 {
    10
}
fn default_max_connections() -> u32 {
    10
}
fn default_acquire_timeout() -> u64 {
    5
}
fn default_key_prefix() -> String {
    "hotspot:".into()
}
fn default_redis_timeout() -> u64 {
    500
}
#[allow(clippy::unnecessary_wraps)]
fn default_server_key_env() -> Option<String> {
    Some("MIDTRANS_SERVER_KEY".into())
}
fn default_http_timeout() -> u64 {
    10
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("id", "lpsaring", "hotspot-portal").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hotspot-portal");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load defaults, then the TOML file (if present), then `PORTAL_` env.
/// Nested keys use a double underscore: `PORTAL_DATABASE__MAX_CONNECTIONS`.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("PORTAL_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Write a starter file with every default spelled out. Refuses to
/// overwrite an existing file.
pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::Validation {
            field: "path".into(),
            reason: format!("{} already exists", path.display()),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Looks secrets up in order: the named env var, the system keyring entry
/// `hotspot-portal/<name>`, then the plaintext value from the file.
pub struct SecretResolver<F> {
    lookup: F,
    keyring: bool,
}

impl<F> std::fmt::Debug for SecretResolver<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResolver")
            .field("keyring", &self.keyring)
            .finish_non_exhaustive()
    }
}

impl SecretResolver<fn(&str) -> Option<String>> {
    /// Process environment and the platform keyring.
    pub fn system() -> Self {
        Self {
            lookup: |name| std::env::var(name).ok(),
            keyring: true,
        }
    }
}

impl<F: Fn(&str) -> Option<String>> SecretResolver<F> {
    /// Custom env lookup, keyring disabled.
    pub fn with_lookup(lookup: F) -> Self {
        Self {
            lookup,
            keyring: false,
        }
    }

    pub fn resolve(
        &self,
        name: &str,
        env_var: Option<&str>,
        plaintext: Option<&str>,
    ) -> Option<SecretString> {
        // 1. Env var named by the config
        if let Some(value) = env_var.and_then(|var| (self.lookup)(var)) {
            return Some(SecretString::from(value));
        }

        // 2. System keyring
        if self.keyring {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, name) {
                if let Ok(secret) = entry.get_password() {
                    return Some(SecretString::from(secret));
                }
            }
        }

        // 3. Plaintext in config
        plaintext.map(|value| SecretString::from(value.to_owned()))
    }

    pub fn require(
        &self,
        name: &str,
        env_var: Option<&str>,
        plaintext: Option<&str>,
    ) -> Result<SecretString, ConfigError> {
        self.resolve(name, env_var, plaintext)
            .ok_or_else(|| ConfigError::MissingSecret {
                secret: name.into(),
            })
    }
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Resolve every secret and build the core's runtime config.
    pub fn to_portal_config<F: Fn(&str) -> Option<String>>(
        &self,
        secrets: &SecretResolver<F>,
    ) -> Result<PortalConfig, ConfigError> {
        let database = self
            .database
            .as_ref()
            .map(|db| {
                let url = secrets.require("database-url", db.url_env.as_deref(), db.url.as_deref())?;
                if db.max_connections == 0 {
                    return Err(invalid("database.max_connections", "must be at least 1"));
                }
                Ok(DatabaseConfig {
                    url,
                    max_connections: db.max_connections,
                    acquire_timeout: Duration::from_secs(db.acquire_timeout_secs),
                })
            })
            .transpose()?;

        let redis = self
            .redis
            .as_ref()
            .map(|r| {
                let url = secrets.require("redis-url", r.url_env.as_deref(), r.url.as_deref())?;
                Ok::<_, ConfigError>(RedisConfig {
                    url,
                    key_prefix: r.key_prefix.clone(),
                    timeout: Duration::from_millis(r.timeout_ms),
                })
            })
            .transpose()?;

        let server_key = secrets.require(
            "payment-server-key",
            self.payment.server_key_env.as_deref(),
            self.payment.server_key.as_deref(),
        )?;
        let base_url = self
            .payment
            .base_url
            .as_deref()
            .map(|raw| parse_url("payment.base_url", raw))
            .transpose()?;

        let whatsapp = self
            .whatsapp
            .as_ref()
            .map(|wa| {
                Ok::<_, ConfigError>(WhatsAppGatewayConfig {
                    url: parse_url("whatsapp.url", &wa.url)?,
                    token: secrets.require(
                        "whatsapp-token",
                        wa.token_env.as_deref(),
                        wa.token.as_deref(),
                    )?,
                    timeout: Duration::from_secs(wa.timeout_secs),
                })
            })
            .transpose()?;

        let telegram = self
            .telegram
            .as_ref()
            .map(|tg| {
                Ok::<_, ConfigError>(TelegramBotConfig {
                    bot_token: secrets.require(
                        "telegram-bot-token",
                        tg.bot_token_env.as_deref(),
                        tg.bot_token.as_deref(),
                    )?,
                    admin_chat_id: tg.admin_chat_id.clone(),
                })
            })
            .transpose()?;

        if let Some(ca) = &self.router.ca_cert {
            if !ca.is_file() {
                return Err(invalid(
                    "router.ca_cert",
                    &format!("{} is not a readable file", ca.display()),
                ));
            }
        }

        Ok(PortalConfig {
            database,
            redis,
            payment: PaymentConfig {
                server_key,
                production: self.payment.production,
                base_url,
            },
            whatsapp,
            telegram,
            router_ca: self.router.ca_cert.clone(),
            settings_from_env: self.settings_from_env,
            jobs: self.jobs.clone(),
        })
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(field, &format!("invalid URL: {raw}")))
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}
