// ── Dynamic settings ──
//
// Operators edit settings at runtime (admin UI writes the
// `application_settings` table). Lookup order per key: database row,
// process environment, compiled default. The parsed snapshot lives in an
// `ArcSwap` so readers never block; `refresh()` swaps in a new snapshot.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{FixedOffset, Offset, Utc};
use hotspot_routeros::BreakerConfig;
use ipnet::IpNet;
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::policy::{AccessStatus, PolicyConfig, default_bypass_statuses};
use crate::store::Store;

/// Router connection as configured in settings.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: SecretString,
    pub use_ssl: bool,
    pub plain_text_login: bool,
    pub pool_size: usize,
}

/// Hotspot user profile name per access status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileNames {
    pub active: String,
    pub fup: String,
    pub habis: String,
    pub expired: String,
    pub unlimited: String,
    pub inactive: String,
    pub blocked: String,
}

/// Firewall address-list name per access status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLists {
    /// Shared by `active` and `unlimited`.
    pub bypass: String,
    pub fup: String,
    pub habis: String,
    pub expired: String,
    pub inactive: String,
    pub blocked: String,
}

impl AddressLists {
    pub fn for_status(&self, status: AccessStatus) -> &str {
        match status {
            AccessStatus::Active | AccessStatus::Unlimited => &self.bypass,
            AccessStatus::Fup => &self.fup,
            AccessStatus::Habis => &self.habis,
            AccessStatus::Expired => &self.expired,
            AccessStatus::Inactive => &self.inactive,
            AccessStatus::Blocked => &self.blocked,
        }
    }

    /// Every distinct status list (the set a user is removed from).
    pub fn all(&self) -> Vec<String> {
        let mut lists = vec![
            self.bypass.clone(),
            self.fup.clone(),
            self.habis.clone(),
            self.expired.clone(),
            self.inactive.clone(),
            self.blocked.clone(),
        ];
        lists.sort();
        lists.dedup();
        lists
    }
}

/// Parsed snapshot of every dynamic setting the core reads.
#[derive(Debug, Clone)]
pub struct Settings {
    pub policy: PolicyConfig,
    pub debt_limit_mb: i64,
    /// Price of 1 GB of debt, in minor currency units.
    pub debt_price_per_gb: i64,
    pub payment_expiry_minutes: u32,
    /// Remaining-quota watermarks that trigger a low-quota notice.
    pub quota_notice_mb: Vec<i64>,
    pub expiry_notice_days: i64,

    pub router: RouterSettings,
    pub profiles: ProfileNames,
    pub address_lists: AddressLists,
    pub managed_comment_prefix: String,
    pub hotspot_server: Option<String>,
    pub dhcp_static_lease_enabled: bool,
    pub dhcp_lease_server_name: Option<String>,

    pub hotspot_client_cidrs: Vec<IpNet>,
    pub trusted_proxy_cidrs: Vec<IpNet>,

    pub breaker: BreakerConfig,
    pub midtrans_timeout: Duration,
    pub telegram_timeout: Duration,

    pub pending_grace: Duration,
    pub sync_lock_ttl: Duration,
    pub sync_lock_wait: Duration,
    pub effect_lock_ttl: Duration,
    pub utc_offset: FixedOffset,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    /// Build a snapshot, asking `lookup` for each key's raw value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let r = Reader { lookup: &lookup };
        let offset_hours = r.int("APP_UTC_OFFSET_HOURS", 7).clamp(-12, 14);
        let utc_offset = i32::try_from(offset_hours * 3600)
            .ok()
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());

        let bypass = r.string("MIKROTIK_BYPASS_ADDRESS_LIST", "bypass_client");
        let inactive_profile = r.string("MIKROTIK_INACTIVE_PROFILE", "inactive");

        Self {
            policy: PolicyConfig {
                fup_threshold_mb: r.int("QUOTA_FUP_THRESHOLD_MB", 3072),
                bypass_statuses: r
                    .list::<AccessStatus>("HOTSPOT_BYPASS_STATUSES")
                    .unwrap_or_else(default_bypass_statuses),
            },
            debt_limit_mb: r.int("QUOTA_DEBT_LIMIT_MB", 0).max(0),
            debt_price_per_gb: r.int("QUOTA_DEBT_PRICE_PER_GB", 5_000).max(1),
            payment_expiry_minutes: u32::try_from(r.int("PAYMENT_EXPIRY_MINUTES", 60).clamp(5, 1440))
                .unwrap_or(60),
            quota_notice_mb: {
                let mut marks = r
                    .list::<i64>("QUOTA_NOTIFY_REMAINING_MB")
                    .unwrap_or_else(|| vec![500, 100]);
                marks.retain(|m| *m > 0);
                marks.sort_unstable_by(|a, b| b.cmp(a));
                marks.dedup();
                marks
            },
            expiry_notice_days: r.int("QUOTA_EXPIRY_NOTIFY_DAYS", 3).max(0),
            router: RouterSettings {
                host: r.string("MIKROTIK_HOST", "192.168.88.1"),
                port: r.opt_parse("MIKROTIK_PORT"),
                username: r.string("MIKROTIK_USERNAME", "admin"),
                password: SecretString::from(r.string("MIKROTIK_PASSWORD", "")),
                use_ssl: r.flag("MIKROTIK_USE_SSL", false),
                plain_text_login: r.flag("MIKROTIK_PLAIN_TEXT_LOGIN", true),
                pool_size: usize::try_from(r.int("MIKROTIK_POOL_SIZE", 3).clamp(1, 32)).unwrap_or(3),
            },
            profiles: ProfileNames {
                active: r.string("MIKROTIK_ACTIVE_PROFILE", "active"),
                fup: r.string("MIKROTIK_FUP_PROFILE", "fup"),
                habis: r.string("MIKROTIK_HABIS_PROFILE", "habis"),
                expired: r.string("MIKROTIK_EXPIRED_PROFILE", "expired"),
                unlimited: r.string("MIKROTIK_UNLIMITED_PROFILE", "unlimited"),
                blocked: r.string("MIKROTIK_BLOCKED_PROFILE", &inactive_profile),
                inactive: inactive_profile,
            },
            address_lists: AddressLists {
                fup: r.string("MIKROTIK_ADDRESS_LIST_FUP", "fup_client"),
                habis: r.string("MIKROTIK_ADDRESS_LIST_HABIS", "habis_client"),
                expired: r.string("MIKROTIK_ADDRESS_LIST_EXPIRED", "expired_client"),
                inactive: r.string("MIKROTIK_ADDRESS_LIST_INACTIVE", "inactive_client"),
                blocked: r.string("MIKROTIK_ADDRESS_LIST_BLOCKED", "blocked_client"),
                bypass,
            },
            managed_comment_prefix: r.string("MIKROTIK_MANAGED_COMMENT_PREFIX", "authorized"),
            hotspot_server: r.opt_string("MIKROTIK_HOTSPOT_SERVER"),
            dhcp_static_lease_enabled: r.flag("MIKROTIK_DHCP_STATIC_LEASE_ENABLED", false),
            dhcp_lease_server_name: r.opt_string("MIKROTIK_DHCP_LEASE_SERVER_NAME"),
            hotspot_client_cidrs: r
                .list::<IpNet>("HOTSPOT_CLIENT_IP_CIDRS")
                .unwrap_or_else(|| parse_cidrs("172.16.2.0/23")),
            trusted_proxy_cidrs: r
                .list::<IpNet>("TRUSTED_PROXY_CIDRS")
                .unwrap_or_else(|| parse_cidrs("127.0.0.1/32,::1/128")),
            breaker: BreakerConfig {
                failure_threshold: u32::try_from(r.int("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5).max(1))
                    .unwrap_or(5),
                reset_timeout: r.secs("CIRCUIT_BREAKER_RESET_SECONDS", 60),
                half_open_successes: u32::try_from(r.int("CIRCUIT_BREAKER_HALF_OPEN_SUCCESS", 1).max(1))
                    .unwrap_or(1),
            },
            midtrans_timeout: r.secs("MIDTRANS_HTTP_TIMEOUT_SECONDS", 15),
            telegram_timeout: r.secs("TELEGRAM_HTTP_TIMEOUT_SECONDS", 10),
            pending_grace: r.secs("TRANSACTION_PENDING_GRACE_SECONDS", 120),
            sync_lock_ttl: r.secs("HOTSPOT_SYNC_LOCK_TTL_SECONDS", 60),
            sync_lock_wait: r.secs("HOTSPOT_SYNC_LOCK_WAIT_SECONDS", 10),
            effect_lock_ttl: r.secs("TXN_EFFECT_LOCK_TTL_SECONDS", 120),
            utc_offset,
        }
    }
}

fn parse_cidrs(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

struct Reader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Reader<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_owned())
    }

    fn opt_string(&self, key: &str) -> Option<String> {
        self.raw(key)
    }

    fn opt_parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable setting");
                None
            }
        }
    }

    fn int(&self, key: &str, default: i64) -> i64 {
        self.opt_parse(key).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.opt_parse(key).unwrap_or(default))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                warn!(key, value = other, "ignoring unparsable boolean setting");
                default
            }
            None => default,
        }
    }

    /// Comma list; `None` when unset or when any element fails to parse.
    fn list<T: FromStr>(&self, key: &str) -> Option<Vec<T>> {
        let raw = self.raw(key)?;
        let parsed: Result<Vec<T>, _> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect();
        match parsed {
            Ok(values) => Some(values),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable list setting");
                None
            }
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

/// Cached settings with explicit refresh.
pub struct SettingsProvider {
    store: Option<Arc<dyn Store>>,
    use_env: bool,
    cache: ArcSwap<Settings>,
}

impl std::fmt::Debug for SettingsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsProvider")
            .field("use_env", &self.use_env)
            .finish_non_exhaustive()
    }
}

impl SettingsProvider {
    /// Database-backed provider with env fallback. Starts from env + defaults
    /// until the first `refresh()`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::from_store(store, true)
    }

    /// Database-backed provider; `use_env` controls the env fallback.
    pub fn from_store(store: Arc<dyn Store>, use_env: bool) -> Self {
        let initial = if use_env {
            Settings::from_lookup(|key| std::env::var(key).ok())
        } else {
            Settings::default()
        };
        Self {
            store: Some(store),
            use_env,
            cache: ArcSwap::from_pointee(initial),
        }
    }

    /// Provider that always serves `settings`; `refresh()` is a no-op.
    pub fn fixed(settings: Settings) -> Self {
        Self {
            store: None,
            use_env: false,
            cache: ArcSwap::from_pointee(settings),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.cache.load_full()
    }

    /// Reload from the database and swap the snapshot.
    pub async fn refresh(&self) -> Result<Arc<Settings>, CoreError> {
        let Some(store) = &self.store else {
            return Ok(self.current());
        };
        let rows: HashMap<String, String> = store.load_settings().await?;
        let use_env = self.use_env;
        let settings = Settings::from_lookup(|key| {
            rows.get(key)
                .cloned()
                .or_else(|| use_env.then(|| std::env::var(key).ok()).flatten())
        });
        debug!(keys = rows.len(), "settings refreshed");
        self.cache.store(Arc::new(settings));
        Ok(self.current())
    }

    /// Swap in a snapshot directly (admin updates, tests).
    pub fn replace(&self, settings: Settings) {
        self.cache.store(Arc::new(settings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.policy.fup_threshold_mb, 3072);
        assert_eq!(s.debt_limit_mb, 0);
        assert_eq!(s.quota_notice_mb, vec![500, 100]);
        assert_eq!(s.payment_expiry_minutes, 60);
        assert_eq!(s.router.pool_size, 3);
        assert_eq!(s.managed_comment_prefix, "authorized");
        assert_eq!(s.profiles.blocked, "inactive");
        assert_eq!(s.utc_offset.local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn overrides_and_bad_values() {
        let s = with(&[
            ("QUOTA_FUP_THRESHOLD_MB", "1024"),
            ("QUOTA_DEBT_LIMIT_MB", "500"),
            ("HOTSPOT_BYPASS_STATUSES", "active, unlimited"),
            ("MIKROTIK_POOL_SIZE", "not-a-number"),
            ("MIKROTIK_USE_SSL", "yes"),
            ("HOTSPOT_CLIENT_IP_CIDRS", "10.10.0.0/16,10.20.0.0/16"),
        ]);
        assert_eq!(s.policy.fup_threshold_mb, 1024);
        assert_eq!(s.debt_limit_mb, 500);
        assert_eq!(
            s.policy.bypass_statuses,
            vec![AccessStatus::Active, AccessStatus::Unlimited]
        );
        assert_eq!(s.router.pool_size, 3);
        assert!(s.router.use_ssl);
        assert_eq!(s.hotspot_client_cidrs.len(), 2);
    }

    #[test]
    fn address_lists_collapse_shared_names() {
        let s = with(&[("MIKROTIK_ADDRESS_LIST_FUP", "bypass_client")]);
        assert_eq!(s.address_lists.for_status(AccessStatus::Unlimited), "bypass_client");
        assert_eq!(s.address_lists.all().len(), 5);
    }
}
