// ── Named TTL locks ──
//
// A lock is a key holding a random owner token with a TTL:
// - Acquire: `SET key token NX PX ttl_ms`
// - Release: Lua CAS delete (only when the stored token is ours)
//
// `LockManager` prefers the shared store and falls back to a process-local
// table when the shared store errors. Fallback is reported on the guard so
// callers can count degraded acquisitions.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;

#[async_trait]
pub trait LockStore: Send + Sync + Debug {
    fn kind(&self) -> &'static str;

    /// Single attempt. `Ok(false)` when someone else holds the key.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoreError>;

    /// Delete the key if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<(), CoreError>;
}

// ── Process-local ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LocalLockStore {
    held: DashMap<String, (String, Instant)>,
}

impl LocalLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn release_now(&self, key: &str, token: &str) {
        self.held.remove_if(key, |_, (owner, _)| owner == token);
    }
}

#[async_trait]
impl LockStore for LocalLockStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoreError> {
        let now = Instant::now();
        let mut acquired = false;
        self.held
            .entry(key.to_owned())
            .and_modify(|(owner, expires)| {
                if *expires <= now {
                    token.clone_into(owner);
                    *expires = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                (token.to_owned(), now + ttl)
            });
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), CoreError> {
        self.release_now(key, token);
        Ok(())
    }
}

// ── Redis ───────────────────────────────────────────────────────────

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Shared lock store on Redis. Commands run on the blocking pool with
/// connect/read/write timeouts.
#[derive(Debug, Clone)]
pub struct RedisLockStore {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
}

impl RedisLockStore {
    pub fn open(url: &str, prefix: impl Into<String>, timeout: Duration) -> Result<Self, CoreError> {
        if url.trim().is_empty() {
            return Err(CoreError::Config {
                message: "redis url is empty".into(),
            });
        }
        let client = redis::Client::open(url).map_err(|e| CoreError::Config {
            message: format!("invalid redis url: {e}"),
        })?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            timeout: timeout.max(Duration::from_millis(1)),
        })
    }

    pub async fn ping(&self) -> Result<(), CoreError> {
        self.run(|c| redis::cmd("PING").query::<String>(c)).await?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection_with_timeout(timeout)
                .map_err(map_redis_err)?;
            conn.set_read_timeout(Some(timeout)).map_err(map_redis_err)?;
            conn.set_write_timeout(Some(timeout)).map_err(map_redis_err)?;
            f(&mut conn).map_err(map_redis_err)
        })
        .await
        .map_err(|e| CoreError::LockStore {
            message: format!("redis task failed: {e}"),
        })?
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoreError> {
        let key = self.key(key);
        let token = token.to_owned();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = self
            .run(move |c| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query(c)
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), CoreError> {
        let key = self.key(key);
        let token = token.to_owned();
        let _deleted: i64 = self
            .run(move |c| {
                redis::cmd("EVAL")
                    .arg(RELEASE_SCRIPT)
                    .arg(1)
                    .arg(&key)
                    .arg(&token)
                    .query(c)
            })
            .await?;
        Ok(())
    }
}

fn map_redis_err(e: redis::RedisError) -> CoreError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    let message = if lower.contains("timed out") || lower.contains("timeout") {
        format!("redis timeout: {msg}")
    } else if lower.contains("connection") || lower.contains("broken pipe") {
        format!("redis connection: {msg}")
    } else {
        format!("redis backend: {msg}")
    };
    CoreError::LockStore { message }
}

// ── Manager ─────────────────────────────────────────────────────────

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held lock. Call `release()`; a dropped guard is released in the
/// background, and the TTL bounds anything that slips through.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
    store: Arc<dyn LockStore>,
    degraded: bool,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Held in the process-local table because the shared store failed.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn backend(&self) -> &'static str {
        self.store.kind()
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.release(&self.key, &self.token).await {
            warn!(key = %self.key, error = %e, "lock release failed; TTL will expire it");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            let _ = store.release(&key, &token).await;
        });
    }
}

#[derive(Debug)]
pub struct LockManager {
    shared: Option<Arc<dyn LockStore>>,
    local: Arc<LocalLockStore>,
}

impl LockManager {
    pub fn new(shared: Option<Arc<dyn LockStore>>) -> Self {
        Self {
            shared,
            local: Arc::new(LocalLockStore::new()),
        }
    }

    /// Process-local locking only.
    pub fn local() -> Self {
        Self::new(None)
    }

    pub fn has_shared_store(&self) -> bool {
        self.shared.is_some()
    }

    /// One attempt against the shared store (local when absent or failing).
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        let token = Uuid::new_v4().to_string();
        self.attempt(key, &token, ttl).await
    }

    /// Retry until `wait` elapses, then fail with `SyncBusy`.
    pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Result<LockGuard, CoreError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.attempt(key, &token, ttl).await {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::SyncBusy { lock: key.to_owned() });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn attempt(&self, key: &str, token: &str, ttl: Duration) -> Option<LockGuard> {
        if let Some(shared) = &self.shared {
            match shared.try_acquire(key, token, ttl).await {
                Ok(true) => return Some(self.guard(key, token, Arc::clone(shared), false)),
                Ok(false) => return None,
                Err(e) => warn!(key, backend = shared.kind(), error = %e, "shared lock store failed; using local lock"),
            }
        }
        let degraded = self.shared.is_some();
        match self.local.try_acquire(key, token, ttl).await {
            Ok(true) => {
                debug!(key, degraded, "local lock acquired");
                let local: Arc<dyn LockStore> = self.local.clone();
                Some(self.guard(key, token, local, degraded))
            }
            _ => None,
        }
    }

    #[allow(clippy::unused_self)]
    fn guard(&self, key: &str, token: &str, store: Arc<dyn LockStore>, degraded: bool) -> LockGuard {
        LockGuard {
            key: key.to_owned(),
            token: token.to_owned(),
            store,
            degraded,
            released: false,
        }
    }
}
