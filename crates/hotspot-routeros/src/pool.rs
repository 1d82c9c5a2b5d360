// Session pool
//
// At most `size` sessions exist at once (semaphore permits). Idle sessions
// are health-checked on borrow once they sat unused past
// `health_check_after`. Connect failures feed a circuit breaker; transient
// command failures are retried on a fresh session up to `max_retries`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::command::Command;
use crate::error::Error;
use crate::session::{CommandOutput, Session};
use crate::transport::{RouterCredentials, TransportConfig};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub transport: TransportConfig,
    pub credentials: RouterCredentials,
    pub size: usize,
    pub acquire_timeout: Duration,
    pub health_check_after: Duration,
    pub max_retries: u32,
    pub breaker: BreakerConfig,
}

impl PoolConfig {
    pub fn new(transport: TransportConfig, credentials: RouterCredentials) -> Self {
        Self {
            transport,
            credentials,
            size: 3,
            acquire_timeout: Duration::from_secs(10),
            health_check_after: Duration::from_secs(30),
            max_retries: 1,
            breaker: BreakerConfig::default(),
        }
    }
}

pub struct RouterOsPool {
    config: PoolConfig,
    idle: Mutex<Vec<Session>>,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for RouterOsPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOsPool")
            .field("endpoint", &self.config.transport.endpoint())
            .field("size", &self.config.size)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl RouterOsPool {
    pub fn new(config: PoolConfig) -> Self {
        let size = config.size.max(1);
        let breaker = CircuitBreaker::new(
            format!("routeros:{}", config.transport.endpoint()),
            config.breaker,
        );
        Self {
            config,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            breaker,
        }
    }

    pub fn endpoint(&self) -> String {
        self.config.transport.endpoint()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run a command, retrying transient failures on a fresh session.
    pub async fn execute(&self, cmd: &Command) -> Result<CommandOutput, Error> {
        let mut attempt = 0;
        loop {
            match self.execute_once(cmd).await {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(command = %cmd.path(), attempt, error = %e, "retrying RouterOS command");
                }
                other => return other,
            }
        }
    }

    async fn execute_once(&self, cmd: &Command) -> Result<CommandOutput, Error> {
        let started = Instant::now();
        let _permit = tokio::time::timeout(self.config.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| Error::PoolExhausted {
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|_| Error::PoolExhausted { waited_ms: 0 })?;

        let mut session = self.checkout().await?;
        match session.execute(cmd).await {
            Ok(output) => {
                self.checkin(session).await;
                Ok(output)
            }
            // framing state unknown: drop the session
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                self.checkin(session).await;
                Err(e)
            }
        }
    }

    async fn checkout(&self) -> Result<Session, Error> {
        loop {
            let candidate = self.idle.lock().await.pop();
            let Some(mut session) = candidate else {
                return self.connect().await;
            };
            if session.idle_for() < self.config.health_check_after {
                return Ok(session);
            }
            match session.ping().await {
                Ok(()) => return Ok(session),
                Err(e) => debug!(error = %e, "discarding stale RouterOS session"),
            }
        }
    }

    async fn checkin(&self, session: Session) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.size.max(1) {
            idle.push(session);
        }
    }

    async fn connect(&self) -> Result<Session, Error> {
        if let Err(remaining) = self.breaker.check() {
            return Err(Error::CircuitOpen {
                name: self.breaker.name().to_owned(),
                retry_after_secs: remaining.as_secs(),
            });
        }

        match Session::open(&self.config.transport, &self.config.credentials).await {
            Ok(session) => {
                self.breaker.record_success();
                Ok(session)
            }
            Err(e) => {
                if e.is_connection() {
                    self.breaker.record_failure();
                }
                warn!(endpoint = %self.endpoint(), error = %e, "RouterOS connect failed");
                Err(e)
            }
        }
    }

    /// Drop every idle session.
    pub async fn close(&self) {
        let mut idle = self.idle.lock().await;
        let count = idle.len();
        idle.clear();
        debug!(closed = count, "RouterOS pool closed");
    }

    /// Round-trip a cheap command through the pool.
    pub async fn health_check(&self) -> Result<(), Error> {
        self.execute(&Command::print("/system/identity")).await.map(|_| ())
    }
}
