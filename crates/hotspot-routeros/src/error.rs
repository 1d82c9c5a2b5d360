use thiserror::Error;

/// Top-level error type for the `hotspot-routeros` crate.
///
/// Separates connection-level failures (socket, TLS, framing, login,
/// open breaker) from command-level failures (`!trap` replies). The pool
/// retries only the former; `hotspot-core` maps both into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// TCP connect or socket I/O failure.
    #[error("RouterOS I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or read exceeded the configured timeout.
    #[error("RouterOS request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The router closed the session with `!fatal`.
    #[error("RouterOS session closed: {message}")]
    Fatal { message: String },

    /// Malformed word or sentence on the wire.
    #[error("RouterOS protocol error: {0}")]
    Protocol(String),

    /// Login rejected.
    #[error("RouterOS login failed: {message}")]
    Authentication { message: String },

    /// The router only offers the pre-6.43 challenge login.
    #[error("RouterOS requested legacy challenge login, which is not supported")]
    UnsupportedLogin,

    /// Connect attempts are short-circuited after repeated failures.
    #[error("RouterOS circuit open for {name} -- retry after {retry_after_secs}s")]
    CircuitOpen { name: String, retry_after_secs: u64 },

    /// No session became available within the pool's acquire timeout.
    #[error("RouterOS pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    // ── Command ─────────────────────────────────────────────────────
    /// The router answered a command with `!trap`.
    #[error("RouterOS rejected {command}: {message}")]
    Trap {
        command: String,
        message: String,
        category: Option<u8>,
    },

    /// A typed row was missing a required attribute.
    #[error("RouterOS row missing attribute '{attribute}' in {path}")]
    MissingAttribute { path: String, attribute: String },
}

impl Error {
    /// Returns `true` if the failure concerns the session itself rather
    /// than the command, so a fresh session may succeed.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout { .. }
                | Self::Tls(_)
                | Self::Fatal { .. }
                | Self::Protocol(_)
                | Self::CircuitOpen { .. }
                | Self::PoolExhausted { .. }
        )
    }

    /// Returns `true` if retrying the same command on a new session is
    /// worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout { .. } | Self::Fatal { .. } | Self::Protocol(_)
        )
    }

    /// Returns `true` for `!trap` replies that mean the addressed row is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Trap { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("no such item") || lower.contains("not found")
            }
            _ => false,
        }
    }

    /// Returns `true` for `!trap` replies caused by an existing duplicate.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Trap { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("already have") || lower.contains("already exists")
            }
            _ => false,
        }
    }
}
