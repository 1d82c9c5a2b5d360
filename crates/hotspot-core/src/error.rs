// ── Core error types ──
//
// Typed failures returned by every core service. Only the HTTP adapter
// turns these into response envelopes; `kind()` is the stable mapping key.
// The `From` impls translate router, database and HTTP client errors into
// domain variants so callers never match on transport details.

use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Status token carried by a forbidden response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ForbiddenStatus {
    Inactive,
    Blocked,
    DemoDisabled,
    NotOnHotspot,
    MacMismatch,
}

/// Coarse classification used for HTTP status mapping and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    RateLimit,
    External,
    Integrity,
    Internal,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Request errors ───────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Authentication required: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden ({status}): {message}")]
    Forbidden {
        status: ForbiddenStatus,
        message: String,
    },

    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// An order effect's marker row already exists.
    #[error("Effect already applied: {key}")]
    AlreadyApplied { key: String },

    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Collaborator errors ──────────────────────────────────────────
    /// Router unreachable (`connection = true`) or command rejected.
    #[error("Gateway error: {message}")]
    Gateway { message: String, connection: bool },

    #[error("Payment provider error: {message}")]
    Payment {
        message: String,
        status: Option<u16>,
    },

    #[error("Messaging error: {message}")]
    Messaging { message: String },

    #[error("Hotspot sync already running for {lock}")]
    SyncBusy { lock: String },

    #[error("Lock store error: {message}")]
    LockStore { message: String },

    // ── Persistence errors ───────────────────────────────────────────
    /// Unique or check constraint violated.
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    // ── Configuration / internal ─────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(entity_type: &'static str, identifier: impl ToString) -> Self {
        Self::NotFound {
            entity_type,
            identifier: identifier.to_string(),
        }
    }

    pub fn forbidden(status: ForbiddenStatus, message: impl Into<String>) -> Self {
        Self::Forbidden {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Unauthorized { .. } => ErrorKind::Auth,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::SyncBusy { .. } | Self::AlreadyApplied { .. } => {
                ErrorKind::Conflict
            }
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Gateway { .. }
            | Self::Payment { .. }
            | Self::Messaging { .. }
            | Self::LockStore { .. } => ErrorKind::External,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Storage { .. } | Self::Config { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Router-level connection failure (sync aborts on these).
    pub fn is_gateway_connection(&self) -> bool {
        matches!(self, Self::Gateway { connection: true, .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

// ── Conversion from collaborator errors ──────────────────────────────

impl From<hotspot_routeros::Error> for CoreError {
    fn from(err: hotspot_routeros::Error) -> Self {
        CoreError::Gateway {
            connection: err.is_connection(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound {
                entity_type: "row",
                identifier: String::new(),
            },
            sqlx::Error::Database(ref db)
                if db.is_unique_violation() || db.is_check_violation() =>
            {
                CoreError::Integrity {
                    message: db.message().to_owned(),
                }
            }
            other => CoreError::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON error: {err}"))
    }
}
