//! CLI error types with miette diagnostics.
//!
//! Maps configuration and engine failures into user-facing errors with
//! actionable help text and a stable exit code.

use hotspot_config::ConfigError;
use hotspot_core::{CoreError, ErrorKind};
use miette::Diagnostic;
use thiserror::Error;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const CONFIG: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration is invalid")]
    #[diagnostic(
        code(hotspot::config),
        help(
            "Check the file at {path}.\n\
             Create a starter file with: hotspot-portal init-config"
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    // ── Engine ───────────────────────────────────────────────────────
    #[error("Router is unreachable")]
    #[diagnostic(
        code(hotspot::router_unreachable),
        help(
            "Check MIKROTIK_HOST / MIKROTIK_PORT and that the API service is enabled.\n\
             Try: hotspot-portal router-check"
        )
    )]
    RouterUnreachable {
        #[source]
        source: CoreError,
    },

    #[error("{0}")]
    #[diagnostic(code(hotspot::not_found))]
    NotFound(#[source] CoreError),

    #[error("{0}")]
    #[diagnostic(code(hotspot::conflict))]
    Conflict(#[source] CoreError),

    #[error("{0}")]
    #[diagnostic(code(hotspot::engine))]
    Engine(#[source] CoreError),

    // ── Input ────────────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hotspot::validation))]
    Validation { field: String, reason: String },

    #[error("Health check failed: {summary}")]
    #[diagnostic(code(hotspot::unhealthy))]
    Unhealthy { summary: String },

    #[error(transparent)]
    #[diagnostic(code(hotspot::io))]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::RouterUnreachable { .. } | Self::Unhealthy { .. } => exit_code::CONNECTION,
            Self::NotFound(_) => exit_code::NOT_FOUND,
            Self::Conflict(_) => exit_code::CONFLICT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Engine(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        if err.is_gateway_connection() {
            return Self::RouterUnreachable { source: err };
        }
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(err),
            ErrorKind::Conflict => Self::Conflict(err),
            ErrorKind::Validation => Self::Validation {
                field: match &err {
                    CoreError::Validation {
                        field: Some(field), ..
                    } => field.clone(),
                    _ => "input".into(),
                },
                reason: err.to_string(),
            },
            _ => Self::Engine(err),
        }
    }
}
