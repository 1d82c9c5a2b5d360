// ── serve ──
//
// Starts the jobs, serves HTTP until ctrl-c, SIGTERM or portal cancellation,
// then stops the jobs within the configured grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hotspot_config::Config;
use hotspot_core::{CoreError, SharedMetrics};
use hotspot_portal::{AppState, PrometheusMetrics, create_router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{GlobalOpts, ServeArgs};
use crate::error::CliError;

pub async fn handle(args: &ServeArgs, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let metrics = Arc::new(
        PrometheusMetrics::new().map_err(|e| CliError::Engine(CoreError::Internal(e.to_string())))?,
    );
    let shared: SharedMetrics = metrics.clone();
    let portal = Arc::new(super::build_portal(config, global, shared).await?);

    if args.no_jobs {
        info!("background jobs disabled");
    } else {
        portal.start().await;
    }

    let bind = args.bind.unwrap_or(config.server.bind);
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "listening");

    let app = create_router(AppState::new(Arc::clone(&portal), metrics));
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(portal.cancellation()))
    .await;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if tokio::time::timeout(grace, portal.shutdown()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "jobs still running after grace period");
    }
    Ok(served?)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
        () = cancel.cancelled() => {}
    }
    info!("shutdown requested");
}
