use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;

use recon_backend::{build_router, config, middleware, AppState};

/// How long running scans get to record their cancellation on shutdown.
const SCAN_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first
    let config = config::Settings::new().context("failed to load configuration")?;

    middleware::init_logging(&config.log_level, &config.log_format)
        .context("failed to initialize logging")?;

    tracing::info!("Starting recon backend v{}", env!("CARGO_PKG_VERSION"));

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_address))?;
    let app_state = AppState::new(config)
        .await
        .context("failed to initialize application state")?;
    let scan_manager = app_state.scan_manager.clone();

    let recovery = scan_manager
        .recover_interrupted()
        .await
        .context("startup recovery failed")?;
    tracing::info!(
        interrupted = recovery.interrupted,
        resubmitted = recovery.resubmitted,
        "startup recovery finished"
    );

    let app = build_router(app_state);

    tracing::info!("Server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scan_manager.shutdown(SCAN_SHUTDOWN_GRACE).await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
