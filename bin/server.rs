// Finance Sync - Web Server
// REST API over the transactions and cards databases

use anyhow::{Context, Result};
use finance_sync::config::AppConfig;
use finance_sync::logging::init_tracing;
use finance_sync::{build_router, AppState, Database};
use tokio::signal;
use tracing::{error, info};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
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
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    let db = Database::open(&config.transactions_db_path, &config.cards_db_path)
        .context("failed to open databases")?;

    let app = build_router(AppState::from_config(&config, db.clone()));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Handlers are gone once serve returns; release the last handles
    db.close().context("failed to close databases")?;

    Ok(())
}
