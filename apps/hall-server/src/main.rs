//! # Hall Server
//!
//! HTTP API and event channel for a billiard hall's terminals.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Terminal ───► REST (/api) ───► Services ───► SQLite                    │
//! │     ▲                              │                                    │
//! │     └──────── /ws (rooms) ◄────────┘                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `hall-server hash-pin <PIN>` prints an argon2 hash for `access.pin_hashes`.

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cue_db::Database;
use hall_server::routes::build_app;
use hall_server::state::guard::hash_pin;
use hall_server::{AppState, HallConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    if let Some("hash-pin") = args.next().as_deref() {
        let pin = args.next().context("usage: hall-server hash-pin <PIN>")?;
        let hash = hash_pin(&pin).map_err(|e| anyhow::anyhow!("failed to hash PIN: {e}"))?;
        println!("{hash}");
        return Ok(());
    }

    let config = HallConfig::load(None).context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting hall server...");
    info!(
        addr = %config.socket_addr(),
        venue = %config.venue.name,
        database = %config.database.path.display(),
        "Configuration loaded"
    );

    let db = Database::new(config.db_config())
        .await
        .context("failed to open database")?;
    info!("Database ready");

    let addr = config.socket_addr();
    let state = AppState::new(config, db.clone())
        .await
        .context("failed to load floor state")?;
    let app = build_app(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
