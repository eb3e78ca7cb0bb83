use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use planthub_broadcast::broadcast::Broadcaster;
use planthub_broadcast::config::Settings;
use planthub_broadcast::server::{create_app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Start the broadcaster and application state
    let broadcaster = Arc::new(Broadcaster::start(&settings));
    let state = AppState::with_broadcaster(settings.clone(), broadcaster.clone());

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(broadcaster.clone()))
        .await?;

    // A fatal error may have stopped the broadcaster without a signal
    let result = broadcaster.shutdown("server stopped").await;
    if !result.success {
        tracing::warn!(
            remaining = result.connections_remaining,
            "Shutdown finished with connections still open"
        );
    }

    if broadcaster.is_poisoned() {
        bail!("connection registry invariant violated");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal_handler(broadcaster: Arc<Broadcaster>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "received Ctrl+C",
        _ = terminate => "received terminate signal",
        _ = broadcaster.stopped() => "broadcaster stopped",
    };
    tracing::info!(reason = reason, "Initiating graceful shutdown");

    // Close live sessions before the server waits on their upgraded connections
    broadcaster.shutdown(reason).await;
}
