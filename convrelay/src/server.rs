use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use convrelay_api::http::{create_router, AppState};
use convrelay_core::Config;
use convrelay_routing::RoutingChannel;

/// Run the HTTP server until a shutdown signal arrives, then stop the
/// routing channel tasks.
pub async fn run(
    config: Config,
    state: AppState,
    routing_channel: Option<Arc<RoutingChannel>>,
) -> Result<()> {
    let router = create_router(state, &config.cors);

    let http_address = config.http_address();
    let addr: std::net::SocketAddr = http_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind HTTP address {}: {}", addr, e);
        anyhow::anyhow!("Failed to bind {addr}: {e}")
    })?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(channel) = routing_channel {
        channel.shutdown();
    }

    info!("Server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
