use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use driftprice_server::api_url::{api_base_url, ExecutionContext};
use driftprice_server::config::{log_filter, Config};
use driftprice_server::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let config = Config::from_env()?;

    info!("Starting DriftPrice API server");
    info!("Search service URL: {}", config.search_service_url);
    info!("Log directory: {}", config.log_dir.display());

    // Outbound calls carry no request timeout.
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("driftprice-server/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let state = Arc::new(AppState::from_config(&config, http_client)?);
    let app = routes::router(state);

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!(
        "DriftPrice API listening on {} ({})",
        address,
        api_base_url(&ExecutionContext::Detached, &config.url_env)
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
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
}
