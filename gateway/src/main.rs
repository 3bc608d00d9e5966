use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use inference_gateway::config::Config;
use inference_gateway::logging::init_tracing;
use inference_gateway::provider::{OpenAiProvider, ProviderClient};
use inference_gateway::{app, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    tracing::info!(
        environment = %config.environment,
        model = %config.openai_model,
        "Starting inference gateway"
    );

    let provider: Arc<dyn ProviderClient> = Arc::new(OpenAiProvider::new(
        &config.openai_base_url,
        &config.openai_api_key,
        &config.openai_model,
        config.upstream_timeout(),
    )?);

    let state = Arc::new(AppState::new(config.clone(), provider)?);

    // Evict idle rate windows so memory tracks active clients
    let sweeper = {
        let limiter = state.limiter.clone();
        let period = config.rate_limit_window();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = limiter.tracked_clients(), "Swept idle rate windows");
                }
            }
        })
    };

    let addr = config.bind_addr();
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    sweeper.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received, draining in-flight requests");
    state.begin_shutdown();
}
