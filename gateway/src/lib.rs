pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod relay;
pub mod routes;
pub mod test_util;
pub mod validation;

pub use config::Config;
pub use error::GatewayError;
pub use identity::ClientIdentity;
pub use limiter::{Admission, RateLimiter};
pub use metrics::{MetricEvent, Metrics, MetricsSnapshot};
pub use orchestrator::{Gateway, GatewayResponse, GatewaySettings, StreamMode};
pub use provider::{OpenAiProvider, ProviderClient, UpstreamError};
pub use relay::{RelayEvent, RelayOutcome, StreamRelay};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub gateway: Gateway,
    pub metrics: Arc<Metrics>,
    /// Per-client rate windows, shared with the background sweeper.
    pub limiter: Arc<RateLimiter>,
    accepting: AtomicBool,
}

impl AppState {
    pub fn new(config: Config, provider: Arc<dyn ProviderClient>) -> Result<Self, prometheus::Error> {
        let metrics = Arc::new(Metrics::new()?);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_count,
            config.rate_limit_window(),
        ));
        let gateway = Gateway::new(
            limiter.clone(),
            provider,
            metrics.clone(),
            GatewaySettings::from(&config),
        );

        Ok(Self {
            config,
            gateway,
            metrics,
            limiter,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Flip health to 503 ahead of the listener closing.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::inference::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
