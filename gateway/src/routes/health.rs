use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    model: String,
}

/// GET /health - 503 once shutdown has begun so balancers drain us
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let (status, label) = if state.is_accepting() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    };
    let body = HealthResponse {
        status: label,
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.environment.clone(),
        model: state.gateway.model().to_string(),
    };
    (status, Json(body))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, GatewayError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| GatewayError::Internal(format!("failed to render metrics: {}", e)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "inference-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.gateway.model(),
        "endpoints": {
            "inference": "/inference",
            "stream": "/stream",
            "health": "/health",
            "metrics": "/metrics",
        },
        "rate_limit": {
            "requests": state.limiter.limit(),
            "window_seconds": state.limiter.window_duration().as_secs(),
        },
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
