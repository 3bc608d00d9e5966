//! Client-facing error taxonomy.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use inference_gateway_common::ErrorBody;

use crate::provider::UpstreamError;
use crate::validation::ValidationError;

/// Every way a request can fail, each with one status and one `type` string.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ValidationError),

    #[error("Rate limit exceeded, retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Upstream(e) => e.kind(),
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(UpstreamError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(UpstreamError::RateLimited(_)) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.kind(), self.to_string());
        match self {
            GatewayError::RateLimited { retry_after } => {
                body.with_retry_after(retry_after.as_secs_f64())
            }
            _ => body,
        }
    }
}

/// Whole seconds for the `Retry-After` header, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs_f64().ceil() as u64;
    secs.max(1)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            GatewayError::Internal(_) => tracing::error!("Internal error: {}", self),
            _ if status.is_server_error() => {
                tracing::debug!(kind = self.kind(), "Responding with {}: {}", status, self)
            }
            _ => {}
        }

        let mut response = (status, Json(self.body())).into_response();
        if let GatewayError::RateLimited { retry_after } = &self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(*retry_after)),
            );
        }
        response
    }
}
