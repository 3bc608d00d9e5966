//! Error payloads returned to clients.

use serde::{Deserialize, Serialize};

/// Body of every non-2xx response and of stream `error` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable kind, e.g. `rate_limited` or `upstream_timeout`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
                retry_after_seconds: None,
            },
        }
    }

    pub fn with_retry_after(mut self, seconds: f64) -> Self {
        self.error.retry_after_seconds = Some(seconds);
        self
    }
}
