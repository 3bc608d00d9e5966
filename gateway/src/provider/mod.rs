//! Upstream language-model provider abstraction.
//!
//! The gateway only needs two capabilities from a provider: submit a prompt
//! and receive one completion, or submit a prompt and receive a stream of
//! completion fragments. Everything wire-specific lives in the adapters.

mod openai;

pub use openai::OpenAiProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use inference_gateway_common::{Completion, InferenceRequest, StreamFragment};

/// Classified upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream provider rate limited the gateway: {0}")]
    RateLimited(String),
    #[error("Upstream provider timed out: {0}")]
    Timeout(String),
    #[error("Upstream provider rejected the request: {0}")]
    InvalidRequest(String),
    #[error("Upstream provider unavailable: {0}")]
    Unavailable(String),
    #[error("Upstream provider error: {0}")]
    Unknown(String),
}

impl UpstreamError {
    /// Machine-readable kind used in responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::RateLimited(_) => "upstream_rate_limited",
            UpstreamError::Timeout(_) => "upstream_timeout",
            UpstreamError::InvalidRequest(_) => "upstream_invalid_request",
            UpstreamError::Unavailable(_) => "upstream_unavailable",
            UpstreamError::Unknown(_) => "upstream_unknown",
        }
    }
}

/// Lazy, single-pass sequence of fragments.
///
/// Dropping the stream before it ends cancels the upstream call and
/// releases its connection.
pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<StreamFragment, UpstreamError>> + Send + 'static>>;

/// Primary trait for upstream providers.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Model identifier reported to clients.
    fn model(&self) -> &str;

    /// Single-shot completion.
    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, UpstreamError>;

    /// Streaming completion. Errors before the first fragment are returned
    /// directly; later failures arrive as stream items.
    async fn complete_streaming(
        &self,
        request: &InferenceRequest,
    ) -> Result<FragmentStream, UpstreamError>;
}
