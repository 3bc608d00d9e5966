//! Per-request lifecycle: validate, admit, dispatch, relay, record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{future, stream, StreamExt};
use inference_gateway_common::{Completion, InferenceRequest};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::GatewayError;
use crate::identity::ClientIdentity;
use crate::limiter::{Admission, RateLimiter};
use crate::metrics::{MetricEvent, Metrics, Outcome, RejectReason};
use crate::provider::{FragmentStream, ProviderClient, UpstreamError};
use crate::relay::{RelayEvent, RelayOutcome, StreamRelay};
use crate::validation::{parse_and_validate, ValidationLimits};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Validated,
    Admitted,
    InFlight,
    Completed,
    Streaming,
    StreamCompleted,
    Terminal,
}

impl RequestPhase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Validated, Admitted)
                | (Admitted, InFlight)
                | (Admitted, Streaming)
                | (InFlight, Completed)
                | (Streaming, StreamCompleted)
                | (Completed, Terminal)
                | (StreamCompleted, Terminal)
        ) || (self != Terminal && next == Terminal)
    }
}

/// Tracks one request and records its terminal outcome exactly once.
///
/// Dropping a lifecycle that never finished (the handler future was
/// dropped because the client went away) records `cancelled`.
struct RequestLifecycle {
    id: String,
    client: ClientIdentity,
    phase: RequestPhase,
    started: Instant,
    metrics: Arc<Metrics>,
    finished: bool,
}

impl RequestLifecycle {
    fn start(metrics: Arc<Metrics>, client: ClientIdentity) -> Self {
        metrics.record(MetricEvent::RequestStarted);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client,
            phase: RequestPhase::Received,
            started: Instant::now(),
            metrics,
            finished: false,
        }
    }

    fn advance(&mut self, next: RequestPhase) {
        if !self.phase.can_advance_to(next) {
            tracing::error!(
                request_id = %self.id,
                from = ?self.phase,
                to = ?next,
                "Illegal request phase transition"
            );
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.phase, next);
        }
        tracing::trace!(request_id = %self.id, phase = ?next, "Request phase");
        self.phase = next;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn reject(self, reason: RejectReason) {
        self.metrics.record(MetricEvent::RequestRejected(reason));
        self.finish(Outcome::Rejected(reason));
    }

    fn finish(mut self, outcome: Outcome) {
        self.record_terminal(outcome);
    }

    fn record_terminal(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.advance(RequestPhase::Completed),
            Outcome::StreamCompleted => self.advance(RequestPhase::StreamCompleted),
            _ => {}
        }
        self.advance(RequestPhase::Terminal);
        self.finished = true;

        let duration = self.elapsed();
        self.metrics
            .record(MetricEvent::RequestCompleted { duration, outcome });

        tracing::info!(
            request_id = %self.id,
            client = %self.client,
            outcome = outcome.label(),
            duration_ms = duration.as_millis() as u64,
            "Request finished"
        );
    }
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        if !self.finished {
            self.record_terminal(Outcome::Cancelled);
        }
    }
}

/// Successful result of [`Gateway::handle`].
#[derive(Debug)]
pub enum GatewayResponse {
    Completed(Completion),
    /// Events to forward to the client; the relay task owns the upstream stream.
    Streaming(mpsc::Receiver<RelayEvent>),
}

/// How the streaming flag is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Use the request's `stream` field.
    FromRequest,
    /// Always stream, regardless of the body.
    Forced,
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub limits: ValidationLimits,
    pub upstream_timeout: Duration,
    pub stream_buffer: usize,
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: ValidationLimits::from(config),
            upstream_timeout: config.upstream_timeout(),
            stream_buffer: config.stream_buffer,
        }
    }
}

/// Ties validation, admission, the provider and the relay together.
///
/// Shared state (rate windows and metrics) is injected so each instance, and
/// each test, owns its own.
pub struct Gateway {
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn ProviderClient>,
    metrics: Arc<Metrics>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn ProviderClient>,
        metrics: Arc<Metrics>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            limiter,
            provider,
            metrics,
            settings,
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Handle one inference request from `client`.
    ///
    /// Every failure is mapped to exactly one [`GatewayError`]; streaming
    /// failures after the first event are delivered in-band instead.
    pub async fn handle(
        &self,
        client: &ClientIdentity,
        body: &[u8],
        mode: StreamMode,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut lifecycle = RequestLifecycle::start(self.metrics.clone(), client.clone());

        let mut request = match parse_and_validate(body, &self.settings.limits) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(request_id = %lifecycle.id, client = %client, "Invalid request: {}", e);
                lifecycle.reject(RejectReason::InvalidRequest);
                return Err(GatewayError::InvalidRequest(e));
            }
        };
        if mode == StreamMode::Forced {
            request.stream = true;
        }
        lifecycle.advance(RequestPhase::Validated);

        if let Admission::Rejected { retry_after } = self.limiter.admit(client) {
            lifecycle.reject(RejectReason::RateLimited);
            return Err(GatewayError::RateLimited { retry_after });
        }
        lifecycle.advance(RequestPhase::Admitted);
        self.metrics.record(MetricEvent::RequestAdmitted {
            streaming: request.stream,
        });

        tracing::info!(
            request_id = %lifecycle.id,
            client = %client,
            messages = request.messages.len(),
            stream = request.stream,
            "Processing inference request"
        );

        if request.stream {
            self.stream(request, lifecycle).await
        } else {
            self.complete(request, lifecycle).await
        }
    }

    async fn complete(
        &self,
        request: InferenceRequest,
        mut lifecycle: RequestLifecycle,
    ) -> Result<GatewayResponse, GatewayError> {
        lifecycle.advance(RequestPhase::InFlight);

        let timeout = self.settings.upstream_timeout;
        let result = tokio::time::timeout(timeout, self.provider.complete(&request))
            .await
            .unwrap_or_else(|_| Err(timeout_error(timeout)));

        match result {
            Ok(mut completion) => {
                completion.latency_ms = lifecycle.elapsed().as_millis() as u64;
                if let Some(usage) = completion.usage {
                    self.metrics
                        .record(MetricEvent::TokensProcessed(u64::from(usage.total_tokens)));
                }
                lifecycle.finish(Outcome::Completed);
                Ok(GatewayResponse::Completed(completion))
            }
            Err(error) => {
                log_upstream_failure(&lifecycle.id, &error);
                lifecycle.finish(Outcome::Error(error.kind()));
                Err(GatewayError::Upstream(error))
            }
        }
    }

    async fn stream(
        &self,
        request: InferenceRequest,
        mut lifecycle: RequestLifecycle,
    ) -> Result<GatewayResponse, GatewayError> {
        lifecycle.advance(RequestPhase::Streaming);

        let timeout = self.settings.upstream_timeout;
        let opened = tokio::time::timeout(timeout, self.provider.complete_streaming(&request))
            .await
            .unwrap_or_else(|_| Err(timeout_error(timeout)));

        // Nothing is committed until the first fragment arrives, so any
        // failure up to that point is still a plain HTTP error
        let upstream = match opened {
            Ok(upstream) => first_fragment(upstream, timeout).await,
            Err(error) => Err(error),
        };
        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(error) => {
                log_upstream_failure(&lifecycle.id, &error);
                lifecycle.finish(Outcome::Error(error.kind()));
                return Err(GatewayError::Upstream(error));
            }
        };

        let (relay, rx) = StreamRelay::channel(upstream, self.settings.stream_buffer, timeout);
        let metrics = self.metrics.clone();
        metrics.record(MetricEvent::StreamStarted);

        tokio::spawn(async move {
            let outcome = relay.run().await;
            metrics.record(MetricEvent::StreamCompleted);

            match outcome {
                RelayOutcome::Completed { fragments } => {
                    tracing::debug!(request_id = %lifecycle.id, fragments, "Stream completed");
                    lifecycle.finish(Outcome::StreamCompleted);
                }
                RelayOutcome::Failed(error) => {
                    log_upstream_failure(&lifecycle.id, &error);
                    lifecycle.finish(Outcome::Error(error.kind()));
                }
                RelayOutcome::Cancelled => lifecycle.finish(Outcome::Cancelled),
            }
        });

        Ok(GatewayResponse::Streaming(rx))
    }
}

/// Wait for the first fragment and put it back in front of the stream.
async fn first_fragment(
    mut upstream: FragmentStream,
    timeout: Duration,
) -> Result<FragmentStream, UpstreamError> {
    match tokio::time::timeout(timeout, upstream.next()).await {
        Err(_) => Err(timeout_error(timeout)),
        Ok(None) => Err(UpstreamError::Unknown(
            "stream ended before any fragment".to_string(),
        )),
        Ok(Some(Err(error))) => Err(error),
        Ok(Some(Ok(fragment))) => {
            let first = stream::once(future::ready(Ok(fragment)));
            Ok(Box::pin(first.chain(upstream)))
        }
    }
}

fn timeout_error(timeout: Duration) -> UpstreamError {
    UpstreamError::Timeout(format!(
        "no response within {:.1}s",
        timeout.as_secs_f64()
    ))
}

fn log_upstream_failure(request_id: &str, error: &UpstreamError) {
    match error {
        // The validator should have caught anything the provider rejects
        UpstreamError::InvalidRequest(_) => tracing::error!(
            request_id = %request_id,
            kind = error.kind(),
            "Provider rejected a validated request: {}",
            error
        ),
        _ => tracing::warn!(
            request_id = %request_id,
            kind = error.kind(),
            "Upstream request failed: {}",
            error
        ),
    }
}
