//! Process-wide request metrics in Prometheus exposition format.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Why a request was refused before reaching the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidRequest,
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidRequest => "invalid_request",
            RejectReason::RateLimited => "rate_limited",
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    StreamCompleted,
    Rejected(RejectReason),
    /// Failure, labelled with its error kind.
    Error(&'static str),
    /// Client went away before a terminal state was reached.
    Cancelled,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::StreamCompleted => "stream_completed",
            Outcome::Rejected(_) => "rejected",
            Outcome::Error(_) => "error",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Something a request path observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricEvent {
    RequestStarted,
    RequestAdmitted { streaming: bool },
    RequestRejected(RejectReason),
    RequestCompleted { duration: Duration, outcome: Outcome },
    StreamStarted,
    StreamCompleted,
    TokensProcessed(u64),
}

const OUTCOMES: [&str; 5] = ["completed", "stream_completed", "rejected", "error", "cancelled"];
const REJECT_REASONS: [&str; 2] = ["invalid_request", "rate_limited"];
const MODES: [&str; 2] = ["single", "streaming"];

/// Counters and histograms updated by every request.
///
/// All series are lock-free atomics owned by a private registry, so many
/// requests can record at once and a scrape never sees a half-written value.
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounter,
    requests_admitted: IntCounterVec,
    requests_rejected: IntCounterVec,
    requests_completed: IntCounterVec,
    errors_total: IntCounterVec,
    streams_started: IntCounter,
    streams_completed: IntCounter,
    active_streams: IntGauge,
    request_duration_seconds: HistogramVec,
    tokens_total: IntCounter,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub admitted_single: u64,
    pub admitted_streaming: u64,
    pub rejected_invalid: u64,
    pub rejected_rate_limited: u64,
    pub completed: u64,
    pub stream_completed: u64,
    pub rejected: u64,
    pub errors: u64,
    pub cancelled: u64,
    pub streams_started: u64,
    pub streams_completed: u64,
    pub active_streams: i64,
    pub tokens_total: u64,
}

impl MetricsSnapshot {
    /// Requests that reached any terminal outcome.
    pub fn terminal_total(&self) -> u64 {
        self.completed + self.stream_completed + self.rejected + self.errors + self.cancelled
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total =
            IntCounter::new("gateway_requests_total", "Total number of inference requests received")?;
        let requests_admitted = IntCounterVec::new(
            Opts::new("gateway_requests_admitted_total", "Requests admitted past rate limiting"),
            &["mode"],
        )?;
        let requests_rejected = IntCounterVec::new(
            Opts::new("gateway_requests_rejected_total", "Requests rejected before dispatch"),
            &["reason"],
        )?;
        let requests_completed = IntCounterVec::new(
            Opts::new("gateway_requests_completed_total", "Requests that reached a terminal state"),
            &["outcome"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("gateway_errors_total", "Failed requests by error kind"),
            &["kind"],
        )?;
        let streams_started =
            IntCounter::new("gateway_streams_started_total", "Streaming responses started")?;
        let streams_completed =
            IntCounter::new("gateway_streams_completed_total", "Streaming responses finished")?;
        let active_streams =
            IntGauge::new("gateway_active_streams", "Streaming responses currently open")?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_seconds", "Request duration in seconds")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["outcome"],
        )?;
        let tokens_total =
            IntCounter::new("gateway_tokens_total", "Tokens reported by the upstream provider")?;
        let up = IntGauge::new("gateway_up", "Whether the service is up")?;
        let info = IntGaugeVec::new(Opts::new("gateway_info", "Service information"), &["version"])?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_admitted.clone()))?;
        registry.register(Box::new(requests_rejected.clone()))?;
        registry.register(Box::new(requests_completed.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(streams_started.clone()))?;
        registry.register(Box::new(streams_completed.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(info.clone()))?;

        up.set(1);
        info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        // Expose every known series from the first scrape
        for mode in MODES {
            requests_admitted.with_label_values(&[mode]);
        }
        for reason in REJECT_REASONS {
            requests_rejected.with_label_values(&[reason]);
        }
        for outcome in OUTCOMES {
            requests_completed.with_label_values(&[outcome]);
        }

        Ok(Self {
            registry,
            requests_total,
            requests_admitted,
            requests_rejected,
            requests_completed,
            errors_total,
            streams_started,
            streams_completed,
            active_streams,
            request_duration_seconds,
            tokens_total,
        })
    }

    pub fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::RequestStarted => self.requests_total.inc(),
            MetricEvent::RequestAdmitted { streaming } => {
                let mode = if streaming { "streaming" } else { "single" };
                self.requests_admitted.with_label_values(&[mode]).inc();
            }
            MetricEvent::RequestRejected(reason) => {
                self.requests_rejected.with_label_values(&[reason.as_str()]).inc();
            }
            MetricEvent::RequestCompleted { duration, outcome } => {
                self.requests_completed.with_label_values(&[outcome.label()]).inc();
                self.request_duration_seconds
                    .with_label_values(&[outcome.label()])
                    .observe(duration.as_secs_f64());
                if let Outcome::Error(kind) = outcome {
                    self.errors_total.with_label_values(&[kind]).inc();
                }
            }
            MetricEvent::StreamStarted => {
                self.streams_started.inc();
                self.active_streams.inc();
            }
            MetricEvent::StreamCompleted => {
                self.streams_completed.inc();
                self.active_streams.dec();
            }
            MetricEvent::TokensProcessed(tokens) => self.tokens_total.inc_by(tokens),
        }
    }

    /// Render all series in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn errors_of_kind(&self, kind: &str) -> u64 {
        self.errors_total.with_label_values(&[kind]).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = |outcome: &str| self.requests_completed.with_label_values(&[outcome]).get();
        MetricsSnapshot {
            requests_total: self.requests_total.get(),
            admitted_single: self.requests_admitted.with_label_values(&["single"]).get(),
            admitted_streaming: self.requests_admitted.with_label_values(&["streaming"]).get(),
            rejected_invalid: self.requests_rejected.with_label_values(&["invalid_request"]).get(),
            rejected_rate_limited: self.requests_rejected.with_label_values(&["rate_limited"]).get(),
            completed: completed("completed"),
            stream_completed: completed("stream_completed"),
            rejected: completed("rejected"),
            errors: completed("error"),
            cancelled: completed("cancelled"),
            streams_started: self.streams_started.get(),
            streams_completed: self.streams_completed.get(),
            active_streams: self.active_streams.get(),
            tokens_total: self.tokens_total.get(),
        }
    }
}
