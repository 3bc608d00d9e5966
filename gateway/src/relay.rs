//! Relays provider fragments to a client over a bounded channel.

use std::time::Duration;

use futures_util::StreamExt;
use inference_gateway_common::{ErrorBody, StreamFragment};
use tokio::sync::mpsc;

use crate::provider::{FragmentStream, UpstreamError};

/// Event delivered to the client side of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Fragment(StreamFragment),
    /// Terminal failure after the response was already committed.
    Error(ErrorBody),
}

/// How the relay loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { fragments: u64 },
    Failed(UpstreamError),
    Cancelled,
}

/// Pulls fragments from the provider and pushes them into a bounded channel.
///
/// The channel capacity is the number of events allowed ahead of the
/// client; once it is full the relay stops pulling from upstream until the
/// client catches up. Dropping the receiver cancels the upstream stream.
pub struct StreamRelay {
    upstream: FragmentStream,
    tx: mpsc::Sender<RelayEvent>,
    idle_timeout: Duration,
}

impl StreamRelay {
    /// Create a relay and the receiver the transport should read from.
    pub fn channel(
        upstream: FragmentStream,
        capacity: usize,
        idle_timeout: Duration,
    ) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let relay = Self {
            upstream,
            tx,
            idle_timeout,
        };
        (relay, rx)
    }

    /// Run until the final fragment, an upstream failure, or client disconnect.
    ///
    /// The upstream stream is dropped on return in every case, so nothing is
    /// left draining after the client is gone.
    pub async fn run(mut self) -> RelayOutcome {
        let mut sent: u64 = 0;
        let mut last_index: Option<u64> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => return self.cancel(sent),
                next = tokio::time::timeout(self.idle_timeout, self.upstream.next()) => next,
            };

            let fragment = match next {
                Err(_) => {
                    let error = UpstreamError::Timeout(format!(
                        "no fragment within {}s",
                        self.idle_timeout.as_secs_f64()
                    ));
                    return self.fail(error).await;
                }
                Ok(None) => {
                    let error = UpstreamError::Unknown(
                        "stream ended without a final fragment".to_string(),
                    );
                    return self.fail(error).await;
                }
                Ok(Some(Err(error))) => return self.fail(error).await,
                Ok(Some(Ok(fragment))) => fragment,
            };

            if let Some(previous) = last_index {
                if fragment.sequence_index < previous {
                    let error = UpstreamError::Unknown(format!(
                        "fragment {} arrived after {}",
                        fragment.sequence_index, previous
                    ));
                    return self.fail(error).await;
                }
            }
            last_index = Some(fragment.sequence_index);

            let is_final = fragment.is_final;
            if self.tx.send(RelayEvent::Fragment(fragment)).await.is_err() {
                return self.cancel(sent);
            }
            sent += 1;

            if is_final {
                return RelayOutcome::Completed { fragments: sent };
            }
        }
    }

    async fn fail(self, error: UpstreamError) -> RelayOutcome {
        tracing::warn!(kind = error.kind(), "Upstream stream failed: {}", error);
        drop(self.upstream);

        let event = RelayEvent::Error(ErrorBody::new(error.kind(), error.to_string()));
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Client disconnected before the stream error could be delivered");
        }
        RelayOutcome::Failed(error)
    }

    fn cancel(self, sent: u64) -> RelayOutcome {
        tracing::info!(fragments_sent = sent, "Client disconnected, releasing upstream stream");
        drop(self.upstream);
        RelayOutcome::Cancelled
    }
}
