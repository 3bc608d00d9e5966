use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use inference_gateway_common::{Completion, InferenceRequest, StreamFragment};

use crate::provider::{FragmentStream, ProviderClient, UpstreamError};

/// Scripted provider for tests.
///
/// Replies are split on spaces into one delta per word followed by an empty
/// final fragment, so `"a b c"` streams as four fragments.
pub struct MockProvider {
    model: String,
    reply: Result<String, UpstreamError>,
    script: Option<Vec<Result<StreamFragment, UpstreamError>>>,
    delay: Duration,
    fragment_delay: Duration,
    hang: bool,
    calls: AtomicUsize,
    pulled: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn replying(text: &str) -> Self {
        Self {
            model: "mock-model".to_string(),
            reply: Ok(text.to_string()),
            script: None,
            delay: Duration::ZERO,
            fragment_delay: Duration::ZERO,
            hang: false,
            calls: AtomicUsize::new(0),
            pulled: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: UpstreamError) -> Self {
        Self {
            reply: Err(error),
            ..Self::replying("")
        }
    }

    /// Delay before the provider answers (or opens its stream).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay before each streamed fragment.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Stream exactly these items instead of the reply text.
    pub fn with_stream(mut self, items: Vec<Result<StreamFragment, UpstreamError>>) -> Self {
        self.script = Some(items);
        self
    }

    /// Stream the deltas, then never send the final fragment.
    pub fn hanging_stream(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Number of `complete` / `complete_streaming` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fragment streams handed out and since dropped.
    pub fn streams_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Counter of fragments actually pulled from any stream.
    pub fn fragments_pulled(&self) -> Arc<AtomicUsize> {
        self.pulled.clone()
    }

    /// Build a fragment stream without going through the trait.
    pub fn stream_now(&self) -> FragmentStream {
        let mut items = match &self.script {
            Some(items) => items.clone(),
            None => match &self.reply {
                Ok(text) => self.fragments(text),
                Err(e) => vec![Err(e.clone())],
            },
        };
        if self.hang {
            items.retain(|item| !matches!(item, Ok(f) if f.is_final));
        }

        let pulled = self.pulled.clone();
        let fragment_delay = self.fragment_delay;
        let scripted = stream::iter(items)
            .then(move |item| async move {
                if !fragment_delay.is_zero() {
                    tokio::time::sleep(fragment_delay).await;
                }
                item
            })
            .inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            });

        let inner: FragmentStream = if self.hang {
            Box::pin(scripted.chain(stream::pending()))
        } else {
            Box::pin(scripted)
        };
        Box::pin(TrackedStream {
            inner,
            released: self.released.clone(),
        })
    }

    fn fragments(&self, text: &str) -> Vec<Result<StreamFragment, UpstreamError>> {
        let mut items: Vec<_> = text
            .split_inclusive(' ')
            .enumerate()
            .map(|(i, word)| Ok(StreamFragment::delta(i as u64, word)))
            .collect();
        let last = items.len() as u64;
        items.push(Ok(StreamFragment::last(last, "", Some("stop".to_string()))));
        items
    }

    async fn respond(&self) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, UpstreamError> {
        let text = self.respond().await?;
        let prompt_tokens = (request.prompt_chars() / 4).max(1) as u32;
        let completion_tokens = text.split_whitespace().count() as u32;
        Ok(Completion::new(&self.model, text, "stop").with_usage(prompt_tokens, completion_tokens))
    }

    async fn complete_streaming(
        &self,
        _request: &InferenceRequest,
    ) -> Result<FragmentStream, UpstreamError> {
        self.respond().await?;
        Ok(self.stream_now())
    }
}

/// Counts its own drop so tests can prove the upstream was released.
struct TrackedStream {
    inner: FragmentStream,
    released: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = Result<StreamFragment, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
