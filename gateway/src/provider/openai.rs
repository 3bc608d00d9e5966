//! OpenAI-compatible provider adapter.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use inference_gateway_common::{ChatMessage, Completion, InferenceRequest, StreamFragment};
use reqwest::{Client, StatusCode};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{FragmentStream, ProviderClient, UpstreamError};

/// Client for any endpoint speaking the OpenAI chat completions API.
pub struct OpenAiProvider {
    http_client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

// ============================================================================
// OpenAI API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    id: String,
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Unknown(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        })
    }

    fn chat_request<'a>(&'a self, request: &'a InferenceRequest, stream: bool) -> OpenAiChatRequest<'a> {
        OpenAiChatRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.parameters.max_tokens,
            temperature: request.parameters.temperature,
            top_p: request.parameters.top_p,
            stream,
        }
    }

    fn post(&self, body: &OpenAiChatRequest<'_>) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!("Sending request to provider: {} (stream: {})", url, body.stream);

        self.http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
    }

    fn timed_out(&self) -> UpstreamError {
        UpstreamError::Timeout(format!("no response within {}s", self.timeout.as_secs()))
    }

    async fn send(&self, body: &OpenAiChatRequest<'_>) -> Result<reqwest::Response, UpstreamError> {
        let response = tokio::time::timeout(self.timeout, self.post(body).timeout(self.timeout).send())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(response)
    }

    /// Open an event stream and wait for the provider to accept it.
    ///
    /// Status and content-type failures surface here, before any fragment,
    /// so the caller can still answer with a plain error.
    async fn open_events(&self, body: &OpenAiChatRequest<'_>) -> Result<EventSource, UpstreamError> {
        let mut events = EventSource::new(self.post(body))
            .map_err(|e| UpstreamError::Unknown(format!("cannot open event stream: {}", e)))?;
        // A retried completion would restart generation from scratch
        events.set_retry_policy(Box::new(Never));

        match tokio::time::timeout(self.timeout, events.next()).await {
            Err(_) => {
                events.close();
                Err(self.timed_out())
            }
            Ok(Some(Ok(Event::Open))) => Ok(events),
            Ok(Some(Ok(Event::Message(_)))) => {
                events.close();
                Err(UpstreamError::Unknown("event stream sent data before opening".to_string()))
            }
            Ok(Some(Err(e))) => {
                events.close();
                Err(open_error(e).await)
            }
            Ok(None) => Err(UpstreamError::Unavailable(
                "event stream closed before opening".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, UpstreamError> {
        let body = self.chat_request(request, false);
        let response = self.send(&body).await?;

        let parsed: OpenAiChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(e.to_string())
            } else {
                UpstreamError::Unknown(format!("invalid response: {}", e))
            }
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Unknown("response contained no choices".to_string()))?;

        let mut completion = Completion::new(
            parsed.model,
            choice.message.content.unwrap_or_default(),
            choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        );
        completion.id = parsed.id;

        if let Some(usage) = parsed.usage {
            completion = completion.with_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        Ok(completion)
    }

    async fn complete_streaming(
        &self,
        request: &InferenceRequest,
    ) -> Result<FragmentStream, UpstreamError> {
        let body = self.chat_request(request, true);
        let events = self.open_events(&body).await?;
        Ok(Box::pin(fragments(payloads(events))))
    }
}

/// Map a non-success HTTP status to an upstream error kind.
fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let detail = format!("{}: {}", status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited(detail),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            UpstreamError::InvalidRequest(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => UpstreamError::Timeout(detail),
        s if s.is_server_error() => UpstreamError::Unavailable(detail),
        _ => UpstreamError::Unknown(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        UpstreamError::Unavailable(err.to_string())
    } else {
        UpstreamError::Unknown(err.to_string())
    }
}

/// Event-stream failure while the stream is being opened.
async fn open_error(err: reqwest_eventsource::Error) -> UpstreamError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            classify_status(status, &body)
        }
        other => stream_error(other),
    }
}

fn stream_error(err: reqwest_eventsource::Error) -> UpstreamError {
    use reqwest_eventsource::Error;

    match err {
        Error::Transport(e) => classify_transport(e),
        Error::InvalidStatusCode(status, _) => classify_status(status, ""),
        Error::InvalidContentType(content_type, _) => {
            UpstreamError::Unknown(format!("unexpected content type {:?}", content_type))
        }
        Error::StreamEnded => UpstreamError::Unknown("stream ended before completion".to_string()),
        other => UpstreamError::Unknown(format!("malformed event stream: {}", other)),
    }
}

type PayloadStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// `data` payloads of an event stream.
///
/// With retries disabled the source closes after its first error, so a
/// clean `StreamEnded` simply ends the payload stream.
fn payloads(events: EventSource) -> PayloadStream {
    Box::pin(events.filter_map(|event| async move {
        match event {
            Ok(Event::Open) => None,
            Ok(Event::Message(message)) => Some(Ok(message.data)),
            Err(reqwest_eventsource::Error::StreamEnded) => None,
            Err(e) => Some(Err(stream_error(e))),
        }
    }))
}

/// Decoding state for one streamed response.
struct FragmentReader {
    payloads: PayloadStream,
    pending: VecDeque<Result<StreamFragment, UpstreamError>>,
    next_index: u64,
    finish_reason: Option<String>,
    finished: bool,
}

impl FragmentReader {
    fn handle_payload(&mut self, payload: &str) {
        if self.finished {
            return;
        }

        if payload == "[DONE]" {
            self.push_final();
            return;
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(UpstreamError::Unknown(format!("malformed stream chunk: {}", e)));
                return;
            }
        };

        if let Some(error) = chunk.error {
            self.fail(UpstreamError::Unknown(error.to_string()));
            return;
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                let index = self.next_index;
                self.next_index += 1;
                self.pending.push_back(Ok(StreamFragment::delta(index, content)));
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    fn handle_eof(&mut self) {
        if self.finished {
            return;
        }
        if self.finish_reason.is_some() {
            self.push_final();
        } else {
            self.fail(UpstreamError::Unknown(
                "stream ended before completion".to_string(),
            ));
        }
    }

    fn push_final(&mut self) {
        let reason = self
            .finish_reason
            .take()
            .unwrap_or_else(|| "stop".to_string());
        self.pending
            .push_back(Ok(StreamFragment::last(self.next_index, "", Some(reason))));
        self.finished = true;
    }

    fn fail(&mut self, error: UpstreamError) {
        self.pending.push_back(Err(error));
        self.finished = true;
    }
}

/// Turn event-stream payloads into fragments.
fn fragments(payloads: PayloadStream) -> impl Stream<Item = Result<StreamFragment, UpstreamError>> + Send {
    let reader = FragmentReader {
        payloads,
        pending: VecDeque::new(),
        next_index: 0,
        finish_reason: None,
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(item) = reader.pending.pop_front() {
                return Some((item, reader));
            }
            if reader.finished {
                return None;
            }
            match reader.payloads.next().await {
                Some(Ok(payload)) => reader.handle_payload(payload.trim()),
                Some(Err(e)) => reader.fail(e),
                None => reader.handle_eof(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads_of(items: Vec<&'static str>) -> PayloadStream {
        Box::pin(stream::iter(items.into_iter().map(|p| Ok(p.to_string()))))
    }

    async fn collect(items: Vec<&'static str>) -> Vec<Result<StreamFragment, UpstreamError>> {
        fragments(payloads_of(items)).collect().await
    }

    #[tokio::test]
    async fn test_fragments_in_order_with_single_final() {
        let items = collect(vec![
            "{\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}",
            "{\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}",
            "{\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}",
            "{\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
            "[DONE]",
        ])
        .await;

        let fragments: Vec<StreamFragment> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], StreamFragment::delta(0, "Hel"));
        assert_eq!(fragments[1], StreamFragment::delta(1, "lo"));
        assert!(fragments[2].is_final);
        assert_eq!(fragments[2].sequence_index, 2);
        assert_eq!(fragments[2].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_fragments_final_without_done_marker() {
        let items = collect(vec![
            "{\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"length\"}]}",
        ])
        .await;
        assert_eq!(items.len(), 2);
        let last = items[1].as_ref().unwrap();
        assert!(last.is_final);
        assert_eq!(last.finish_reason.as_deref(), Some("length"));
    }

    #[tokio::test]
    async fn test_fragments_truncated_stream_is_error() {
        let items = collect(vec!["{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}"]).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(UpstreamError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_fragments_malformed_chunk_is_error() {
        let items = collect(vec!["not-json", "[DONE]"]).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_fragments_error_payload_mid_stream() {
        let items = collect(vec![
            "{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}",
            "{\"error\":{\"message\":\"overloaded\"}}",
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(UpstreamError::Unknown(msg)) if msg.contains("overloaded")));
    }

    #[tokio::test]
    async fn test_fragments_transport_failure_mid_stream() {
        let payloads: PayloadStream = Box::pin(stream::iter(vec![
            Ok("{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}".to_string()),
            Err(UpstreamError::Unavailable("connection reset".to_string())),
            Ok("[DONE]".to_string()),
        ]));
        let items: Vec<_> = fragments(payloads).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(StreamFragment::delta(0, "a")));
        assert!(matches!(items[1], Err(UpstreamError::Unavailable(_))));
    }

    #[test]
    fn test_stream_end_without_done_is_unknown() {
        assert!(matches!(
            stream_error(reqwest_eventsource::Error::StreamEnded),
            UpstreamError::Unknown(_)
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            UpstreamError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, ""),
            UpstreamError::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            UpstreamError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            UpstreamError::Unknown(_)
        ));
    }
}
