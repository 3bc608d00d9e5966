//! OpenAI adapter against a mock HTTP upstream.

use std::time::Duration;

use futures_util::StreamExt;
use inference_gateway::provider::{OpenAiProvider, ProviderClient, UpstreamError};
use inference_gateway_common::{ChatMessage, GenerationParameters, InferenceRequest};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(stream: bool) -> InferenceRequest {
    InferenceRequest {
        messages: vec![ChatMessage::user("What is ML?")],
        parameters: GenerationParameters {
            max_tokens: 50,
            temperature: 0.2,
            top_p: None,
        },
        stream,
    }
}

fn provider(server: &MockServer, timeout: Duration) -> OpenAiProvider {
    OpenAiProvider::new(&server.uri(), "sk-test", "gpt-test", timeout).unwrap()
}

#[tokio::test]
async fn test_complete_parses_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "max_tokens": 50,
            "stream": false,
            "messages": [{"role": "user", "content": "What is ML?"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "model": "gpt-test",
            "choices": [{
                "message": {"role": "assistant", "content": "Machine learning is..."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completion = provider(&server, Duration::from_secs(5))
        .complete(&request(false))
        .await
        .unwrap();

    assert_eq!(completion.id, "chatcmpl-1");
    assert_eq!(completion.content, "Machine learning is...");
    assert_eq!(completion.finish_reason, "stop");
    assert_eq!(completion.usage.unwrap().total_tokens, 14);
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    let cases = [
        (429, "upstream_rate_limited"),
        (400, "upstream_invalid_request"),
        (404, "upstream_invalid_request"),
        (503, "upstream_unavailable"),
        (500, "upstream_unavailable"),
        (504, "upstream_timeout"),
        (401, "upstream_unknown"),
    ];
    for (status, kind) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5))
            .complete(&request(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kind, "status {}", status);
    }
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "x", "model": "m", "choices": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = provider(&server, Duration::from_millis(300))
        .complete(&request(false))
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout(_)), "{:?}", err);
}

#[tokio::test]
async fn test_unreachable_upstream_is_unavailable() {
    let provider = OpenAiProvider::new("http://127.0.0.1:1", "sk-test", "gpt-test", Duration::from_secs(2)).unwrap();
    let err = provider.complete(&request(false)).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Unavailable(_)), "{:?}", err);
}

#[tokio::test]
async fn test_streaming_yields_ordered_fragments() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let stream = provider(&server, Duration::from_secs(5))
        .complete_streaming(&request(true))
        .await
        .unwrap();
    let fragments: Vec<_> = stream.map(|item| item.unwrap()).collect().await;

    let text: String = fragments.iter().map(|f| f.delta_text.as_str()).collect();
    assert_eq!(text, "Hello");
    assert!(fragments.windows(2).all(|w| w[0].sequence_index <= w[1].sequence_index));
    assert_eq!(fragments.iter().filter(|f| f.is_final).count(), 1);
    let last = fragments.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_streaming_open_failure_is_returned_directly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let result = provider(&server, Duration::from_secs(5))
        .complete_streaming(&request(true))
        .await;
    assert!(matches!(result, Err(UpstreamError::RateLimited(_))));
}

#[tokio::test]
async fn test_streaming_rejects_non_event_stream_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let result = provider(&server, Duration::from_secs(5))
        .complete_streaming(&request(true))
        .await;
    assert!(matches!(result, Err(UpstreamError::Unknown(_))));
}

#[tokio::test]
async fn test_streaming_error_chunk_is_first_item() {
    let body = "data: {\"error\":{\"message\":\"model overloaded\"}}\n\n";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let mut stream = provider(&server, Duration::from_secs(5))
        .complete_streaming(&request(true))
        .await
        .unwrap();
    let first = stream.next().await.unwrap();
    assert!(matches!(first, Err(UpstreamError::Unknown(msg)) if msg.contains("overloaded")));
    assert!(stream.next().await.is_none());
}
