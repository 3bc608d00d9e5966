use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::identity::ClientIdentity;
use crate::orchestrator::{GatewayResponse, StreamMode};
use crate::relay::RelayEvent;
use crate::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// POST /inference - single-shot, or streamed when the body sets `"stream": true`
async fn inference(
    State(state): State<Arc<AppState>>,
    client: ClientIdentity,
    body: Bytes,
) -> Result<Response, GatewayError> {
    dispatch(&state, &client, &body, StreamMode::FromRequest).await
}

/// POST /stream - always streamed
async fn stream(
    State(state): State<Arc<AppState>>,
    client: ClientIdentity,
    body: Bytes,
) -> Result<Response, GatewayError> {
    dispatch(&state, &client, &body, StreamMode::Forced).await
}

async fn dispatch(
    state: &AppState,
    client: &ClientIdentity,
    body: &[u8],
    mode: StreamMode,
) -> Result<Response, GatewayError> {
    match state.gateway.handle(client, body, mode).await? {
        GatewayResponse::Completed(completion) => Ok(Json(completion).into_response()),
        GatewayResponse::Streaming(rx) => Ok(sse_response(rx)),
    }
}

/// Wrap relay events in an SSE body.
///
/// Dropping the body (client disconnect) drops the receiver, which is how
/// the relay learns to stop.
fn sse_response(rx: mpsc::Receiver<RelayEvent>) -> Response {
    Sse::new(sse_events(rx))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}

fn sse_events(rx: mpsc::Receiver<RelayEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx).map(|event| Ok(to_sse_event(&event)))
}

pub(crate) fn to_sse_event(event: &RelayEvent) -> Event {
    let (name, encoded) = match event {
        RelayEvent::Fragment(fragment) => {
            let name = if fragment.is_final { "done" } else { "fragment" };
            (name, Event::default().json_data(fragment))
        }
        RelayEvent::Error(body) => ("error", Event::default().json_data(body)),
    };
    match encoded {
        Ok(sse) => sse.event(name),
        Err(e) => {
            tracing::error!("Failed to encode stream event: {}", e);
            Event::default().event("error").data(r#"{"error":{"type":"internal_error","message":"encoding failed"}}"#)
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/inference", post(inference))
        .route("/stream", post(stream))
        .route("/v1/inference", post(inference))
        .route("/v1/inference/stream", post(stream))
        .with_state(state)
}
