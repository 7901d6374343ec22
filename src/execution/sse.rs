//! Server-Sent Events rendering of a run's dedicated stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::events::{ExecutionEvent, RunStream};

/// Turn a run stream into an SSE response.
///
/// Each frame carries `event: <type>` and the JSON event as `data`. The
/// response ends when the engine drops its side of the stream. A zero
/// `keepalive` disables keep-alive comments.
pub fn run_stream_sse(stream: RunStream, keepalive: Duration) -> Response {
    tracing::debug!(run_id = %stream.run_id, "execution stream attached");
    let events = ReceiverStream::new(stream.receiver).map(|event| Ok::<_, Infallible>(to_sse_event(&event)));

    let sse = Sse::new(events);
    if keepalive.is_zero() {
        sse.into_response()
    } else {
        sse.keep_alive(KeepAlive::new().interval(keepalive).text("keep-alive"))
            .into_response()
    }
}

fn to_sse_event(event: &ExecutionEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().event(event.event_name()).data(json),
        Err(e) => {
            tracing::warn!(event = event.event_name(), error = %e, "failed to serialize execution event");
            let fallback = ExecutionEvent::run_error(format!("Failed to serialize event: {}", e));
            let data = serde_json::to_string(&fallback).unwrap_or_else(|_| "{}".to_string());
            Event::default().event("run_error").data(data)
        }
    }
}
