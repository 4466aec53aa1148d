//! Server-Sent Events relay for conversation streams

use crate::runtime::ConversationEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Combine an initial snapshot with the conversation's broadcast stream
pub fn sse_stream(
    init: serde_json::Value,
    broadcast_rx: tokio::sync::broadcast::Receiver<ConversationEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move {
        Ok(Event::default().event("init").data(init.to_string()))
    });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(event_to_sse(&event))),
        // Lagged receivers skip ahead; the UI resyncs from message ids
        Err(_) => None,
    });

    Sse::new(init.chain(broadcasts)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn event_to_sse(event: &ConversationEvent) -> Event {
    let (event_type, data) = match event {
        ConversationEvent::Message { message } => (
            "message",
            json!({
                "type": "message",
                "message": message,
            }),
        ),
        ConversationEvent::StateChange { state } => (
            "state_change",
            json!({
                "type": "state_change",
                "state": state,
            }),
        ),
        ConversationEvent::AgentDone { turn_id, error, .. } => (
            "agent_done",
            json!({
                "type": "agent_done",
                "turn_id": turn_id,
                "error": error,
            }),
        ),
    };

    Event::default().event(event_type).data(data.to_string())
}
