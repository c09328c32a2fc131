use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::super::AppState;

/// Lifecycle transitions as `transition` events carrying JSON.
pub async fn transition_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.supervisor.subscribe()).map(|msg| {
        let event = match msg {
            Ok(transition) => Event::default()
                .event("transition")
                .json_data(&transition)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
            Err(_) => Event::default().event("lagged").data("Event stream lagged"),
        };
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn log_lines(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.log_tx.subscribe()).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Sse::new(stream)
}
