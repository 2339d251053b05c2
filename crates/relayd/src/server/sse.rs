//! Session-list streaming over Server-Sent Events.
//!
//! Clients get an initial `sessions` snapshot, then one event per
//! debounced discovery change (2 s coalescing, so bursts collapse into
//! a single push). A `: keepalive` comment goes out every 30 s.
//! Disconnected clients are pruned lazily when their stream is dropped.

use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::AppState;

/// Keep-alive comment interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /api/sessions/stream`
pub async fn sessions_stream(State(state): State<AppState>) -> impl IntoResponse {
    let changes = state.discovery.subscribe();
    debug!("SSE subscriber connected");

    // Initial snapshot so the client renders immediately
    let initial_state = state.clone();
    let initial = stream::once(async move {
        let views = initial_state.registry.list_sessions().await;
        Ok::<Event, std::convert::Infallible>(sessions_event(&views))
    });

    // One push per debounced change event
    let updates = stream::unfold((changes, state), |(mut changes, state)| async move {
        loop {
            match changes.recv().await {
                Ok(()) => {
                    let views = state.registry.list_sessions().await;
                    return Some((Ok(sessions_event(&views)), (changes, state)));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // Coalesced anyway; the next recv yields fresh state
                    debug!(skipped, "SSE subscriber lagged behind change events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("Change channel closed; ending SSE stream");
                    return None;
                }
            }
        }
    });

    let sse = Sse::new(initial.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );

    // Proxies must not buffer the event stream
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
}

/// Builds one `event: sessions` frame.
fn sessions_event(views: &[relay_core::SessionView]) -> Event {
    match Event::default().event("sessions").json_data(views) {
        Ok(event) => event,
        Err(e) => {
            // Serialization of our own types cannot realistically fail,
            // but an empty list beats tearing down the stream.
            debug!(error = %e, "Failed to serialize session views");
            Event::default().event("sessions").data("[]")
        }
    }
}
