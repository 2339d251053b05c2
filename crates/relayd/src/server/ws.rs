//! WebSocket upgrade for `/terminal/:id`.
//!
//! Browsers cannot set headers on a WebSocket upgrade, so the single-use
//! attach token rides in the query string. Authorization failures still
//! complete the upgrade and then close with a 44xx code the client knows
//! not to retry; only a successful consume hands the socket to the
//! terminal bridge.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, warn};

use relay_core::SessionId;

use super::AppState;

/// Close code for malformed session ids on the upgrade path.
pub const CLOSE_BAD_REQUEST: u16 = 4400;

/// Close code for token failures (invalid, expired, mismatched, used).
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Query parameters on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub token: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// `GET /terminal/:id?token=&cols=&rows=`
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    let session_id = match SessionId::parse(&id) {
        Ok(id) => id,
        Err(_) => {
            warn!(raw = %id, "Rejecting terminal upgrade with invalid session id");
            return ws.on_upgrade(|socket| close_with(socket, CLOSE_BAD_REQUEST, "Invalid session id"));
        }
    };

    // Consume the single-use token before the socket exists so two
    // racing upgrades with the same token cannot both pass.
    if let Err(e) = state.tokens.consume(&query.token, &session_id) {
        warn!(session_id = %session_id, error = %e, "Rejecting terminal upgrade");
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_UNAUTHORIZED, "Invalid attach token"));
    }

    let cols = query.cols.unwrap_or(state.config.default_cols);
    let rows = query.rows.unwrap_or(state.config.default_rows);
    let window_name = state.tmux.window_name(&session_id);

    debug!(session_id = %session_id, cols, rows, "Terminal upgrade authorized");

    ws.on_upgrade(move |socket| async move {
        state
            .bridge
            .attach(session_id, window_name, socket, cols, rows)
            .await;
    })
}

/// Completes the upgrade only to deliver a close frame.
async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
