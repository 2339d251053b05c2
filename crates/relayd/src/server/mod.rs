//! HTTP/SSE/WebSocket surface.
//!
//! All routes live under `/api` except the terminal WebSocket. The
//! status probe is the only unauthenticated route; everything else
//! requires `Authorization: Bearer <psk>`, and the terminal upgrade is
//! authorized by a single-use attach token instead.

mod error;
mod rate_limit;
mod routes;
mod sse;
mod ws;

pub use error::ApiError;
pub use rate_limit::{AttachRateLimiter, ATTACH_WINDOW};
pub use ws::{CLOSE_BAD_REQUEST, CLOSE_UNAUTHORIZED};

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::{authorize_bearer, AttachTokens};
use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::registry::SessionRegistry;
use crate::terminal::TerminalBridge;
use crate::tmux::TmuxManager;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub discovery: Arc<DiscoveryService>,
    pub tmux: Arc<TmuxManager>,
    pub bridge: Arc<TerminalBridge>,
    pub registry: Arc<SessionRegistry>,
    pub tokens: Arc<AttachTokens>,
    pub rate_limiter: Arc<AttachRateLimiter>,
    pub started_at: Instant,
}

/// Builds the complete router.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/sessions/stream", get(sse::sessions_stream))
        .route("/api/sessions/new", post(routes::new_session))
        .route("/api/sessions/kill-all", post(routes::kill_all_sessions))
        .route("/api/sessions/:id", get(routes::get_session))
        .route("/api/sessions/:id/attach", post(routes::attach_session))
        .route("/api/sessions/:id/kill", post(routes::kill_session))
        .route("/api/projects", get(routes::list_projects))
        .route("/api/directories", get(routes::list_directories))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/api/status", get(routes::status))
        .route("/terminal/:id", get(ws::terminal_ws))
        .merge(authed)
        .with_state(state)
}

/// Middleware enforcing the pre-shared key on API routes.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if !authorize_bearer(header, &state.config.auth_token) {
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// Serves until the cancellation token fires, then drains gracefully.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);

    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
