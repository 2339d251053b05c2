//! HTTP route handlers.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::Json;
use tracing::{info, warn};

use relay_core::SessionId;
use relay_protocol::{
    AttachResponse, DirectoryEntry, KillAllResponse, KillResponse, NewSessionRequest,
    NewSessionResponse, StatusResponse, TmuxSessionInfo, API_VERSION,
};

use super::error::ApiError;
use super::AppState;

/// Parses and validates a session id path parameter.
fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(raw).map_err(|_| ApiError::InvalidSessionId)
}

// ============================================================================
// Status
// ============================================================================

/// `GET /api/status` - the unauthenticated reachability probe.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let tmux_sessions = state
        .tmux
        .list_owned()
        .await
        .into_iter()
        .map(|(session_id, window)| TmuxSessionInfo {
            session_id,
            attached: window.attached,
            created: window.created,
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION,
        claude: state.discovery.latest_cli_version(),
        active_sessions: state.bridge.active_count(),
        tmux_sessions,
        uptime: state.started_at.elapsed().as_secs(),
    })
}

// ============================================================================
// Sessions
// ============================================================================

/// `GET /api/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Json<Vec<relay_core::SessionView>> {
    Json(state.registry.list_sessions().await)
}

/// `GET /api/sessions/:id`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<relay_core::SessionView>, ApiError> {
    let id = parse_session_id(&id)?;
    state
        .registry
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))
}

/// `POST /api/sessions/:id/attach`
pub async fn attach_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AttachResponse>, ApiError> {
    let id = parse_session_id(&id)?;

    if !state.rate_limiter.check(&id) {
        return Err(ApiError::RateLimited);
    }

    // The session must be known from its log, or already have a window
    // we can adopt (a resumed session whose log rotated away).
    if !state.registry.has_session(&id) {
        let owned = state.tmux.list_owned().await;
        if !owned.iter().any(|(owned_id, _)| owned_id == &id) {
            return Err(ApiError::NotFound(format!("session {id} not found")));
        }
    }

    let project_path = state.registry.project_path_of(&id).map(PathBuf::from);
    let outcome = state.tmux.attach(&id, project_path.as_deref()).await?;

    let attach_token = state.tokens.generate(id.clone());
    info!(session_id = %id, existed = outcome.existed, "Attach authorized");

    Ok(Json(AttachResponse {
        ws_url: format!("/terminal/{id}"),
        tmux_session: outcome.window_name,
        existed: outcome.existed,
        attach_token,
    }))
}

/// `POST /api/sessions/:id/kill`
pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KillResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let window_name = state.tmux.window_name(&id);

    let existed = state.tmux.kill_session(&window_name).await?;
    info!(session_id = %id, existed, "Kill requested");

    Ok(Json(KillResponse {
        success: true,
        existed,
    }))
}

/// `POST /api/sessions/kill-all`
pub async fn kill_all_sessions(
    State(state): State<AppState>,
) -> Result<Json<KillAllResponse>, ApiError> {
    let killed = state.tmux.kill_all_owned().await;
    info!(killed, "Killed all owned windows");

    Ok(Json(KillAllResponse {
        success: true,
        killed,
    }))
}

// ============================================================================
// Projects & Directories
// ============================================================================

/// `GET /api/projects`
pub async fn list_projects(
    State(state): State<AppState>,
) -> Json<Vec<relay_core::ProjectGroup>> {
    Json(state.registry.grouped_by_project())
}

/// `GET /api/directories` - subdirectories of every configured root.
pub async fn list_directories(
    State(state): State<AppState>,
) -> Json<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();

    for root in &state.config.project_roots {
        let Ok(mut dir) = tokio::fs::read_dir(&root.path).await else {
            warn!(root = %root.path.display(), "Project root unreadable");
            continue;
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            entries.push(DirectoryEntry {
                name: name.to_string(),
                path: path.to_string_lossy().into_owned(),
                group: root.label.clone(),
            });
        }
    }

    entries.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
    Json(entries)
}

// ============================================================================
// New Session
// ============================================================================

/// `POST /api/sessions/new`
pub async fn new_session(
    State(state): State<AppState>,
    Json(request): Json<NewSessionRequest>,
) -> Result<Json<NewSessionResponse>, ApiError> {
    let project_path = validate_project_path(&state, &request.project_path).await?;

    let (session_id, tmux_session) = state.tmux.create_new(&project_path).await?;
    let attach_token = state.tokens.generate(session_id.clone());
    info!(session_id = %session_id, path = %project_path.display(), "New session created");

    Ok(Json(NewSessionResponse {
        ws_url: format!("/terminal/{session_id}"),
        session_id,
        tmux_session,
        attach_token,
    }))
}

/// Validates a requested project path: absolute, existing directory,
/// inside a configured root.
async fn validate_project_path(state: &AppState, raw: &str) -> Result<PathBuf, ApiError> {
    if raw.is_empty() || !FsPath::new(raw).is_absolute() {
        return Err(ApiError::InvalidPath(
            "projectPath must be an absolute path".to_string(),
        ));
    }

    // Canonicalize to defeat `..` traversal before the containment check
    let requested = tokio::fs::canonicalize(raw)
        .await
        .map_err(|_| ApiError::DirNotFound(raw.to_string()))?;

    let metadata = tokio::fs::metadata(&requested)
        .await
        .map_err(|_| ApiError::DirNotFound(raw.to_string()))?;
    if !metadata.is_dir() {
        return Err(ApiError::DirNotFound(raw.to_string()));
    }

    for root in &state.config.project_roots {
        let Ok(root_path) = tokio::fs::canonicalize(&root.path).await else {
            continue;
        };
        if requested.starts_with(&root_path) {
            return Ok(requested);
        }
    }

    Err(ApiError::Forbidden)
}
