//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use relay_core::{ProjectGroup, SessionId, SessionView};
use serde::{Deserialize, Serialize};

/// API version reported by `GET /api/status`.
///
/// Bumped when the wire protocol changes incompatibly; clients compare
/// this before relying on newer fields.
pub const API_VERSION: u16 = 1;

// ============================================================================
// Status
// ============================================================================

/// One owned tmux session as reported by the status route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmuxSessionInfo {
    pub session_id: SessionId,
    pub attached: bool,
    pub created: DateTime<Utc>,
}

/// Response for `GET /api/status` (the one unauthenticated route).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Daemon version (from the crate manifest).
    pub version: String,
    /// Wire protocol version.
    pub api_version: u16,
    /// Most recent CLI version string seen in any conversation log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude: Option<String>,
    /// Number of live terminal bridges.
    pub active_sessions: usize,
    /// Owned tmux sessions.
    pub tmux_sessions: Vec<TmuxSessionInfo>,
    /// Seconds since the daemon started.
    pub uptime: u64,
}

// ============================================================================
// Attach / Kill
// ============================================================================

/// Response for a successful `POST /api/sessions/:id/attach`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachResponse {
    /// WebSocket path to open next, e.g. `/terminal/<id>`.
    pub ws_url: String,
    /// Name of the tmux session backing the terminal.
    pub tmux_session: String,
    /// True when an existing window was adopted rather than created.
    pub existed: bool,
    /// Single-use token for the WebSocket upgrade (expires in 30 s).
    pub attach_token: String,
}

/// Response for `POST /api/sessions/:id/kill`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillResponse {
    pub success: bool,
    pub existed: bool,
}

/// Response for `POST /api/sessions/kill-all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillAllResponse {
    pub success: bool,
    pub killed: usize,
}

// ============================================================================
// Projects / Directories / New Session
// ============================================================================

/// One subdirectory of a configured project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    /// Label of the project root this entry came from.
    pub group: String,
}

/// Request body for `POST /api/sessions/new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRequest {
    pub project_path: String,
}

/// Response for a successful `POST /api/sessions/new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: SessionId,
    pub ws_url: String,
    pub tmux_session: String,
    pub attach_token: String,
}

/// Response item type for `GET /api/projects` (re-exported for clarity).
pub type ProjectsResponse = Vec<ProjectGroup>;

/// Response item type for `GET /api/sessions`.
pub type SessionsResponse = Vec<SessionView>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_shape() {
        let resp = StatusResponse {
            version: "0.4.2".to_string(),
            api_version: API_VERSION,
            claude: Some("2.1.0".to_string()),
            active_sessions: 0,
            tmux_sessions: vec![],
            uptime: 12,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["apiVersion"], 1);
        assert_eq!(json["activeSessions"], 0);
        assert!(json["tmuxSessions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_attach_response_shape() {
        let id = SessionId::generate();
        let resp = AttachResponse {
            ws_url: format!("/terminal/{id}"),
            tmux_session: format!("relay-{id}"),
            existed: true,
            attach_token: "abc".to_string(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["wsUrl"], format!("/terminal/{id}"));
        assert_eq!(json["tmuxSession"], format!("relay-{id}"));
        assert_eq!(json["existed"], true);
        assert_eq!(json["attachToken"], "abc");
    }

    #[test]
    fn test_new_session_request_parses_camel_case() {
        let req: NewSessionRequest =
            serde_json::from_str(r#"{"projectPath":"/home/user/proj"}"#).unwrap();
        assert_eq!(req.project_path, "/home/user/proj");
    }
}
