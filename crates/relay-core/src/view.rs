//! Enriched session views served over the API.
//!
//! A view combines discovery metadata with the tmux window snapshot and
//! the terminal bridge's live-connection predicate. Views are built per
//! request or per change event and never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::session::{MessageRole, SessionMeta};

// ============================================================================
// Tmux Status
// ============================================================================

/// Whether a session's tmux window exists and has a client attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TmuxStatus {
    /// Window exists and a client is attached.
    Active,
    /// Window exists but no client is attached.
    Detached,
    /// No window exists for this session.
    #[default]
    None,
}

impl TmuxStatus {
    /// Display label, also used as the `claudeState` fallback.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Detached => "detached",
            Self::None => "none",
        }
    }
}

// ============================================================================
// Claude State
// ============================================================================

/// Coarse activity state derived from the last message role and the
/// tmux window status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaudeState {
    /// Assistant spoke last; waiting on the user.
    Waiting,
    /// User spoke last; the assistant is presumably working.
    Thinking,
    /// No window exists; nothing is running.
    Idle,
    /// Window exists but the last role could not be determined.
    Unknown,
}

impl ClaudeState {
    /// Derives the state from `(lastMessageRole, tmuxStatus)`:
    /// no window means idle regardless of the log contents; otherwise
    /// the last speaker decides.
    #[must_use]
    pub fn derive(role: MessageRole, tmux: TmuxStatus) -> Self {
        match (tmux, role) {
            (TmuxStatus::None, _) => Self::Idle,
            (_, MessageRole::Assistant) => Self::Waiting,
            (_, MessageRole::User) => Self::Thinking,
            (_, MessageRole::Unknown) => Self::Unknown,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Thinking => "thinking",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Session View
// ============================================================================

/// One session as presented to API clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub meta: SessionMeta,

    /// Window status from the tmux manager's last cached snapshot.
    pub tmux_status: TmuxStatus,

    /// True iff the terminal bridge holds a live terminal for this id.
    pub has_active_connection: bool,

    /// Derived activity state.
    pub claude_state: ClaudeState,

    /// Human-readable state label. For `claudeState: unknown` this falls
    /// back to the tmux status label so clients always have something to
    /// show.
    pub state_label: String,
}

impl SessionView {
    /// Builds a view from discovery metadata plus the window snapshot and
    /// connection predicate results.
    #[must_use]
    pub fn build(meta: SessionMeta, tmux_status: TmuxStatus, has_active_connection: bool) -> Self {
        let claude_state = ClaudeState::derive(meta.last_message_role, tmux_status);
        let state_label = match claude_state {
            ClaudeState::Unknown => tmux_status.label().to_string(),
            other => other.label().to_string(),
        };
        Self {
            meta,
            tmux_status,
            has_active_connection,
            claude_state,
            state_label,
        }
    }
}

// ============================================================================
// Project Grouping
// ============================================================================

/// Summary of the sessions sharing one project directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGroup {
    pub project_path: String,
    pub project_name: String,
    pub session_count: usize,
    pub latest_timestamp: DateTime<Utc>,
}

impl ProjectGroup {
    /// Derives the display name for a project path: its final component,
    /// or the whole path when there is none (e.g. `/`).
    #[must_use]
    pub fn name_for_path(path: &str) -> String {
        Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(path)
            .to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn meta_with_role(role: MessageRole) -> SessionMeta {
        SessionMeta {
            id: SessionId::generate(),
            project_hash: "-home-user-proj".to_string(),
            project_path: "/home/user/proj".to_string(),
            last_message_preview: Some("hi".to_string()),
            last_message_role: role,
            timestamp: Utc::now(),
            cli_version: None,
        }
    }

    #[test]
    fn test_derive_no_window_is_idle() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::Unknown] {
            assert_eq!(
                ClaudeState::derive(role, TmuxStatus::None),
                ClaudeState::Idle
            );
        }
    }

    #[test]
    fn test_derive_assistant_is_waiting() {
        assert_eq!(
            ClaudeState::derive(MessageRole::Assistant, TmuxStatus::Detached),
            ClaudeState::Waiting
        );
        assert_eq!(
            ClaudeState::derive(MessageRole::Assistant, TmuxStatus::Active),
            ClaudeState::Waiting
        );
    }

    #[test]
    fn test_derive_user_is_thinking() {
        assert_eq!(
            ClaudeState::derive(MessageRole::User, TmuxStatus::Detached),
            ClaudeState::Thinking
        );
    }

    #[test]
    fn test_derive_unknown_role_with_window() {
        assert_eq!(
            ClaudeState::derive(MessageRole::Unknown, TmuxStatus::Active),
            ClaudeState::Unknown
        );
    }

    #[test]
    fn test_view_state_label_fallback() {
        // Unknown state falls back to the tmux status label
        let view = SessionView::build(
            meta_with_role(MessageRole::Unknown),
            TmuxStatus::Detached,
            false,
        );
        assert_eq!(view.claude_state, ClaudeState::Unknown);
        assert_eq!(view.state_label, "detached");

        // Known states use their own label
        let view = SessionView::build(
            meta_with_role(MessageRole::User),
            TmuxStatus::Active,
            true,
        );
        assert_eq!(view.state_label, "thinking");
    }

    #[test]
    fn test_view_serde_shape() {
        let view = SessionView::build(
            meta_with_role(MessageRole::Assistant),
            TmuxStatus::Detached,
            false,
        );
        let json = serde_json::to_value(&view).unwrap();
        // Metadata fields are flattened alongside the derived fields
        assert_eq!(json["projectPath"], "/home/user/proj");
        assert_eq!(json["tmuxStatus"], "detached");
        assert_eq!(json["claudeState"], "waiting");
        assert_eq!(json["hasActiveConnection"], false);
    }

    #[test]
    fn test_project_name_for_path() {
        assert_eq!(ProjectGroup::name_for_path("/home/user/proj"), "proj");
        assert_eq!(ProjectGroup::name_for_path("/"), "/");
        assert_eq!(ProjectGroup::name_for_path(""), "");
        assert_eq!(ProjectGroup::name_for_path("-home-user"), "-home-user");
    }
}
