//! API error envelope and error codes.
//!
//! Every user-visible failure is serialized as
//! `{error: CODE, message: "...", action: "..."}` where `action` is a
//! plain-English hint telling the user what to do about it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSessionId,
    InvalidPath,
    Forbidden,
    NotFound,
    DirNotFound,
    RateLimited,
    SessionAttached,
    SessionConflict,
    MaxSessions,
    Unauthorized,
    Timeout,
    Unknown,
}

impl ErrorCode {
    /// The default user-actionable hint for this code.
    #[must_use]
    pub fn default_action(&self) -> &'static str {
        match self {
            Self::InvalidSessionId => "Check the session id; it must be a UUID.",
            Self::InvalidPath => "Provide an absolute path inside a configured project root.",
            Self::Forbidden => "Pick a directory inside a configured project root.",
            Self::NotFound => "Refresh the session list and try again.",
            Self::DirNotFound => "Create the directory first, or pick an existing one.",
            Self::RateLimited => "Wait a few seconds before retrying.",
            Self::SessionAttached => "Disconnect the other client first, or pick a different session.",
            Self::SessionConflict => "Close the CLI on your host first, or pick a different session.",
            Self::MaxSessions => "Close an existing session before starting another.",
            Self::Unauthorized => "Check the relay token in your client settings.",
            Self::Timeout => "The host did not respond in time; try again.",
            Self::Unknown => "Try again; check the daemon logs if this persists.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidSessionId => "INVALID_SESSION_ID",
            Self::InvalidPath => "INVALID_PATH",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::DirNotFound => "DIR_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::SessionAttached => "SESSION_ATTACHED",
            Self::SessionConflict => "SESSION_CONFLICT",
            Self::MaxSessions => "MAX_SESSIONS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// JSON body returned with every 4xx/5xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    pub action: String,
}

impl ErrorBody {
    /// Builds a body with the code's default action hint.
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            action: error.default_action().to_string(),
        }
    }

    /// Builds a body with a custom action hint.
    pub fn with_action(
        error: ErrorCode,
        message: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            error,
            message: message.into(),
            action: action.into(),
        }
    }
}
