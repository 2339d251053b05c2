//! API error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use relay_protocol::{ErrorBody, ErrorCode};

use crate::tmux::TmuxError;

/// Failures a route can surface to a client.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("invalid session id")]
    InvalidSessionId,

    #[error("missing or invalid bearer credential")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("directory not found: {0}")]
    DirNotFound(String),

    #[error("path is outside the configured project roots")]
    Forbidden,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("attach rate limit exceeded")]
    RateLimited,

    #[error("session already has an active client")]
    SessionAttached,

    #[error("a CLI process is already running this session")]
    SessionConflict,

    #[error("maximum concurrent sessions reached (max: {max})")]
    MaxSessions { max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSessionId | Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::DirNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionAttached | Self::SessionConflict | Self::MaxSessions { .. } => {
                StatusCode::CONFLICT
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSessionId => ErrorCode::InvalidSessionId,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::DirNotFound(_) => ErrorCode::DirNotFound,
            Self::Forbidden => ErrorCode::Forbidden,
            Self::InvalidPath(_) => ErrorCode::InvalidPath,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::SessionAttached => ErrorCode::SessionAttached,
            Self::SessionConflict => ErrorCode::SessionConflict,
            Self::MaxSessions { .. } => ErrorCode::MaxSessions,
            Self::Internal(_) => ErrorCode::Unknown,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::new(self.code(), self.to_string());
        (self.status(), Json(body)).into_response()
    }
}

impl From<TmuxError> for ApiError {
    fn from(err: TmuxError) -> Self {
        match err {
            TmuxError::SessionAttached => Self::SessionAttached,
            TmuxError::SessionConflict => Self::SessionConflict,
            TmuxError::MaxSessions { max } => Self::MaxSessions { max },
            TmuxError::CommandFailed { .. } => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::InvalidSessionId.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::SessionAttached.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::MaxSessions { max: 10 }.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_tmux_error_mapping() {
        assert!(matches!(
            ApiError::from(TmuxError::SessionAttached),
            ApiError::SessionAttached
        ));
        assert!(matches!(
            ApiError::from(TmuxError::MaxSessions { max: 3 }),
            ApiError::MaxSessions { max: 3 }
        ));
        assert!(matches!(
            ApiError::from(TmuxError::CommandFailed {
                command: "new-session".into(),
                message: "boom".into()
            }),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_conflict_action_hint() {
        let body = ErrorBody::new(ErrorCode::SessionConflict, "conflict");
        assert!(body.action.contains("Close the CLI on your host"));
    }
}
