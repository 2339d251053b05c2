//! Relay Protocol - Wire types for the relay daemon's HTTP/WS surface
//!
//! This crate defines the JSON shapes exchanged with API clients:
//! error envelopes with actionable hints, request/response bodies for
//! every route, and the WebSocket control envelope.

pub mod control;
pub mod error;
pub mod message;

pub use control::{ControlMessage, CONTROL_VERSION};
pub use error::{ErrorBody, ErrorCode};
pub use message::{
    AttachResponse, DirectoryEntry, KillAllResponse, KillResponse, NewSessionRequest,
    NewSessionResponse, ProjectsResponse, SessionsResponse, StatusResponse, TmuxSessionInfo,
    API_VERSION,
};
