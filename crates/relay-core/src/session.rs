//! Session identity and metadata value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a Claude Code session.
///
/// Wraps a canonical UUID v4 string (e.g., "8e11bfb5-7dc2-432b-9206-928fa5c35731").
/// Session ids originate from transcript filenames and API path parameters,
/// both untrusted, so construction validates the canonical 8-4-4-4-12 hex
/// form before the id can ever reach a process argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Parses and validates a session id.
    ///
    /// Accepts only the canonical lowercase hyphenated UUID v4 form:
    /// 36 characters, hyphens at positions 8/13/18/23, hex everywhere
    /// else, version nibble `4` and variant nibble in `8..=b`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidSessionId` for anything else, including
    /// uppercase, braced, URN, or un-hyphenated UUID spellings.
    pub fn parse(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if is_canonical_uuid_v4(&id) {
            Ok(Self(id))
        } else {
            Err(DomainError::InvalidSessionId { value: id })
        }
    }

    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        // uuid's hyphenated Display is the canonical lowercase form
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Checks whether a string is a canonical lowercase hyphenated UUID v4.
fn is_canonical_uuid_v4(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }

    for (i, &b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if b != b'-' {
                    return false;
                }
            }
            // Version nibble: must be 4
            14 => {
                if b != b'4' {
                    return false;
                }
            }
            // Variant nibble: 8, 9, a, b
            19 => {
                if !matches!(b, b'8' | b'9' | b'a' | b'b') {
                    return false;
                }
            }
            _ => {
                if !matches!(b, b'0'..=b'9' | b'a'..=b'f') {
                    return false;
                }
            }
        }
    }

    true
}

// ============================================================================
// Message Role
// ============================================================================

/// Role of the most recent message in a session's conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[default]
    Unknown,
}

impl MessageRole {
    /// Parses a log record's `type` field into a role.
    ///
    /// Anything that is not a user or assistant record maps to `Unknown`.
    pub fn from_record_type(record_type: &str) -> Self {
        match record_type {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Session Metadata
// ============================================================================

/// Metadata for one session, harvested from its conversation log file.
///
/// Owned by the discovery component; each full or incremental scan
/// replaces the record wholesale, so instances are treated as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    /// Session id (also the log file's stem).
    pub id: SessionId,

    /// The on-disk directory name containing the log file.
    pub project_hash: String,

    /// Absolute path where the CLI was invoked. Harvested from the first
    /// record's `cwd` field, or synthesized from `project_hash`.
    pub project_path: String,

    /// Up to 200 characters of the most recent user/assistant message,
    /// with a trailing ellipsis when truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,

    /// Role of the most recent user/assistant message.
    pub last_message_role: MessageRole,

    /// Modification time of the log file.
    pub timestamp: DateTime<Utc>,

    /// CLI version string harvested from the log, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_version: Option<String>,
}

impl SessionMeta {
    /// Returns the grouping key for by-project listings: the project path
    /// when known, otherwise the raw hash directory name.
    pub fn project_key(&self) -> &str {
        if self.project_path.is_empty() {
            &self.project_hash
        } else {
            &self.project_path
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "8e11bfb5-7dc2-432b-9206-928fa5c35731";

    #[test]
    fn test_parse_valid_uuid_v4() {
        let id = SessionId::parse(VALID).unwrap();
        assert_eq!(id.as_str(), VALID);
        assert_eq!(id.short(), "8e11bfb5");
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("8e11bfb5").is_err());
        assert!(SessionId::parse(format!("{VALID}0")).is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase() {
        assert!(SessionId::parse(VALID.to_uppercase()).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        // Version nibble 1 instead of 4
        assert!(SessionId::parse("8e11bfb5-7dc2-132b-9206-928fa5c35731").is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_variant() {
        // Variant nibble 'c' is outside 8..=b
        assert!(SessionId::parse("8e11bfb5-7dc2-432b-c206-928fa5c35731").is_err());
    }

    #[test]
    fn test_parse_rejects_shell_metacharacters() {
        assert!(SessionId::parse("8e11bfb5-7dc2-432b-9206-928fa5c3573;").is_err());
        assert!(SessionId::parse("$(id)bfb5-7dc2-432b-9206-928fa5c35731").is_err());
        assert!(SessionId::parse("8e11bfb5-7dc2-432b-9206 928fa5c35731").is_err());
    }

    #[test]
    fn test_parse_rejects_unhyphenated_and_urn_forms() {
        assert!(SessionId::parse("8e11bfb57dc2432b9206928fa5c35731").is_err());
        assert!(SessionId::parse(format!("urn:uuid:{VALID}")).is_err());
        assert!(SessionId::parse(format!("{{{VALID}}}")).is_err());
    }

    #[test]
    fn test_generate_is_canonical() {
        for _ in 0..64 {
            let id = SessionId::generate();
            assert!(SessionId::parse(id.as_str()).is_ok(), "bad id: {id}");
        }
    }

    #[test]
    fn test_message_role_from_record_type() {
        assert_eq!(MessageRole::from_record_type("user"), MessageRole::User);
        assert_eq!(
            MessageRole::from_record_type("assistant"),
            MessageRole::Assistant
        );
        assert_eq!(
            MessageRole::from_record_type("summary"),
            MessageRole::Unknown
        );
        assert_eq!(MessageRole::from_record_type(""), MessageRole::Unknown);
    }

    #[test]
    fn test_message_role_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        let role: MessageRole = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, MessageRole::User);
    }

    #[test]
    fn test_session_meta_project_key() {
        let id = SessionId::parse(VALID).unwrap();
        let mut meta = SessionMeta {
            id,
            project_hash: "-home-user-proj".to_string(),
            project_path: "/home/user/proj".to_string(),
            last_message_preview: None,
            last_message_role: MessageRole::Unknown,
            timestamp: Utc::now(),
            cli_version: None,
        };
        assert_eq!(meta.project_key(), "/home/user/proj");

        meta.project_path = String::new();
        assert_eq!(meta.project_key(), "-home-user-proj");
    }

    #[test]
    fn test_session_meta_serde_camel_case() {
        let meta = SessionMeta {
            id: SessionId::parse(VALID).unwrap(),
            project_hash: "-tmp-x".to_string(),
            project_path: "/tmp/x".to_string(),
            last_message_preview: Some("hello".to_string()),
            last_message_role: MessageRole::User,
            timestamp: Utc::now(),
            cli_version: Some("2.1.0".to_string()),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["projectHash"], "-tmp-x");
        assert_eq!(json["lastMessageRole"], "user");
        assert_eq!(json["cliVersion"], "2.1.0");
    }
}
