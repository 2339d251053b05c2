//! Bearer credential check and single-use attach tokens.
//!
//! Every route except the status probe requires `Authorization: Bearer
//! <psk>`. A successful attach additionally mints a 30-second, single-use
//! token that authorizes exactly one WebSocket upgrade for that session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace};

use relay_core::SessionId;

/// Lifetime of an attach token.
pub const TOKEN_TTL: Duration = Duration::from_secs(30);

/// Number of random bytes in a token.
const TOKEN_BYTES: usize = 32;

// ============================================================================
// Bearer Credential
// ============================================================================

/// Compares two byte strings in constant time.
///
/// Scans the full length of both inputs regardless of where they first
/// differ, so response timing does not leak the matching prefix length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validates an `Authorization` header value against the pre-shared key.
///
/// Accepts only the exact `Bearer <psk>` shape; missing, malformed, or
/// mismatched credentials all fail identically.
pub fn authorize_bearer(header: Option<&str>, psk: &str) -> bool {
    let Some(value) = header else {
        return false;
    };
    let Some(candidate) = value.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(candidate.as_bytes(), psk.as_bytes())
}

// ============================================================================
// Attach Tokens
// ============================================================================

/// Why a token failed to consume.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    /// The token is unknown (never minted, already consumed, or swept).
    #[error("unknown attach token")]
    Invalid,

    /// The token exists but its lifetime has passed.
    #[error("attach token expired")]
    Expired,

    /// The token was minted for a different session.
    #[error("attach token does not match session")]
    Mismatch,

    /// The token was already consumed.
    #[error("attach token already used")]
    AlreadyUsed,
}

#[derive(Debug)]
struct TokenEntry {
    session_id: SessionId,
    expires_at: Instant,
    used: bool,
}

/// Store of outstanding attach tokens.
///
/// The interior mutex makes lookup-and-mark-used atomic: two concurrent
/// consumers of the same token serialize, and exactly one succeeds.
#[derive(Debug, Default)]
pub struct AttachTokens {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl AttachTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh token for a session.
    ///
    /// 32 bytes of OS randomness, base64url-encoded, valid for 30 s.
    pub fn generate(&self, session_id: SessionId) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let entry = TokenEntry {
            session_id,
            expires_at: Instant::now() + TOKEN_TTL,
            used: false,
        };

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(token.clone(), entry);
        }

        token
    }

    /// Atomically consumes a token for the given session.
    ///
    /// On success the entry is removed from the store; it can never be
    /// consumed again. All failures leave the entry in place for the
    /// sweeper so that retries keep reporting the precise reason.
    pub fn consume(&self, token: &str, session_id: &SessionId) -> Result<(), ConsumeError> {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return Err(ConsumeError::Invalid),
        };

        let entry = entries.get_mut(token).ok_or(ConsumeError::Invalid)?;

        if entry.used {
            return Err(ConsumeError::AlreadyUsed);
        }
        if Instant::now() >= entry.expires_at {
            return Err(ConsumeError::Expired);
        }
        if &entry.session_id != session_id {
            return Err(ConsumeError::Mismatch);
        }

        entry.used = true;
        entries.remove(token);
        Ok(())
    }

    /// Removes expired entries. Called periodically by the sweeper task.
    pub fn sweep(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept expired attach tokens");
        } else {
            trace!(outstanding = entries.len(), "Token sweep found nothing to remove");
        }
        removed
    }

    /// Number of outstanding (unswept) tokens.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(token) {
                entry.expires_at = Instant::now() - Duration::from_secs(1);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
