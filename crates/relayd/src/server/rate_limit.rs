//! Per-session attach rate limiting.
//!
//! One attach per session per five seconds; excess requests get 429.
//! Entries older than a minute are swept so the map tracks only
//! recently active sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::SessionId;

/// Minimum spacing between attaches to the same session.
pub const ATTACH_WINDOW: Duration = Duration::from_secs(5);

/// How often stale entries are swept, and how old they must be.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Tracks the last attach instant per session.
#[derive(Debug, Default)]
pub struct AttachRateLimiter {
    entries: Mutex<HashMap<SessionId, Instant>>,
}

impl AttachRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an attach is allowed now, recording the attempt.
    ///
    /// Denied attempts do not refresh the window; a client hammering the
    /// route gets its original slot back after five seconds.
    pub fn check(&self, id: &SessionId) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return true;
        };
        let now = Instant::now();
        match entries.get(id) {
            Some(last) if now.duration_since(*last) < ATTACH_WINDOW => false,
            _ => {
                entries.insert(id.clone(), now);
                true
            }
        }
    }

    /// Removes entries past the staleness horizon.
    pub fn sweep(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, last| now.duration_since(*last) < STALE_AFTER);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept stale rate-limit entries");
                        }
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn backdate(&self, id: &SessionId, age: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.clone(), Instant::now() - age);
        }
    }
}
