//! Per-session mutual exclusion.
//!
//! The attach decision is a read-check-write sequence over the tmux
//! manager's state; overlapping attempts for the same session must
//! serialize while distinct sessions proceed in parallel. Locks are
//! lazily instantiated and held for the duration of the decision only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use relay_core::SessionId;

/// Map of session id to its mutual-exclusion primitive.
///
/// A coarse mutex protects insertion; the per-id async mutexes are what
/// callers actually hold across await points. Fairness is not required.
#[derive(Debug, Default, Clone)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for a session, waiting if another task holds it.
    ///
    /// The returned guard releases on drop, including on error paths.
    pub async fn acquire(&self, id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(m) => m,
                // A poisoned map only means a panic elsewhere; recover the data
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(map.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops lock entries that no task currently holds.
    ///
    /// Keeps the map from growing with ids of long-gone sessions.
    pub fn prune(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        }
    }

    /// Number of tracked lock entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_serializes() {
        let locks = SessionLocks::new();
        let id = SessionId::generate();

        // Track maximum concurrency inside the critical section
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let id = id.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&id).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_run_in_parallel() {
        let locks = SessionLocks::new();
        let a = SessionId::generate();
        let b = SessionId::generate();

        let guard_a = locks.acquire(&a).await;
        // Acquiring a different id must not block
        let acquired =
            tokio::time::timeout(Duration::from_millis(100), locks.acquire(&b)).await;
        assert!(acquired.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let locks = SessionLocks::new();
        let id = SessionId::generate();

        {
            let _guard = locks.acquire(&id).await;
        }
        // Lock is free again
        let reacquired =
            tokio::time::timeout(Duration::from_millis(100), locks.acquire(&id)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_prune_removes_idle_entries() {
        let locks = SessionLocks::new();
        let id = SessionId::generate();

        {
            let _guard = locks.acquire(&id).await;
            locks.prune();
            // Held lock survives pruning
            assert_eq!(locks.len(), 1);
        }

        locks.prune();
        assert!(locks.is_empty());
    }
}
