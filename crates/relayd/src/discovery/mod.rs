//! Session discovery - watches and parses the CLI's conversation logs.
//!
//! The CLI writes one JSONL file per session under
//! `<log-root>/<project-hash>/<session-id>.jsonl`. Discovery keeps an
//! in-memory metadata map in sync with that tree three ways:
//!
//! - a full scan at startup and every 120 s as a safety net,
//! - a recursive filesystem watcher with a short write-stability window,
//! - unlink handling that drops entries immediately.
//!
//! Mutations schedule a debounced cache save (5 s) and a debounced,
//! coalesced `change` broadcast (2 s) that the SSE fan-out subscribes to.
//!
//! # Async Safety
//!
//! All filesystem operations run via `spawn_blocking` so the scanner
//! never stalls the runtime.

mod cache;
mod scan;

pub use scan::PREVIEW_MAX_CHARS;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{MessageRole, SessionId, SessionMeta};

/// Safety-net full rescan interval.
pub const FULL_RESCAN_INTERVAL: Duration = Duration::from_secs(120);

/// Quiet period before a watched file is considered fully written.
pub const WRITE_STABILITY_WINDOW: Duration = Duration::from_millis(500);

/// Delay before a mutation is flushed to the cache file.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Coalescing window for `change` events.
pub const CHANGE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Preview installed when a brand-new file cannot be read.
pub const UNREADABLE_PREVIEW: &str = "(unable to read)";

/// Errors that can occur starting discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to watch {path}: {message}")]
    WatchFailed { path: PathBuf, message: String },
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct DiscoveryState {
    /// Session id -> metadata. An entry exists iff a readable log file
    /// was seen for it (modulo unlink races repaired by the next scan).
    sessions: HashMap<SessionId, SessionMeta>,
    /// Log path -> last seen mtime (millis); unchanged files are skipped.
    mtimes: HashMap<PathBuf, i64>,
}

// ============================================================================
// Discovery Service
// ============================================================================

/// Watches the CLI log directory and maintains the metadata map.
pub struct DiscoveryService {
    log_root: PathBuf,
    cache_path: PathBuf,
    state: Mutex<DiscoveryState>,
    change_tx: broadcast::Sender<()>,
    save_pending: Notify,
    change_pending: Notify,
    cancel: CancellationToken,
}

impl DiscoveryService {
    pub fn new(log_root: PathBuf, cache_path: PathBuf, cancel: CancellationToken) -> Arc<Self> {
        let (change_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            log_root,
            cache_path,
            state: Mutex::new(DiscoveryState::default()),
            change_tx,
            save_pending: Notify::new(),
            change_pending: Notify::new(),
            cancel,
        })
    }

    /// Loads the cache, performs the initial scan, and starts the
    /// watcher plus all periodic tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        // Best-effort warm start from the persisted cache
        let cached = {
            let path = self.cache_path.clone();
            tokio::task::spawn_blocking(move || cache::load(&path))
                .await
                .unwrap_or_default()
        };
        if !cached.is_empty() {
            let mut state = self.lock_state();
            for meta in cached {
                state.sessions.insert(meta.id.clone(), meta);
            }
            info!(sessions = state.sessions.len(), "Loaded session cache");
        }

        self.scan_all().await;

        self.spawn_watcher()?;
        self.spawn_rescan_task();
        self.spawn_save_task();
        self.spawn_change_task();

        info!(root = %self.log_root.display(), "Session discovery started");
        Ok(())
    }

    /// Stops background work and flushes the cache synchronously.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.save_now().await;
        info!("Session discovery stopped");
    }

    /// Subscribes to debounced change events.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All known sessions, newest first.
    pub fn get_all(&self) -> Vec<SessionMeta> {
        let state = self.lock_state();
        let mut sessions: Vec<SessionMeta> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        sessions
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionMeta> {
        self.lock_state().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock_state().sessions.contains_key(id)
    }

    /// Sessions grouped by project key, each group newest first.
    pub fn get_by_project(&self) -> HashMap<String, Vec<SessionMeta>> {
        let mut grouped: HashMap<String, Vec<SessionMeta>> = HashMap::new();
        for meta in self.get_all() {
            grouped
                .entry(meta.project_key().to_string())
                .or_default()
                .push(meta);
        }
        grouped
    }

    /// CLI version of the most recently active session, for the status
    /// route.
    pub fn latest_cli_version(&self) -> Option<String> {
        self.get_all().into_iter().find_map(|m| m.cli_version)
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Scans every `<hash>/<session>.jsonl` under the log root.
    ///
    /// Files with unchanged mtimes are skipped; entries whose files were
    /// not seen in the pass are removed.
    pub async fn scan_all(self: &Arc<Self>) {
        let root = self.log_root.clone();
        let files = tokio::task::spawn_blocking(move || list_log_files(&root))
            .await
            .unwrap_or_default();

        let mut seen: HashSet<PathBuf> = HashSet::with_capacity(files.len());
        let mut mutated = false;

        for (path, project_hash, id) in files {
            seen.insert(path.clone());
            if self.scan_file_inner(&path, &project_hash, &id).await {
                mutated = true;
            }
        }

        // Drop entries whose files disappeared between scans
        {
            let mut state = self.lock_state();
            let stale: Vec<PathBuf> = state
                .mtimes
                .keys()
                .filter(|path| !seen.contains(*path))
                .cloned()
                .collect();
            for path in stale {
                state.mtimes.remove(&path);
                if let Some(id) = session_id_from_path(&path) {
                    if state.sessions.remove(&id).is_some() {
                        debug!(session_id = %id, "Removed stale session");
                        mutated = true;
                    }
                }
            }
        }

        if mutated {
            self.mark_mutated();
        }
    }

    /// Re-parses one log file after a watcher event.
    pub async fn scan_file(self: &Arc<Self>, path: &Path) {
        let Some((project_hash, id)) = identify_log_file(&self.log_root, path) else {
            return;
        };
        if self.scan_file_inner(path, &project_hash, &id).await {
            self.mark_mutated();
        }
    }

    /// Handles an unlink event.
    pub fn remove_file(&self, path: &Path) {
        let Some(id) = session_id_from_path(path) else {
            return;
        };
        let removed = {
            let mut state = self.lock_state();
            state.mtimes.remove(path);
            state.sessions.remove(&id).is_some()
        };
        if removed {
            debug!(session_id = %id, "Session log unlinked");
            self.mark_mutated();
        }
    }

    /// Parses one file and installs the result. Returns true when the
    /// map changed.
    async fn scan_file_inner(
        self: &Arc<Self>,
        path: &Path,
        project_hash: &str,
        id: &SessionId,
    ) -> bool {
        let (mtime_ms, timestamp) = match file_mtime(path) {
            Some(pair) => pair,
            None => return false,
        };

        // Skip files that have not changed since the last pass
        {
            let state = self.lock_state();
            if state.mtimes.get(path) == Some(&mtime_ms) {
                return false;
            }
        }

        let parse_path = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || scan::parse_log_file(&parse_path)).await;

        let meta = match parsed {
            Ok(Ok(parsed)) => {
                let project_path = parsed
                    .project_path
                    .unwrap_or_else(|| scan::synthesize_project_path(project_hash));
                SessionMeta {
                    id: id.clone(),
                    project_hash: project_hash.to_string(),
                    project_path,
                    last_message_preview: parsed.last_message_preview,
                    last_message_role: parsed.last_message_role,
                    timestamp,
                    cli_version: parsed.cli_version,
                }
            }
            Ok(Err(e)) => {
                // Keep whatever we knew; install a placeholder only for
                // files we have never read successfully.
                warn!(path = %path.display(), error = %e, "Failed to read session log");
                let mut state = self.lock_state();
                if state.sessions.contains_key(id) {
                    state.mtimes.insert(path.to_path_buf(), mtime_ms);
                    return false;
                }
                SessionMeta {
                    id: id.clone(),
                    project_hash: project_hash.to_string(),
                    project_path: scan::synthesize_project_path(project_hash),
                    last_message_preview: Some(UNREADABLE_PREVIEW.to_string()),
                    last_message_role: MessageRole::Unknown,
                    timestamp,
                    cli_version: None,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Log parse task panicked");
                return false;
            }
        };

        let mut state = self.lock_state();
        state.mtimes.insert(path.to_path_buf(), mtime_ms);
        let changed = state.sessions.get(id) != Some(&meta);
        if changed {
            state.sessions.insert(id.clone(), meta);
        }
        changed
    }

    // ------------------------------------------------------------------
    // Background Tasks
    // ------------------------------------------------------------------

    /// Starts the recursive watcher and its event-stability loop.
    fn spawn_watcher(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let (event_tx, event_rx) = mpsc::channel::<notify::Event>(256);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    // Drop events if the daemon is falling behind; the
                    // periodic rescan repairs anything missed.
                    let _ = event_tx.try_send(event);
                }
                Err(e) => warn!(error = %e, "Watcher error"),
            })
            .map_err(|e| DiscoveryError::WatchFailed {
                path: self.log_root.clone(),
                message: e.to_string(),
            })?;

        if self.log_root.exists() {
            watcher
                .watch(&self.log_root, RecursiveMode::Recursive)
                .map_err(|e| DiscoveryError::WatchFailed {
                    path: self.log_root.clone(),
                    message: e.to_string(),
                })?;
        } else {
            warn!(root = %self.log_root.display(), "Log root missing; watcher idle until rescan finds it");
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task
            let _watcher = watcher;
            service.run_watch_loop(event_rx).await;
        });

        Ok(())
    }

    /// Applies watcher events once files have been quiet for the
    /// stability window.
    async fn run_watch_loop(self: Arc<Self>, mut events: mpsc::Receiver<notify::Event>) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Watcher loop shutting down");
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else { break };
                    for path in event.paths {
                        if !is_log_file(&path) {
                            continue;
                        }
                        if matches!(event.kind, notify::EventKind::Remove(_)) {
                            pending.remove(&path);
                            self.remove_file(&path);
                        } else {
                            pending.insert(path, Instant::now());
                        }
                    }
                }

                _ = tick.tick() => {
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, seen)| seen.elapsed() >= WRITE_STABILITY_WINDOW)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        if path.exists() {
                            self.scan_file(&path).await;
                        } else {
                            self.remove_file(&path);
                        }
                    }
                }
            }
        }
    }

    fn spawn_rescan_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FULL_RESCAN_INTERVAL);
            tick.tick().await; // the startup scan already ran
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        debug!("Running safety-net full rescan");
                        service.scan_all().await;
                    }
                }
            }
        });
    }

    fn spawn_save_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = service.save_pending.notified() => {
                        if !wait_for_quiet(&service.cancel, &service.save_pending, SAVE_DEBOUNCE).await {
                            break;
                        }
                        service.save_now().await;
                    }
                }
            }
        });
    }

    fn spawn_change_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = service.change_pending.notified() => {
                        if !wait_for_quiet(&service.cancel, &service.change_pending, CHANGE_DEBOUNCE).await {
                            break;
                        }
                        // Subscriber lag or absence is fine
                        let _ = service.change_tx.send(());
                    }
                }
            }
        });
    }

    /// Flushes the current map to the cache file.
    pub async fn save_now(&self) {
        let entries: Vec<SessionMeta> = {
            let state = self.lock_state();
            state.sessions.values().cloned().collect()
        };
        let path = self.cache_path.clone();
        let result = tokio::task::spawn_blocking(move || cache::save(&path, entries)).await;

        match result {
            Ok(Ok(())) => debug!("Session cache saved"),
            Ok(Err(e)) => warn!(error = %e, "Failed to save session cache"),
            Err(e) => warn!(error = %e, "Cache save task panicked"),
        }
    }

    fn mark_mutated(&self) {
        self.save_pending.notify_one();
        self.change_pending.notify_one();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DiscoveryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Trailing-edge debounce: resolves once `notify` has been quiet for a
/// full `window`. Every fresh notification restarts the timer, so a
/// sustained burst produces one firing after the burst ends, not one
/// per window. Returns false when cancelled instead.
async fn wait_for_quiet(cancel: &CancellationToken, notify: &Notify, window: Duration) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = notify.notified() => continue,
            _ = tokio::time::sleep(window) => return true,
        }
    }
}

// ============================================================================
// Path Helpers
// ============================================================================

fn is_log_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
}

/// Extracts a session id from a log file's stem.
fn session_id_from_path(path: &Path) -> Option<SessionId> {
    let stem = path.file_stem()?.to_str()?;
    SessionId::parse(stem).ok()
}

/// Splits a path under the log root into `(project_hash, session_id)`.
///
/// Only depth-2 paths shaped like `<root>/<hash>/<uuid>.jsonl` qualify,
/// which also filters out `agent-*.jsonl` subagent transcripts.
fn identify_log_file(root: &Path, path: &Path) -> Option<(String, SessionId)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let hash = components.next()?.as_os_str().to_str()?.to_string();
    components.next()?;
    if components.next().is_some() {
        return None;
    }
    let id = session_id_from_path(path)?;
    Some((hash, id))
}

/// Lists all log files in the tree. Blocking.
fn list_log_files(root: &Path) -> Vec<(PathBuf, String, SessionId)> {
    let mut files = Vec::new();
    let Ok(hash_dirs) = std::fs::read_dir(root) else {
        return files;
    };

    for hash_entry in hash_dirs.flatten() {
        let hash_dir = hash_entry.path();
        if !hash_dir.is_dir() {
            continue;
        }
        let Some(hash) = hash_dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        let Ok(logs) = std::fs::read_dir(&hash_dir) else {
            continue;
        };
        for log_entry in logs.flatten() {
            let path = log_entry.path();
            if !is_log_file(&path) {
                continue;
            }
            let Some(id) = session_id_from_path(&path) else {
                continue;
            };
            files.push((path, hash.clone(), id));
        }
    }

    files
}

fn file_mtime(path: &Path) -> Option<(i64, chrono::DateTime<chrono::Utc>)> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let timestamp: chrono::DateTime<chrono::Utc> = modified.into();
    Some((timestamp.timestamp_millis(), timestamp))
}

// ============================================================================
// Tests
// ============================================================================
