//! Tmux window lifecycle for relay-owned sessions.
//!
//! Each relayed session is backed by a detached tmux session named
//! `<prefix>-<session-id>` running the assistant CLI. This module owns
//! window creation, adoption, teardown, the cached window listing, and
//! the conflict checks that gate an attach.
//!
//! All tmux invocations use explicit argument vectors; session ids are
//! validated UUIDs before they ever appear in an argv.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::SessionId;

use crate::lock::SessionLocks;

/// How long a cached window listing stays fresh.
pub const LIST_CACHE_TTL: Duration = Duration::from_secs(10);

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by tmux operations.
#[derive(Debug, Clone, Error)]
pub enum TmuxError {
    /// Another client already holds a live terminal for this session.
    #[error("session already has an active client")]
    SessionAttached,

    /// A CLI process is already running this session on the host.
    #[error("a CLI process is already running this session on the host")]
    SessionConflict,

    /// The owned-window capacity is exhausted.
    #[error("maximum concurrent sessions reached (max: {max})")]
    MaxSessions { max: usize },

    /// A tmux invocation failed.
    #[error("tmux {command} failed: {message}")]
    CommandFailed { command: String, message: String },
}

// ============================================================================
// Window Descriptor
// ============================================================================

/// One tmux session as reported by `list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxWindow {
    /// Session name (`<prefix>-<id>` for owned windows).
    pub name: String,
    /// Whether any tmux client is currently attached.
    pub attached: bool,
    /// Creation instant.
    pub created: DateTime<Utc>,
}

/// Result of an attach decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub window_name: String,
    /// True when an existing window was adopted rather than created.
    pub existed: bool,
}

// ============================================================================
// Connection Predicate
// ============================================================================

/// Answers "does this session currently have a live terminal?".
///
/// Implemented by the terminal bridge and injected at construction so the
/// manager and bridge have no cyclic ownership.
pub trait ConnectionWatch: Send + Sync {
    fn is_connected(&self, id: &SessionId) -> bool;
}

/// Predicate that reports no connections; used before the bridge exists
/// and in tests.
#[derive(Debug, Default)]
pub struct NoConnections;

impl ConnectionWatch for NoConnections {
    fn is_connected(&self, _id: &SessionId) -> bool {
        false
    }
}

// ============================================================================
// Tmux Manager
// ============================================================================

/// Settings the manager spawns windows with.
#[derive(Debug, Clone)]
pub struct TmuxSettings {
    pub prefix: String,
    pub cli_binary: String,
    pub cols: u16,
    pub rows: u16,
    pub max_sessions: usize,
}

type ListCache = Option<(Instant, Vec<TmuxWindow>)>;

/// Manager for relay-owned tmux windows.
pub struct TmuxManager {
    settings: TmuxSettings,
    connections: Arc<dyn ConnectionWatch>,
    locks: SessionLocks,
    cache: Mutex<ListCache>,
}

impl TmuxManager {
    pub fn new(settings: TmuxSettings, connections: Arc<dyn ConnectionWatch>) -> Self {
        Self {
            settings,
            connections,
            locks: SessionLocks::new(),
            cache: Mutex::new(None),
        }
    }

    /// The window name for a session id.
    pub fn window_name(&self, id: &SessionId) -> String {
        format!("{}-{}", self.settings.prefix, id)
    }

    /// Recovers the session id from an owned window name.
    ///
    /// Returns `None` for windows without our prefix or with a suffix
    /// that is not a canonical session id.
    pub fn session_id_of(&self, window_name: &str) -> Option<SessionId> {
        let suffix = window_name
            .strip_prefix(&self.settings.prefix)?
            .strip_prefix('-')?;
        SessionId::parse(suffix).ok()
    }

    /// Checks whether tmux is available on the host.
    pub async fn is_available(&self) -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------

    /// Returns all tmux sessions, serving from the cache when fresh.
    ///
    /// Transient tmux failures (including "no server running") empty the
    /// cache and read as "no windows".
    pub async fn list_windows(&self) -> Vec<TmuxWindow> {
        if let Ok(cache) = self.cache.lock() {
            if let Some((fetched_at, windows)) = cache.as_ref() {
                if fetched_at.elapsed() < LIST_CACHE_TTL {
                    return windows.clone();
                }
            }
        }
        self.refresh().await
    }

    /// Re-runs `list-sessions` and replaces the cache.
    pub async fn refresh(&self) -> Vec<TmuxWindow> {
        let windows = match self.run_list_sessions().await {
            Ok(windows) => windows,
            Err(e) => {
                debug!(error = %e, "tmux list-sessions failed; treating as no windows");
                Vec::new()
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), windows.clone()));
        }
        windows
    }

    /// Returns owned windows paired with their session ids.
    pub async fn list_owned(&self) -> Vec<(SessionId, TmuxWindow)> {
        self.list_windows()
            .await
            .into_iter()
            .filter_map(|w| self.session_id_of(&w.name).map(|id| (id, w)))
            .collect()
    }

    /// Drops the cached listing so the next read is fresh.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    async fn run_list_sessions(&self) -> Result<Vec<TmuxWindow>, TmuxError> {
        let output = run_tmux(&[
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_attached}\t#{session_created}",
        ])
        .await?;
        Ok(output.lines().filter_map(parse_list_line).collect())
    }

    // ------------------------------------------------------------------
    // Attach / Create
    // ------------------------------------------------------------------

    /// Decides how to satisfy an attach request for `id`.
    ///
    /// The whole sequence runs under the per-session lock: liveness check,
    /// host conflict probe, capacity check, then adopt-or-create. Distinct
    /// sessions proceed in parallel.
    pub async fn attach(
        &self,
        id: &SessionId,
        project_path: Option<&Path>,
    ) -> Result<AttachOutcome, TmuxError> {
        let _guard = self.locks.acquire(id).await;

        // 1. Reject while a client is bound to this session.
        if self.connections.is_connected(id) {
            return Err(TmuxError::SessionAttached);
        }

        // 2. Reject while the CLI is already resuming this id on the host.
        if probe_resume_conflict(&self.settings.cli_binary, id).await {
            return Err(TmuxError::SessionConflict);
        }

        // 3. Capacity, unless this id already owns a window.
        let window_name = self.window_name(id);
        let owned = self.list_owned_fresh().await;
        let already_owned = owned.iter().any(|(_, w)| w.name == window_name);
        if !already_owned && owned.len() >= self.settings.max_sessions {
            return Err(TmuxError::MaxSessions {
                max: self.settings.max_sessions,
            });
        }

        // 4. Adopt an existing window.
        if already_owned {
            debug!(session_id = %id, window = %window_name, "Adopting existing window");
            return Ok(AttachOutcome {
                window_name,
                existed: true,
            });
        }

        // 5. Spawn a fresh detached window resuming the session.
        self.spawn_window(&window_name, project_path, Some(id)).await?;
        info!(session_id = %id, window = %window_name, "Created window for resume");

        Ok(AttachOutcome {
            window_name,
            existed: false,
        })
    }

    /// Creates a window for a brand-new session at `project_path`.
    pub async fn create_new(&self, project_path: &Path) -> Result<(SessionId, String), TmuxError> {
        let owned = self.list_owned_fresh().await;
        if owned.len() >= self.settings.max_sessions {
            return Err(TmuxError::MaxSessions {
                max: self.settings.max_sessions,
            });
        }

        let id = SessionId::generate();
        let window_name = self.window_name(&id);
        self.spawn_window(&window_name, Some(project_path), None)
            .await?;

        info!(session_id = %id, window = %window_name, path = %project_path.display(), "Created window for new session");
        Ok((id, window_name))
    }

    /// Uncached owned listing; attach decisions must not act on stale data.
    async fn list_owned_fresh(&self) -> Vec<(SessionId, TmuxWindow)> {
        self.invalidate_cache();
        self.list_owned().await
    }

    async fn spawn_window(
        &self,
        window_name: &str,
        project_path: Option<&Path>,
        resume: Option<&SessionId>,
    ) -> Result<(), TmuxError> {
        let cols = self.settings.cols.to_string();
        let rows = self.settings.rows.to_string();

        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            window_name,
            "-x",
            &cols,
            "-y",
            &rows,
        ];

        let path_str;
        if let Some(path) = project_path {
            path_str = path.to_string_lossy().into_owned();
            args.push("-c");
            args.push(&path_str);
        }

        args.push(&self.settings.cli_binary);
        let id_str;
        if let Some(id) = resume {
            id_str = id.to_string();
            args.push("--resume");
            args.push(&id_str);
        }

        run_tmux(&args).await?;
        self.invalidate_cache();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Kills one window by name. Returns whether it existed.
    pub async fn kill_session(&self, window_name: &str) -> Result<bool, TmuxError> {
        let result = run_tmux(&["kill-session", "-t", window_name]).await;
        self.invalidate_cache();

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_missing_window_error(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Kills every owned window. Returns how many were killed.
    pub async fn kill_all_owned(&self) -> usize {
        let owned = self.list_owned_fresh().await;
        let mut killed = 0;

        for (id, window) in owned {
            match self.kill_session(&window.name).await {
                Ok(true) => killed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to kill window");
                }
            }
        }

        self.invalidate_cache();
        killed
    }

    // ------------------------------------------------------------------
    // Startup Reconciliation
    // ------------------------------------------------------------------

    /// Reconciles state left behind by a previous daemon run.
    ///
    /// Terminates orphaned `tmux attach-session` processes (exact
    /// argument match against our window names only), then returns the
    /// ids of surviving owned windows so the caller can adopt them.
    pub async fn reconcile(&self) -> Vec<SessionId> {
        let prefix = self.settings.prefix.clone();
        let killed = tokio::task::spawn_blocking(move || kill_orphan_attachers(&prefix))
            .await
            .unwrap_or(0);
        if killed > 0 {
            info!(killed, "Terminated orphaned attach processes");
        }

        self.invalidate_cache();
        let adopted: Vec<SessionId> = self
            .list_owned()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        if !adopted.is_empty() {
            info!(count = adopted.len(), "Adopted windows from previous run");
        }
        adopted
    }

    /// Spawns a background task keeping the window cache warm.
    pub fn spawn_refresh_task(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIST_CACHE_TTL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Window cache refresher shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        manager.refresh().await;
                    }
                }
            }
        });
    }

    /// Settings accessor for the API layer.
    pub fn settings(&self) -> &TmuxSettings {
        &self.settings
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Runs tmux with an explicit argument vector, returning stdout.
async fn run_tmux(args: &[&str]) -> Result<String, TmuxError> {
    let command = args.first().copied().unwrap_or("tmux").to_string();

    let output = Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|e| TmuxError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(TmuxError::CommandFailed {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses one `list-sessions` line: `name\tattached\tcreated-epoch`.
fn parse_list_line(line: &str) -> Option<TmuxWindow> {
    let mut parts = line.split('\t');
    let name = parts.next()?.to_string();
    if name.is_empty() {
        return None;
    }
    let attached = parts.next()? != "0";
    let epoch: i64 = parts.next()?.trim().parse().ok()?;
    let created = Utc.timestamp_opt(epoch, 0).single()?;

    Some(TmuxWindow {
        name,
        attached,
        created,
    })
}

/// Whether a kill error just means the window was already gone.
fn is_missing_window_error(err: &TmuxError) -> bool {
    match err {
        TmuxError::CommandFailed { message, .. } => {
            let message = message.to_ascii_lowercase();
            message.contains("can't find session")
                || message.contains("session not found")
                || message.contains("no server running")
        }
        _ => false,
    }
}

/// Scans the process table for a CLI process resuming `id`.
///
/// The argv must contain the resume flag immediately followed by the
/// exact session id; the id is already validated so no quoting concerns
/// arise.
async fn probe_resume_conflict(cli_binary: &str, id: &SessionId) -> bool {
    let cli_binary = cli_binary.to_string();
    let id = id.clone();
    tokio::task::spawn_blocking(move || scan_for_resume(&cli_binary, id.as_str()))
        .await
        .unwrap_or(false)
}

fn scan_for_resume(cli_binary: &str, id: &str) -> bool {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        ProcessRefreshKind::new().with_cmd(sysinfo::UpdateKind::Always),
    );

    for process in system.processes().values() {
        let cmd = process.cmd();
        if cmd.is_empty() {
            continue;
        }

        let argv0 = cmd[0].to_string_lossy();
        let is_cli = argv0 == cli_binary || argv0.ends_with(&format!("/{cli_binary}"));
        if !is_cli {
            continue;
        }

        let mut args = cmd.iter().skip(1);
        while let Some(arg) = args.next() {
            if arg.to_string_lossy() == "--resume" {
                if let Some(value) = args.next() {
                    if value.to_string_lossy() == id {
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Kills leftover `tmux attach-session -t <prefix>-<uuid>` processes.
///
/// Matches the exact argument shape only; anything else in the process
/// table is left alone.
fn kill_orphan_attachers(prefix: &str) -> usize {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        ProcessRefreshKind::new().with_cmd(sysinfo::UpdateKind::Always),
    );

    let mut killed = 0;
    for process in system.processes().values() {
        let cmd: Vec<String> = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        if is_orphan_attach_argv(&cmd, prefix) {
            debug!(pid = process.pid().as_u32(), "Killing orphaned attach process");
            if process.kill() {
                killed += 1;
            }
        }
    }
    killed
}

/// Recognizes exactly `[tmux, attach-session, -t, <prefix>-<uuid>]`.
fn is_orphan_attach_argv(argv: &[String], prefix: &str) -> bool {
    if argv.len() != 4 {
        return false;
    }
    let is_tmux = argv[0] == "tmux" || argv[0].ends_with("/tmux");
    if !is_tmux || argv[1] != "attach-session" || argv[2] != "-t" {
        return false;
    }
    argv[3]
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|suffix| SessionId::parse(suffix).is_ok())
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TmuxManager {
        TmuxManager::new(
            TmuxSettings {
                prefix: "relay".to_string(),
                cli_binary: "claude".to_string(),
                cols: 200,
                rows: 50,
                max_sessions: 10,
            },
            Arc::new(NoConnections),
        )
    }

    #[test]
    fn test_window_name_round_trip() {
        let m = manager();
        let id = SessionId::generate();
        let name = m.window_name(&id);
        assert!(name.starts_with("relay-"));
        assert_eq!(m.session_id_of(&name), Some(id));
    }

    #[test]
    fn test_session_id_of_rejects_foreign_windows() {
        let m = manager();
        assert_eq!(m.session_id_of("main"), None);
        assert_eq!(m.session_id_of("relay-"), None);
        assert_eq!(m.session_id_of("relay-not-a-uuid"), None);
        assert_eq!(m.session_id_of("other-8e11bfb5-7dc2-432b-9206-928fa5c35731"), None);
    }

    #[test]
    fn test_parse_list_line() {
        let window = parse_list_line("relay-abc\t1\t1700000000").unwrap();
        assert_eq!(window.name, "relay-abc");
        assert!(window.attached);
        assert_eq!(window.created.timestamp(), 1_700_000_000);

        let window = parse_list_line("main\t0\t1700000001").unwrap();
        assert!(!window.attached);
    }

    #[test]
    fn test_parse_list_line_rejects_garbage() {
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("name-only").is_none());
        assert!(parse_list_line("name\t1\tnot-a-number").is_none());
        assert!(parse_list_line("\t1\t1700000000").is_none());
    }

    #[test]
    fn test_is_missing_window_error() {
        let gone = TmuxError::CommandFailed {
            command: "kill-session".to_string(),
            message: "can't find session: relay-x".to_string(),
        };
        assert!(is_missing_window_error(&gone));

        let gone = TmuxError::CommandFailed {
            command: "kill-session".to_string(),
            message: "no server running on /tmp/tmux-1000/default".to_string(),
        };
        assert!(is_missing_window_error(&gone));

        let other = TmuxError::CommandFailed {
            command: "kill-session".to_string(),
            message: "permission denied".to_string(),
        };
        assert!(!is_missing_window_error(&other));
        assert!(!is_missing_window_error(&TmuxError::SessionAttached));
    }

    #[test]
    fn test_is_orphan_attach_argv() {
        let id = SessionId::generate();
        let good = vec![
            "tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("relay-{id}"),
        ];
        assert!(is_orphan_attach_argv(&good, "relay"));

        let abs_path = vec![
            "/usr/bin/tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("relay-{id}"),
        ];
        assert!(is_orphan_attach_argv(&abs_path, "relay"));

        // Foreign prefix
        let foreign = vec![
            "tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("other-{id}"),
        ];
        assert!(!is_orphan_attach_argv(&foreign, "relay"));

        // Invalid id suffix
        let bad_id = vec![
            "tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            "relay-bogus".to_string(),
        ];
        assert!(!is_orphan_attach_argv(&bad_id, "relay"));

        // Extra args mean this is not the exact shape we spawn
        let extra = vec![
            "tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("relay-{id}"),
            "-r".to_string(),
        ];
        assert!(!is_orphan_attach_argv(&extra, "relay"));
    }

    #[test]
    fn test_cache_invalidate() {
        let m = manager();
        {
            let mut cache = m.cache.lock().unwrap();
            *cache = Some((Instant::now(), vec![]));
        }
        m.invalidate_cache();
        assert!(m.cache.lock().unwrap().is_none());
    }
}
