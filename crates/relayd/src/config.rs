//! Daemon configuration.
//!
//! Configuration is resolved from defaults, then `RELAY_*` environment
//! variables, then CLI flags. The daemon itself reads no config file;
//! the only state it persists is the discovery cache under the config
//! directory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8787;

/// Default tmux window name prefix.
pub const DEFAULT_PREFIX: &str = "relay";

/// Default CLI binary name.
pub const DEFAULT_CLI_BINARY: &str = "claude";

/// Default maximum number of concurrent owned tmux sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default window dimensions for freshly spawned tmux sessions.
pub const DEFAULT_COLS: u16 = 200;
pub const DEFAULT_ROWS: u16 = 50;

/// Default WebSocket heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of unanswered pings before a socket is terminated.
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 3;

/// A labelled root directory that new sessions may be created under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRoot {
    pub label: String,
    pub path: PathBuf,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP listener.
    pub host: IpAddr,
    pub port: u16,

    /// Pre-shared key required as a bearer credential on all routes
    /// except the status probe.
    pub auth_token: String,

    /// Name or path of the assistant CLI binary spawned inside windows.
    pub cli_binary: String,

    /// Prefix for owned tmux session names (`<prefix>-<session-id>`).
    pub tmux_prefix: String,

    /// Maximum number of concurrently owned tmux sessions.
    pub max_sessions: usize,

    /// Dimensions for freshly created windows.
    pub default_cols: u16,
    pub default_rows: u16,

    /// WebSocket heartbeat settings.
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,

    /// Roots that `/api/directories` lists and `/api/sessions/new`
    /// validates project paths against.
    pub project_roots: Vec<ProjectRoot>,

    /// Root of the CLI's conversation logs
    /// (`~/.claude/projects/<hash>/<session>.jsonl`).
    pub log_root: PathBuf,

    /// Daemon config directory (created with mode 0700); holds the
    /// discovery cache file.
    pub config_dir: PathBuf,
}

impl Config {
    /// Builds the configuration from environment variables over defaults.
    ///
    /// `RELAY_TOKEN` is the only security-sensitive knob: when unset a
    /// random token is generated and logged once so the operator can
    /// copy it into a client.
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

        let auth_token = match std::env::var("RELAY_TOKEN") {
            Ok(t) if !t.is_empty() => t,
            _ => {
                let token = generate_token();
                warn!(token = %token, "RELAY_TOKEN not set; generated a one-off token");
                token
            }
        };

        let port = std::env::var("RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let host = std::env::var("RELAY_HOST")
            .ok()
            .and_then(|h| h.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let cli_binary =
            std::env::var("RELAY_CLI_BINARY").unwrap_or_else(|_| DEFAULT_CLI_BINARY.to_string());

        let tmux_prefix =
            std::env::var("RELAY_TMUX_PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string());

        let max_sessions = std::env::var("RELAY_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SESSIONS);

        let project_roots = std::env::var("RELAY_PROJECT_ROOTS")
            .ok()
            .map(|v| parse_project_roots(&v))
            .filter(|roots| !roots.is_empty())
            .unwrap_or_else(|| {
                vec![ProjectRoot {
                    label: "home".to_string(),
                    path: home.clone(),
                }]
            });

        let log_root = std::env::var("RELAY_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".claude").join("projects"));

        let config_dir = std::env::var("RELAY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| home.join(".config"))
                    .join("relayd")
            });

        Self {
            host,
            port,
            auth_token,
            cli_binary,
            tmux_prefix,
            max_sessions,
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
            project_roots,
            log_root,
            config_dir,
        }
    }

    /// Path of the persisted discovery cache file.
    pub fn session_cache_path(&self) -> PathBuf {
        self.config_dir.join("sessions.json")
    }

    /// Ensures the config directory exists with owner-only permissions.
    pub fn ensure_config_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.config_dir, perms)?;
        }
        Ok(())
    }
}

/// Parses `label=path,label=path` (or bare `path`) into project roots.
fn parse_project_roots(value: &str) -> Vec<ProjectRoot> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.split_once('=') {
            Some((label, path)) if !label.is_empty() && !path.is_empty() => Some(ProjectRoot {
                label: label.to_string(),
                path: PathBuf::from(path),
            }),
            None => {
                let path = PathBuf::from(part);
                let label = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("projects")
                    .to_string();
                Some(ProjectRoot { label, path })
            }
            _ => None,
        })
        .collect()
}

/// Generates a 32-byte random token, base64url-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
