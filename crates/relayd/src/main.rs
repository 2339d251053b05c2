//! Relay daemon - exposes Claude CLI tmux sessions over HTTP/WebSocket.
//!
//! This binary runs as a background daemon on the host where the CLI
//! lives. It discovers sessions from the CLI's conversation logs and
//! lets authenticated remote clients list, attach to, resume, and
//! create sessions.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! relayd start
//!
//! # Start the daemon (background/daemonized)
//! relayd start -d
//!
//! # Stop the daemon
//! relayd stop
//!
//! # Check daemon status
//! relayd status
//!
//! # Required credential for API clients
//! RELAY_TOKEN=<psk> relayd start
//!
//! # Enable debug logging
//! RUST_LOG=relayd=debug relayd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: graceful shutdown (drain sockets, kill PTYs,
//!   flush the session cache)

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relayd::auth::AttachTokens;
use relayd::config::Config;
use relayd::discovery::DiscoveryService;
use relayd::registry::SessionRegistry;
use relayd::server::{self, AppState, AttachRateLimiter};
use relayd::terminal::{BridgeSettings, TerminalBridge};
use relayd::tmux::{TmuxManager, TmuxSettings};

/// How often expired attach tokens are swept.
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Relay daemon for Claude CLI sessions
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    let state_dir = dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relayd");
    state_dir.join("relayd.pid")
}

/// Returns the path to the daemon log file.
fn log_file_path() -> PathBuf {
    let state_dir = dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relayd");
    state_dir.join("relayd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

/// Removes the PID file.
fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from(format!("/proc/{pid}")).exists()
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file - remove it
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'relayd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Daemonize before starting the tokio runtime
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon();
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Wait for the process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                let port = std::env::var("RELAY_PORT")
                    .unwrap_or_else(|_| relayd::config::DEFAULT_PORT.to_string());
                println!("Port: {port}");
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_core=info".parse()?)
                .add_directive("relay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Relay daemon starting"
    );

    let config = Arc::new(Config::from_env());
    config
        .ensure_config_dir()
        .context("Failed to create config directory")?;

    let cancel = CancellationToken::new();

    // Signal handling
    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // Terminal bridge (owns the active-terminal map)
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let bridge = TerminalBridge::new(
        BridgeSettings {
            heartbeat_interval: config.heartbeat_interval,
            max_missed_pongs: config.max_missed_pongs,
            home_dir,
        },
        cancel.clone(),
    );
    bridge.spawn_reaper_task();

    // Tmux manager consults the bridge for liveness
    let tmux = Arc::new(TmuxManager::new(
        TmuxSettings {
            prefix: config.tmux_prefix.clone(),
            cli_binary: config.cli_binary.clone(),
            cols: config.default_cols,
            rows: config.default_rows,
            max_sessions: config.max_sessions,
        },
        Arc::clone(&bridge) as Arc<dyn relayd::tmux::ConnectionWatch>,
    ));

    if !tmux.is_available().await {
        warn!("tmux not found on PATH; session attach will fail until it is installed");
    }

    // Reconcile whatever a previous run left behind
    let adopted = tmux.reconcile().await;
    for id in &adopted {
        info!(session_id = %id, "Adopted existing window");
    }
    tmux.spawn_refresh_task(cancel.clone());

    // Session discovery
    let discovery = DiscoveryService::new(
        config.log_root.clone(),
        config.session_cache_path(),
        cancel.clone(),
    );
    discovery
        .start()
        .await
        .context("Failed to start session discovery")?;

    // Registry composes the three
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&discovery),
        Arc::clone(&tmux),
        Arc::clone(&bridge) as Arc<dyn relayd::tmux::ConnectionWatch>,
    ));

    // Attach tokens and their sweeper
    let tokens = Arc::new(AttachTokens::new());
    let sweeper_tokens = Arc::clone(&tokens);
    let sweeper_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweeper_cancel.cancelled() => break,
                _ = tick.tick() => {
                    sweeper_tokens.sweep();
                }
            }
        }
    });

    let rate_limiter = Arc::new(AttachRateLimiter::new());
    rate_limiter.spawn_sweeper(cancel.clone());

    let state = AppState {
        config: Arc::clone(&config),
        discovery: Arc::clone(&discovery),
        tmux,
        bridge: Arc::clone(&bridge),
        registry,
        tokens,
        rate_limiter,
        started_at: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind((config.host, config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;

    if let Err(e) = server::serve(state, listener, cancel.clone()).await {
        error!(error = %e, "Server error");
        cancel.cancel();
    }

    // Shutdown: sockets are drained, now close PTYs and flush the cache
    bridge.stop().await;
    discovery.stop().await;

    info!("Relay daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
