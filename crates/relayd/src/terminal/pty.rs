//! PTY process management using portable-pty.
//!
//! The bridge runs `tmux attach-session` under a fresh PTY per client.
//! Blocking reads and writes happen on dedicated threads bridged to
//! tokio channels, so the async side only ever awaits.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Terminal type advertised to the attached process.
const TERM: &str = "xterm-256color";

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 8192;

/// Errors from PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn command in pty: {0}")]
    Spawn(String),

    #[error("pty i/o channel closed")]
    ChannelClosed,

    #[error("failed to resize pty: {0}")]
    Resize(String),
}

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A child process running under a PTY with async I/O channels.
pub struct PtyProcess {
    write_tx: mpsc::Sender<Vec<u8>>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    child: std::sync::Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns `tmux attach-session -t <window>` under a new PTY.
    ///
    /// The daemon itself needs no controlling TTY; the PTY pair is
    /// created directly. The child inherits the environment with `TERM`
    /// pinned, and runs from the user's home directory.
    pub fn spawn_attach(window_name: &str, size: TermSize, home: &Path) -> Result<Self, PtyError> {
        let mut cmd = CommandBuilder::new("tmux");
        cmd.args(["attach-session", "-t", window_name]);
        cmd.env("TERM", TERM);
        cmd.cwd(home);
        Self::spawn(cmd, size)
    }

    /// Spawns an arbitrary command under a new PTY.
    pub fn spawn(cmd: CommandBuilder, size: TermSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        std::thread::spawn(move || reader_loop(reader, read_tx));
        std::thread::spawn(move || writer_loop(writer, write_rx));

        Ok(Self {
            write_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            master: std::sync::Mutex::new(pair.master),
            child: std::sync::Mutex::new(child),
            pid,
        })
    }

    /// Receives the next chunk of PTY output, or `None` on EOF.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Writes bytes to the PTY as terminal input.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        self.write_tx
            .send(data)
            .await
            .map_err(|_| PtyError::ChannelClosed)
    }

    /// Resizes the PTY (delivers SIGWINCH to the child).
    pub fn resize(&self, size: TermSize) -> Result<(), PtyError> {
        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::Resize("master mutex poisoned".to_string()))?;
        master
            .resize(size.into())
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// OS process id of the child, when known.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has exited.
    pub fn has_exited(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .map(|status| status.is_some())
            .unwrap_or(true)
    }

    /// Asks the child to terminate (SIGTERM).
    pub fn signal_term(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                debug!(pid, "SIGTERM delivery failed (process likely gone)");
            }
        }
        #[cfg(not(unix))]
        self.force_kill();
    }

    /// Forcibly kills the child (SIGKILL) and reaps its exit status.
    pub fn force_kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Kill failed (process likely gone)");
            }
            let _ = child.try_wait();
        }
    }

    /// Waits up to `deadline` for the child to exit.
    pub async fn wait_exit(&self, deadline: Duration) -> bool {
        let poll = Duration::from_millis(100);
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.has_exited() {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        self.has_exited()
    }
}

/// Reader thread: PTY -> channel. Exits on EOF or a closed channel.
fn reader_loop(mut reader: Box<dyn Read + Send>, read_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("PTY reader reached EOF");
                break;
            }
            Ok(n) => {
                if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writer thread: channel -> PTY. Exits when the channel closes.
fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = write_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data) {
            warn!(error = %e, "PTY write failed");
            break;
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "PTY flush failed");
            break;
        }
    }
    debug!("PTY writer exiting");
}

// ============================================================================
// Tests
// ============================================================================
