//! Terminal bridge - shuttles bytes between a PTY and a WebSocket.
//!
//! Each attached client gets a fresh PTY running `tmux attach-session`
//! against the session's window. PTY output is batched (~16 ms) into
//! single binary frames with FIFO eviction above 1 MiB and a 64 KiB
//! socket backpressure threshold; client binary frames are written to
//! the PTY verbatim and text frames carry the JSON control envelope.
//!
//! The bridge's terminal map is the single source of truth for "is a
//! client bound to this session right now?" - the tmux manager and the
//! registry consult it through [`ConnectionWatch`].

mod pty;

pub use pty::{PtyError, PtyProcess, TermSize};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::SessionId;
use relay_protocol::ControlMessage;

use crate::tmux::ConnectionWatch;

/// Cap on buffered PTY output awaiting a flush.
pub const OUTPUT_BUFFER_CAP: usize = 1024 * 1024;

/// Outbound bytes in flight above which a flush is deferred.
pub const BACKPRESSURE_LIMIT: usize = 64 * 1024;

/// Output batching interval.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(16);

/// Initial PTY output is discarded for this long, then the PTY is
/// resized to the client's dimensions to force a clean redraw.
pub const INITIAL_FLUSH_SUPPRESSION: Duration = Duration::from_millis(500);

/// How often terminals with dead sockets are reaped.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period between SIGTERM and SIGKILL during cleanup.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Close code for "this session already has an active terminal".
pub const CLOSE_ALREADY_ATTACHED: u16 = 4409;

/// Normal close after PTY exit.
pub const CLOSE_NORMAL: u16 = 1000;

// ============================================================================
// Output Buffer
// ============================================================================

/// FIFO buffer of pending PTY output chunks, bounded by byte count.
///
/// Appending past the cap evicts whole chunks from the head until the
/// new chunk fits, so any loss is a contiguous prefix - bytes are never
/// dropped out of order.
#[derive(Debug, Default)]
struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
}

impl OutputBuffer {
    fn push(&mut self, chunk: Vec<u8>) {
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > OUTPUT_BUFFER_CAP {
            match self.chunks.pop_front() {
                Some(evicted) => self.total -= evicted.len(),
                None => break,
            }
        }
    }

    /// Concatenates and drains everything buffered.
    fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.total = 0;
        out
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ============================================================================
// Active Terminal
// ============================================================================

/// One live PTY <-> WebSocket binding.
pub struct ActiveTerminal {
    pub session_id: SessionId,
    pub window_name: String,
    pub created: Instant,
    pty: PtyProcess,
    /// Set once by whichever path performs cleanup first.
    cleaned_up: AtomicBool,
    /// False once the socket pump has exited.
    ws_open: AtomicBool,
}

// ============================================================================
// Terminal Bridge
// ============================================================================

/// Heartbeat configuration for attached sockets.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    /// Working directory for spawned attach PTYs (the user's home).
    pub home_dir: PathBuf,
}

/// Owner of all active terminals.
pub struct TerminalBridge {
    terminals: Mutex<HashMap<SessionId, Arc<ActiveTerminal>>>,
    settings: BridgeSettings,
    cancel: CancellationToken,
}

impl TerminalBridge {
    pub fn new(settings: BridgeSettings, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            terminals: Mutex::new(HashMap::new()),
            settings,
            cancel,
        })
    }

    /// Number of live terminals.
    pub fn active_count(&self) -> usize {
        self.lock_terminals().len()
    }

    /// Binds a WebSocket to a session's window.
    ///
    /// Owns the socket from here on: on any failure the socket is closed
    /// with an appropriate code and the method returns.
    pub async fn attach(
        self: &Arc<Self>,
        session_id: SessionId,
        window_name: String,
        mut socket: WebSocket,
        cols: u16,
        rows: u16,
    ) {
        // A live terminal wins; a dead one is swept so we can proceed.
        let existing = self.lock_terminals().get(&session_id).cloned();
        if let Some(existing) = existing {
            if existing.ws_open.load(Ordering::SeqCst) {
                debug!(session_id = %session_id, "Rejecting second concurrent terminal");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_ALREADY_ATTACHED,
                        reason: "Session already has an active terminal".into(),
                    })))
                    .await;
                return;
            }
            self.cleanup(&session_id, &existing).await;
        }

        // Cosmetic: the relayed view should not show tmux's status bar
        disable_status_bar(&window_name).await;

        let size = TermSize { cols, rows };
        let pty = match PtyProcess::spawn_attach(&window_name, size, &self.settings.home_dir) {
            Ok(pty) => pty,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "PTY spawn failed");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 1011,
                        reason: "Failed to open terminal".into(),
                    })))
                    .await;
                return;
            }
        };

        let entry = Arc::new(ActiveTerminal {
            session_id: session_id.clone(),
            window_name,
            created: Instant::now(),
            pty,
            cleaned_up: AtomicBool::new(false),
            ws_open: AtomicBool::new(true),
        });
        self.lock_terminals()
            .insert(session_id.clone(), Arc::clone(&entry));

        info!(session_id = %session_id, window = %entry.window_name, "Terminal attached");

        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            run_pump(&bridge, &entry, socket, size).await;
            entry.ws_open.store(false, Ordering::SeqCst);
            bridge.cleanup(&entry.session_id, &entry).await;
            info!(session_id = %entry.session_id, "Terminal detached");
        });
    }

    /// Tears down one terminal. Idempotent: the PTY is terminated exactly
    /// once no matter how many paths race here.
    pub async fn cleanup(&self, session_id: &SessionId, entry: &Arc<ActiveTerminal>) {
        if entry.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut terminals = self.lock_terminals();
            // Only remove the map slot if it still points at this entry;
            // a replacement attach may already own it.
            if terminals
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                terminals.remove(session_id);
            }
        }

        entry.pty.signal_term();
        if !entry.pty.wait_exit(KILL_GRACE).await {
            debug!(session_id = %session_id, "PTY ignored SIGTERM; escalating");
            entry.pty.force_kill();
        }
    }

    /// Sweeps terminals whose sockets are gone.
    pub async fn reap_orphans(&self) {
        let orphans: Vec<(SessionId, Arc<ActiveTerminal>)> = self
            .lock_terminals()
            .iter()
            .filter(|(_, entry)| !entry.ws_open.load(Ordering::SeqCst))
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        for (id, entry) in orphans {
            debug!(session_id = %id, "Reaping orphaned terminal");
            self.cleanup(&id, &entry).await;
        }
    }

    /// Cleans up every terminal in parallel and waits for completion.
    pub async fn stop(&self) {
        let entries: Vec<(SessionId, Arc<ActiveTerminal>)> = self
            .lock_terminals()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let cleanups = entries
            .iter()
            .map(|(id, entry)| self.cleanup(id, entry));
        futures::future::join_all(cleanups).await;

        info!("Terminal bridge stopped");
    }

    /// Spawns the periodic orphan reaper.
    pub fn spawn_reaper_task(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = bridge.cancel.cancelled() => {
                        debug!("Orphan reaper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        bridge.reap_orphans().await;
                    }
                }
            }
        });
    }

    fn lock_terminals(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<ActiveTerminal>>> {
        match self.terminals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConnectionWatch for TerminalBridge {
    fn is_connected(&self, id: &SessionId) -> bool {
        self.lock_terminals().contains_key(id)
    }
}

/// Best-effort: hide the tmux status bar in the relayed window.
async fn disable_status_bar(window_name: &str) {
    let result = tokio::process::Command::new("tmux")
        .args(["set-option", "-t", window_name, "status", "off"])
        .output()
        .await;
    if let Err(e) = result {
        debug!(window = %window_name, error = %e, "Could not disable status bar");
    }
}

// ============================================================================
// Socket Pump
// ============================================================================

/// Returns the payload size used for backpressure accounting.
fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    }
}

/// Runs the bidirectional pump until the socket or PTY goes away.
async fn run_pump(
    bridge: &Arc<TerminalBridge>,
    entry: &Arc<ActiveTerminal>,
    socket: WebSocket,
    size: TermSize,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound frames funnel through a channel so the pump can observe
    // how many bytes the sender still has in flight.
    let inflight = Arc::new(AtomicUsize::new(0));
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    let sender_inflight = Arc::clone(&inflight);
    let sender = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let len = message_len(&msg);
            let closing = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() {
                break;
            }
            sender_inflight.fetch_sub(len, Ordering::SeqCst);
            if closing {
                let _ = ws_sink.flush().await;
                break;
            }
        }
    });

    let mut buffer = OutputBuffer::default();
    let suppress_until = Instant::now() + INITIAL_FLUSH_SUPPRESSION;
    let mut resized = false;

    let mut batch = tokio::time::interval(BATCH_INTERVAL);
    batch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let heartbeat_period = bridge.settings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_period,
        heartbeat_period,
    );
    let mut missed_pongs: u32 = 0;

    let resize_timer = tokio::time::sleep(INITIAL_FLUSH_SUPPRESSION);
    tokio::pin!(resize_timer);

    loop {
        tokio::select! {
            _ = bridge.cancel.cancelled() => {
                debug!(session_id = %entry.session_id, "Pump cancelled by shutdown");
                break;
            }

            // Force a clean redraw at the client's dimensions once the
            // initial burst has been discarded.
            () = &mut resize_timer, if !resized => {
                resized = true;
                if let Err(e) = entry.pty.resize(size) {
                    debug!(session_id = %entry.session_id, error = %e, "Initial resize failed");
                }
            }

            // PTY output -> buffer
            chunk = entry.pty.read() => {
                match chunk {
                    Some(chunk) => {
                        if Instant::now() < suppress_until {
                            continue;
                        }
                        buffer.push(chunk);
                    }
                    None => {
                        // PTY exited: flush what's left, close politely
                        if !buffer.is_empty() {
                            let data = buffer.take_all();
                            inflight.fetch_add(data.len(), Ordering::SeqCst);
                            let _ = out_tx.send(Message::Binary(data)).await;
                        }
                        let _ = out_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_NORMAL,
                                reason: "Terminal session ended".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }

            // Batched flush with backpressure
            _ = batch.tick() => {
                if buffer.is_empty() {
                    continue;
                }
                if inflight.load(Ordering::SeqCst) > BACKPRESSURE_LIMIT {
                    // Socket is congested; try again next tick
                    continue;
                }
                let data = buffer.take_all();
                inflight.fetch_add(data.len(), Ordering::SeqCst);
                if out_tx.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }

            // Heartbeat
            _ = heartbeat.tick() => {
                if missed_pongs >= bridge.settings.max_missed_pongs {
                    warn!(session_id = %entry.session_id, missed = missed_pongs, "Heartbeat failed; terminating socket");
                    break;
                }
                missed_pongs += 1;
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Client -> PTY
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if entry.pty.write(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(ControlMessage::Resize { cols, rows, .. }) => {
                                if let Err(e) = entry.pty.resize(TermSize { cols, rows }) {
                                    debug!(session_id = %entry.session_id, error = %e, "Resize failed");
                                }
                            }
                            Err(_) => {
                                warn!(session_id = %entry.session_id, "Dropping unrecognized control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %entry.session_id, "Client closed socket");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(session_id = %entry.session_id, error = %e, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = sender.await;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::CommandBuilder;

    #[test]
    fn test_output_buffer_concatenates_in_order() {
        let mut buffer = OutputBuffer::default();
        buffer.push(b"abc".to_vec());
        buffer.push(b"def".to_vec());
        buffer.push(b"g".to_vec());
        assert_eq!(buffer.take_all(), b"abcdefg");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_output_buffer_evicts_oldest_first() {
        let mut buffer = OutputBuffer::default();
        // Three chunks that together exceed the cap by one chunk
        let half = OUTPUT_BUFFER_CAP / 2;
        buffer.push(vec![b'a'; half]);
        buffer.push(vec![b'b'; half]);
        buffer.push(vec![b'c'; 10]);

        let data = buffer.take_all();
        // The oldest chunk was evicted; the rest survives in order
        assert_eq!(data.len(), half + 10);
        assert_eq!(data[0], b'b');
        assert_eq!(data[data.len() - 1], b'c');
    }

    #[test]
    fn test_output_buffer_single_oversized_chunk() {
        let mut buffer = OutputBuffer::default();
        buffer.push(vec![b'x'; OUTPUT_BUFFER_CAP + 1]);
        // A single chunk above the cap is kept rather than dropped to zero
        assert_eq!(buffer.take_all().len(), OUTPUT_BUFFER_CAP + 1);
    }

    #[test]
    fn test_message_len_counts_payload_frames_only() {
        assert_eq!(message_len(&Message::Binary(vec![0; 10])), 10);
        assert_eq!(message_len(&Message::Text("abcd".to_string())), 4);
        assert_eq!(message_len(&Message::Ping(Vec::new())), 0);
        assert_eq!(message_len(&Message::Close(None)), 0);
    }

    fn test_bridge() -> Arc<TerminalBridge> {
        TerminalBridge::new(
            BridgeSettings {
                heartbeat_interval: Duration::from_secs(30),
                max_missed_pongs: 3,
                home_dir: std::env::temp_dir(),
            },
            CancellationToken::new(),
        )
    }

    fn spawn_entry(bridge: &Arc<TerminalBridge>) -> Arc<ActiveTerminal> {
        let cmd = CommandBuilder::new("cat");
        let pty = PtyProcess::spawn(cmd, TermSize { cols: 80, rows: 24 }).expect("spawn cat");
        let id = SessionId::generate();
        let entry = Arc::new(ActiveTerminal {
            session_id: id.clone(),
            window_name: format!("relay-{id}"),
            created: Instant::now(),
            pty,
            cleaned_up: AtomicBool::new(false),
            ws_open: AtomicBool::new(true),
        });
        bridge
            .lock_terminals()
            .insert(id, Arc::clone(&entry));
        entry
    }

    #[tokio::test]
    async fn test_connection_watch_tracks_map() {
        let bridge = test_bridge();
        let entry = spawn_entry(&bridge);
        assert!(bridge.is_connected(&entry.session_id));
        assert_eq!(bridge.active_count(), 1);

        bridge.cleanup(&entry.session_id, &entry).await;
        assert!(!bridge.is_connected(&entry.session_id));
        assert_eq!(bridge.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let bridge = test_bridge();
        let entry = spawn_entry(&bridge);

        bridge.cleanup(&entry.session_id, &entry).await;
        assert!(entry.pty.has_exited());

        // Repeated calls are no-ops
        bridge.cleanup(&entry.session_id, &entry).await;
        bridge.cleanup(&entry.session_id, &entry).await;
        assert!(!bridge.is_connected(&entry.session_id));
    }

    #[tokio::test]
    async fn test_cleanup_leaves_replacement_entry_alone() {
        let bridge = test_bridge();
        let old = spawn_entry(&bridge);

        // A replacement terminal took over the same session id
        let cmd = CommandBuilder::new("cat");
        let pty = PtyProcess::spawn(cmd, TermSize { cols: 80, rows: 24 }).expect("spawn cat");
        let replacement = Arc::new(ActiveTerminal {
            session_id: old.session_id.clone(),
            window_name: old.window_name.clone(),
            created: Instant::now(),
            pty,
            cleaned_up: AtomicBool::new(false),
            ws_open: AtomicBool::new(true),
        });
        bridge
            .lock_terminals()
            .insert(old.session_id.clone(), Arc::clone(&replacement));

        bridge.cleanup(&old.session_id, &old).await;

        // The replacement still owns the slot
        assert!(bridge.is_connected(&old.session_id));
        bridge.cleanup(&replacement.session_id, &replacement).await;
    }

    #[tokio::test]
    async fn test_reap_orphans_only_touches_dead_sockets() {
        let bridge = test_bridge();
        let live = spawn_entry(&bridge);
        let dead = spawn_entry(&bridge);
        dead.ws_open.store(false, Ordering::SeqCst);

        bridge.reap_orphans().await;

        assert!(bridge.is_connected(&live.session_id));
        assert!(!bridge.is_connected(&dead.session_id));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cleans_everything() {
        let bridge = test_bridge();
        let a = spawn_entry(&bridge);
        let b = spawn_entry(&bridge);

        bridge.stop().await;

        assert_eq!(bridge.active_count(), 0);
        assert!(a.pty.has_exited());
        assert!(b.pty.has_exited());
    }
}
