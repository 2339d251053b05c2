//! Relay Daemon - bridges Claude CLI tmux sessions to remote clients
//!
//! This crate provides the daemon's components:
//! - `auth` - bearer credential check and single-use attach tokens
//! - `lock` - per-session mutual exclusion for attach decisions
//! - `tmux` - lifecycle of detached tmux windows running the CLI
//! - `discovery` - conversation-log watcher, parser, and metadata cache
//! - `registry` - composition of discovery + tmux + bridge into views
//! - `terminal` - PTY <-> WebSocket bridge with batching and heartbeat
//! - `server` - HTTP/SSE/WS surface
//! - `config` - daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         relayd                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────┐   change    ┌───────────┐   views   ┌──────┐  │
//! │  │ Discovery │────events──▶│ Registry  │──────────▶│ HTTP │  │
//! │  └───────────┘             └─────┬─────┘           │ /SSE │  │
//! │                                  │ snapshot        └──┬───┘  │
//! │  ┌───────────┐◀──────────────────┘                    │      │
//! │  │ TmuxMgr   │◀───attach (per-session lock)───────────┤      │
//! │  └─────┬─────┘                                        │      │
//! │        │ window name              attach token        │      │
//! │        ▼                                              ▼      │
//! │  ┌───────────┐          PTY bytes            ┌────────────┐  │
//! │  │ Terminal  │◀────────────────────────────▶│ WebSocket  │  │
//! │  │ Bridge    │                               └────────────┘  │
//! │  └───────────┘                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate avoids `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`. Fallible operations return
//! `Result` or `Option`; channel closures are handled gracefully.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod lock;
pub mod registry;
pub mod server;
pub mod terminal;
pub mod tmux;
