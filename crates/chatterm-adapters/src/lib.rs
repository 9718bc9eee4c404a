//! # chatterm-adapters
//!
//! The I/O side of chatterm.
//!
//! This crate provides:
//! - [`PtySpawner`] / [`PtyProcess`]: the AI CLI running in a pseudo-terminal
//! - [`AutoRecoveryManager`]: restarts crashed processes with backoff
//! - [`AutoReconnectManager`]: keeps a client transport connected, with
//!   backoff, heartbeat and network awareness
//! - [`WsTransport`]: a WebSocket relay client
//!
//! ## Recovery and parser state
//!
//! [`PtySpawner::restart_fn`] announces `ProcessOutput::Restarted` on the
//! output channel before the replacement child writes anything, so the
//! consumer resets its `ChatSession` in stream order.
//!
//! ## Testing
//!
//! The [`testing`] module holds scripted doubles for [`ProcessHandle`] and
//! [`Transport`], used by this crate's tests and available to consumers.
//!
//! [`ProcessHandle`]: chatterm_proto::ProcessHandle
//! [`Transport`]: chatterm_proto::Transport

mod auto_reconnect;
mod auto_recovery;
mod pty_process;
mod ws_transport;

pub mod testing;

pub use auto_reconnect::{AutoReconnectManager, ConnectionState};
pub use auto_recovery::{AutoRecoveryManager, RecoveryState};
pub use pty_process::{ProcessError, PtyConfig, PtyProcess, PtySpawner};
pub use ws_transport::WsTransport;
