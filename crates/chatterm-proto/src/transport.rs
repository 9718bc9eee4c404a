//! Transport boundary.
//!
//! The reconnect manager issues commands through [`Transport`] and learns about
//! the connection lifecycle and host environment through [`ClientSignal`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Disconnect reason reported when the local side closed the connection on
/// purpose. Never triggers a reconnect.
pub const MANUAL_DISCONNECT_REASON: &str = "io client disconnect";

/// Disconnect reason used when the heartbeat ping fails.
pub const PING_TIMEOUT_REASON: &str = "ping timeout";

/// Errors raised by transport commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A command needed a live connection and there was none.
    #[error("not connected")]
    NotConnected,

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),
}

/// Network reachability as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Whether the client surface is currently visible to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Connection lifecycle notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { error: String },
    Reconnected,
}

/// Everything the reconnect manager reacts to, on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    Transport(TransportEvent),
    Network(NetworkStatus),
    Visibility(Visibility),
}

/// A client-side socket the reconnect manager can drive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection. Resolves once it is usable or has failed.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Closes the connection on purpose. No-op when already closed.
    async fn disconnect(&self);

    /// Sends a keepalive ping.
    async fn ping(&self) -> Result<(), TransportError>;
}
