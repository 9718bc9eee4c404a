//! Event types emitted by the parser and the resilience managers.
//!
//! Every event is a closed enum serialized with a `type` tag, so consumers
//! match exhaustively instead of dispatching on event-name strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discrete chat event parsed out of the CLI's terminal output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The spinner appeared for the first time since the last prompt.
    ThinkingStart {
        spinner: char,
        timestamp: DateTime<Utc>,
    },
    /// The spinner was redrawn (also emitted right after `ThinkingStart`).
    ThinkingUpdate {
        spinner: char,
        timestamp: DateTime<Utc>,
    },
    /// The prompt came back while thinking.
    ThinkingEnd { timestamp: DateTime<Utc> },
    /// Assistant text printed after the prompt marker.
    ChatMessage {
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// The CLI is idle and waiting for the next user input.
    PromptReady { timestamp: DateTime<Utc> },
    /// Complete lines of output that are neither prompt nor spinner.
    Output {
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl ChatEvent {
    /// When the event was produced.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChatEvent::ThinkingStart { timestamp, .. }
            | ChatEvent::ThinkingUpdate { timestamp, .. }
            | ChatEvent::ThinkingEnd { timestamp }
            | ChatEvent::ChatMessage { timestamp, .. }
            | ChatEvent::PromptReady { timestamp }
            | ChatEvent::Output { timestamp, .. } => *timestamp,
        }
    }

    /// Short snake_case name, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::ThinkingStart { .. } => "thinking_start",
            ChatEvent::ThinkingUpdate { .. } => "thinking_update",
            ChatEvent::ThinkingEnd { .. } => "thinking_end",
            ChatEvent::ChatMessage { .. } => "chat_message",
            ChatEvent::PromptReady { .. } => "prompt_ready",
            ChatEvent::Output { .. } => "output",
        }
    }
}

/// Lifecycle events of the process auto-recovery manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryEvent {
    /// A restart was scheduled and will run after `delay_ms`.
    RecoveryStarted {
        session_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The restart callback produced a new process.
    RecoverySucceeded {
        session_id: String,
        attempt: u32,
        pid: Option<u32>,
    },
    /// The restart callback itself failed.
    RecoveryFailed {
        session_id: String,
        attempt: u32,
        error: String,
    },
    /// Consecutive failures exceeded the retry ceiling. Terminal for the session.
    MaxRetriesReached {
        session_id: String,
        consecutive_failures: u32,
        total_failures: u32,
    },
}

impl RecoveryEvent {
    /// The session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            RecoveryEvent::RecoveryStarted { session_id, .. }
            | RecoveryEvent::RecoverySucceeded { session_id, .. }
            | RecoveryEvent::RecoveryFailed { session_id, .. }
            | RecoveryEvent::MaxRetriesReached { session_id, .. } => session_id,
        }
    }
}

/// Lifecycle events of the transport auto-reconnect manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectEvent {
    /// A reconnect attempt was scheduled and will run after `delay_ms`.
    ReconnectStarted { attempt: u32, delay_ms: u64 },
    /// The connection came back after a disconnect.
    ReconnectSucceeded { attempts: u32 },
    /// A connection attempt failed.
    ReconnectFailed { attempt: u32, error: String },
    /// Consecutive failures exceeded the retry ceiling. Terminal until `connect()`.
    MaxRetriesReached { consecutive_failures: u32 },
    /// The host reported a network status change.
    NetworkChange {
        status: crate::transport::NetworkStatus,
    },
}
