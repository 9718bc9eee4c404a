//! Process supervisor boundary.
//!
//! Defines the [`ProcessHandle`] trait a process-spawning collaborator
//! implements, and the [`RestartFn`] callback the recovery manager calls when
//! a supervised process has to be replaced. The recovery manager never spawns
//! anything itself: it only watches handles and asks for new ones.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Callback that restarts the supervised program and returns the new handle.
///
/// Returns `Err` when the program could not be started; the recovery manager
/// then retries after a fixed delay.
pub type RestartFn = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn ProcessHandle>>> + Send>>
        + Send
        + Sync,
>;

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessExit {
    /// The process exited. `code` is absent when it was killed by a signal.
    Exited {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The process failed at the process level (spawn/wait error, lost handle).
    Errored { message: String },
}

impl ProcessExit {
    /// True only for a normal exit with status 0.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ProcessExit::Exited {
                code: Some(0),
                signal: None
            }
        )
    }

    /// Human-readable description for logs and events.
    pub fn describe(&self) -> String {
        match self {
            ProcessExit::Exited {
                code: Some(code), ..
            } => format!("exited with code {code}"),
            ProcessExit::Exited {
                code: None,
                signal: Some(signal),
            } => format!("terminated by signal {signal}"),
            ProcessExit::Exited {
                code: None,
                signal: None,
            } => "exited with unknown status".to_string(),
            ProcessExit::Errored { message } => format!("process error: {message}"),
        }
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Running and its PID looks sane.
    Alive,
    /// Already exited; the exit has not necessarily been observed yet.
    Exited(ProcessExit),
    /// Not usable any more (killed, bogus PID, vanished).
    Dead(String),
}

/// Output produced by a supervised process, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Raw bytes read from the process.
    Data(Vec<u8>),
    /// The process reached EOF.
    Eof,
    /// A replacement process is about to start writing on this channel.
    Restarted,
}

/// A handle on a running child process.
///
/// All methods take `&self` so a monitor can wait for exit and check liveness
/// concurrently.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking health check: killed flag, exit status and PID sanity.
    fn liveness(&self) -> Liveness;

    /// Resolves once the process has exited or failed.
    async fn exited(&self) -> ProcessExit;

    /// Terminates the process. Safe to call on an already exited process.
    async fn kill(&self);
}
