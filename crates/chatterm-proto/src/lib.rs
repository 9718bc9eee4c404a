//! # chatterm-proto
//!
//! Shared types and collaborator traits for chatterm.
//!
//! This crate provides the vocabulary the other chatterm crates speak:
//! - [`ChatEvent`], the parsed output of a terminal AI CLI
//! - [`RecoveryEvent`] and [`ReconnectEvent`], the resilience lifecycle events
//! - [`ProcessHandle`] and [`RestartFn`], the process supervisor boundary
//! - [`Transport`] and [`ClientSignal`], the socket transport boundary

pub mod event;
pub mod process;
pub mod transport;

pub use event::{ChatEvent, ReconnectEvent, RecoveryEvent};
pub use process::{Liveness, ProcessExit, ProcessHandle, ProcessOutput, RestartFn};
pub use transport::{
    ClientSignal, MANUAL_DISCONNECT_REASON, NetworkStatus, PING_TIMEOUT_REASON, Transport,
    TransportError, TransportEvent, Visibility,
};
