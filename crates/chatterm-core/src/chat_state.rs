//! Strict chat turn state machine.
//!
//! A turn always goes `Idle → Thinking → Responding → Idle`. Illegal calls are
//! rejected with [`ChatStateError::InvalidTransition`] and change nothing.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatState {
    #[default]
    Idle,
    Thinking,
    Responding,
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatState::Idle => "idle",
            ChatState::Thinking => "thinking",
            ChatState::Responding => "responding",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatStateError {
    #[error("invalid chat state transition: {from} -> {to}")]
    InvalidTransition { from: ChatState, to: ChatState },
}

#[derive(Debug, Default)]
pub struct ChatStateManager {
    state: ChatState,
    thinking_started: Option<Instant>,
    responding_started: Option<Instant>,
    thinking_duration: Option<Duration>,
    response_duration: Option<Duration>,
}

impl ChatStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    /// How long the last thinking phase lasted, once it has ended.
    pub fn thinking_duration(&self) -> Option<Duration> {
        self.thinking_duration
    }

    /// How long the last response phase lasted, once it has completed.
    pub fn response_duration(&self) -> Option<Duration> {
        self.response_duration
    }

    /// Whether moving to `target` from the current state is legal.
    pub fn can_transition_to(&self, target: ChatState) -> bool {
        matches!(
            (self.state, target),
            (ChatState::Idle, ChatState::Thinking)
                | (ChatState::Thinking, ChatState::Responding)
                | (ChatState::Responding, ChatState::Idle)
        )
    }

    pub fn start_thinking(&mut self) -> Result<(), ChatStateError> {
        self.start_thinking_at(Instant::now())
    }

    pub fn start_thinking_at(&mut self, now: Instant) -> Result<(), ChatStateError> {
        self.check(ChatState::Thinking)?;
        self.state = ChatState::Thinking;
        self.thinking_started = Some(now);
        self.thinking_duration = None;
        self.response_duration = None;
        Ok(())
    }

    pub fn start_responding(&mut self) -> Result<(), ChatStateError> {
        self.start_responding_at(Instant::now())
    }

    /// Ends the thinking phase and records its duration.
    pub fn start_responding_at(&mut self, now: Instant) -> Result<(), ChatStateError> {
        self.check(ChatState::Responding)?;
        self.state = ChatState::Responding;
        self.thinking_duration = self
            .thinking_started
            .take()
            .map(|started| now.saturating_duration_since(started));
        self.responding_started = Some(now);
        debug!(thinking_ms = ?self.thinking_duration.map(|d| d.as_millis()), "Response started");
        Ok(())
    }

    pub fn complete_response(&mut self) -> Result<(), ChatStateError> {
        self.complete_response_at(Instant::now())
    }

    pub fn complete_response_at(&mut self, now: Instant) -> Result<(), ChatStateError> {
        self.check(ChatState::Idle)?;
        self.state = ChatState::Idle;
        self.response_duration = self
            .responding_started
            .take()
            .map(|started| now.saturating_duration_since(started));
        Ok(())
    }

    /// Back to `Idle` from anywhere, forgetting all timings.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn check(&self, to: ChatState) -> Result<(), ChatStateError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(ChatStateError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_records_durations() {
        let start = Instant::now();
        let mut manager = ChatStateManager::new();

        manager.start_thinking_at(start).unwrap();
        assert_eq!(manager.state(), ChatState::Thinking);

        manager
            .start_responding_at(start + Duration::from_millis(1500))
            .unwrap();
        assert_eq!(manager.state(), ChatState::Responding);
        assert_eq!(manager.thinking_duration(), Some(Duration::from_millis(1500)));

        manager
            .complete_response_at(start + Duration::from_millis(2000))
            .unwrap();
        assert_eq!(manager.state(), ChatState::Idle);
        assert_eq!(manager.response_duration(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_responding_from_idle_is_rejected() {
        let mut manager = ChatStateManager::new();
        let err = manager.start_responding().unwrap_err();

        assert_eq!(
            err,
            ChatStateError::InvalidTransition {
                from: ChatState::Idle,
                to: ChatState::Responding,
            }
        );
        assert_eq!(err.to_string(), "invalid chat state transition: idle -> responding");
        assert_eq!(manager.state(), ChatState::Idle);
        assert_eq!(manager.thinking_duration(), None);
    }

    #[test]
    fn test_illegal_transitions_leave_state_untouched() {
        let mut manager = ChatStateManager::new();
        manager.start_thinking().unwrap();

        assert!(manager.start_thinking().is_err());
        assert!(manager.complete_response().is_err());
        assert_eq!(manager.state(), ChatState::Thinking);

        manager.start_responding().unwrap();
        assert!(manager.start_thinking().is_err());
        assert!(manager.start_responding().is_err());
        assert_eq!(manager.state(), ChatState::Responding);
    }

    #[test]
    fn test_can_transition_to_matches_rules() {
        let mut manager = ChatStateManager::new();
        assert!(manager.can_transition_to(ChatState::Thinking));
        assert!(!manager.can_transition_to(ChatState::Responding));
        assert!(!manager.can_transition_to(ChatState::Idle));

        manager.start_thinking().unwrap();
        assert!(manager.can_transition_to(ChatState::Responding));
        assert!(!manager.can_transition_to(ChatState::Idle));
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut manager = ChatStateManager::new();
        manager.start_thinking().unwrap();
        manager.start_responding().unwrap();

        manager.reset();
        assert_eq!(manager.state(), ChatState::Idle);
        assert_eq!(manager.thinking_duration(), None);
        assert!(manager.start_thinking().is_ok());
    }
}
