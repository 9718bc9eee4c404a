//! # chatterm-core
//!
//! Turns the raw terminal output of an interactive AI CLI into chat events.
//!
//! This crate provides:
//! - Escape-sequence and decorative-glyph stripping ([`strip_escape_sequences`])
//! - Prompt marker detection ([`detect_prompt`], [`is_waiting_for_input`])
//! - Thinking spinner detection ([`ThinkingDetector`])
//! - The chunk-driven parser state machine ([`StreamHandler`])
//! - The strict chat turn state machine ([`ChatStateManager`])
//! - A session composer keeping both machines in step ([`ChatSession`])
//! - YAML configuration ([`ChattermConfig`])
//!
//! Nothing in here performs I/O except [`ChattermConfig::load`]; process
//! supervision and transports live in `chatterm-adapters`.

pub mod ansi;
pub mod chat_state;
pub mod config;
pub mod prompt;
pub mod session;
pub mod stream_handler;
pub mod thinking;

pub use ansi::strip_escape_sequences;
pub use chat_state::{ChatState, ChatStateError, ChatStateManager};
pub use config::{
    ChattermConfig, CliConfig, ConfigError, DEFAULT_CONFIG_FILE, ReconnectConfig, RecoveryConfig,
};
pub use prompt::{PROMPT_MARKER, PromptDetection, detect_prompt, is_waiting_for_input, strip_prompt};
pub use session::ChatSession;
pub use stream_handler::{StreamHandler, StreamState};
pub use thinking::{SPINNER_GLYPHS, ThinkingDetection, ThinkingDetector, strip_thinking_pattern};
