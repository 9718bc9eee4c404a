//! # chatterm
//!
//! Runs an interactive AI CLI in a pseudo-terminal and prints what it says as
//! NDJSON chat events, restarting it when it crashes.

mod relay;
mod supervise;

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chatterm_adapters::{AutoRecoveryManager, PtyConfig, PtySpawner};
use chatterm_core::{ChatSession, ChattermConfig, DEFAULT_CONFIG_FILE, strip_escape_sequences};
use chatterm_proto::{ChatEvent, ProcessHandle, ProcessOutput, ReconnectEvent, RecoveryEvent};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::relay::Relay;
use crate::supervise::{spawn_tracked, tracked_restart_fn};

/// chatterm - turns an interactive terminal AI CLI into chat events
#[derive(Parser, Debug)]
#[command(name = "chatterm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an AI CLI and stream its chat events to stdout
    Run(RunArgs),

    /// Strip terminal escape sequences from stdin (debug aid)
    Strip,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, env = "CHATTERM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// WebSocket relay that also receives the events
    #[arg(long, env = "CHATTERM_RELAY_URL")]
    relay_url: Option<String>,

    /// Session id attached to every event
    #[arg(long)]
    session_id: Option<String>,

    /// Working directory for the CLI
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Command to run instead of the configured one
    #[arg(last = true)]
    command: Vec<String>,
}

impl RunArgs {
    /// Loads the config file and applies the flags on top.
    fn resolve_config(&self) -> Result<ChattermConfig> {
        let mut config = ChattermConfig::load_or_default(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;

        if let Some((command, args)) = self.command.split_first() {
            config.cli.command.clone_from(command);
            config.cli.args = args.to_vec();
        }
        if let Some(cwd) = &self.cwd {
            config.cli.workspace_root = Some(cwd.clone());
        }
        if let Some(url) = &self.relay_url {
            config.relay_url = Some(url.clone());
        }
        Ok(config)
    }

    fn session_id(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")))
    }
}

/// One line of output.
#[derive(Serialize)]
struct EventLine<'a> {
    session_id: &'a str,
    event: &'a ChatEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries events only.
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatterm=info")),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Strip => strip_stdin(),
    }
}

fn strip_stdin() -> Result<()> {
    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("failed to read stdin")?;
    let text = String::from_utf8_lossy(&raw);
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(strip_escape_sequences(&text).as_bytes())?;
    stdout.flush()?;
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.resolve_config()?;
    let session_id = args.session_id();

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
    let (recovery_tx, mut recovery_rx) = mpsc::unbounded_channel();

    let spawner = PtySpawner::new(PtyConfig::from_cli(&config.cli), output_tx);
    let process = spawn_tracked(&spawner, &exits_tx)
        .with_context(|| format!("failed to start `{}`", config.cli.command))?;
    info!(
        session_id = %session_id,
        command = %config.cli.command,
        pid = ?process.pid(),
        "Started CLI"
    );

    let recovery = AutoRecoveryManager::new(config.recovery.clone(), recovery_tx);
    recovery.start_monitoring(
        session_id.clone(),
        Box::new(process),
        tracked_restart_fn(&spawner, exits_tx),
    );

    let (mut relay, mut reconnect_rx, mut inbound_rx) = match &config.relay_url {
        Some(url) => {
            let (relay, events, inbound) = Relay::start(url, config.reconnect.clone());
            relay.connect().await;
            (Some(relay), Some(events), Some(inbound))
        }
        None => (None, None, None),
    };

    tokio::spawn(forward_stdin(spawner.clone()));

    let mut session = ChatSession::new(session_id.clone());
    let outcome = loop {
        tokio::select! {
            Some(output) = output_rx.recv() => {
                let events = apply_output(&mut session, output);
                emit(&session_id, &events, relay.as_mut()).await?;
            }
            Some(exit) = exits_rx.recv() => {
                if exit.is_clean() {
                    info!(session_id = %session_id, "CLI exited");
                    break Ok(());
                }
                if !recovery.config().enable_auto_restart {
                    break Err(anyhow::anyhow!("CLI {}", exit.describe()));
                }
                debug!(session_id = %session_id, exit = %exit.describe(), "CLI failed, recovery takes over");
            }
            Some(event) = recovery_rx.recv() => {
                if let RecoveryEvent::MaxRetriesReached { consecutive_failures, .. } = &event {
                    error!(session_id = %session_id, consecutive_failures, "Giving up on the CLI");
                    break Err(anyhow::anyhow!(
                        "CLI kept crashing ({consecutive_failures} consecutive failures)"
                    ));
                }
                debug!(?event, "Recovery event");
            }
            Some(event) = recv_optional(&mut reconnect_rx) => {
                match &event {
                    ReconnectEvent::ReconnectSucceeded { .. } => {
                        if let Some(relay) = relay.as_mut() {
                            relay.flush().await;
                        }
                    }
                    ReconnectEvent::MaxRetriesReached { .. } => {
                        warn!("Relay gave up reconnecting, events stay queued");
                    }
                    _ => {}
                }
                debug!(?event, "Reconnect event");
            }
            Some(message) = recv_optional(&mut inbound_rx) => {
                debug!(len = message.len(), "Ignoring relay message");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    recovery.stop_monitoring(&session_id);

    // Output the reader thread delivered before the exit was noticed.
    let mut remaining = Vec::new();
    while let Ok(output) = output_rx.try_recv() {
        remaining.extend(apply_output(&mut session, output));
    }
    remaining.extend(session.flush());
    emit(&session_id, &remaining, relay.as_mut()).await?;

    if let Some(relay) = relay.as_mut() {
        relay.close().await;
    }
    outcome
}

fn apply_output(session: &mut ChatSession, output: ProcessOutput) -> Vec<ChatEvent> {
    match output {
        ProcessOutput::Data(chunk) => session.feed(&chunk),
        ProcessOutput::Eof => session.flush().into_iter().collect(),
        ProcessOutput::Restarted => {
            session.on_process_restart();
            Vec::new()
        }
    }
}

async fn emit(session_id: &str, events: &[ChatEvent], mut relay: Option<&mut Relay>) -> Result<()> {
    for event in events {
        let line = serde_json::to_string(&EventLine { session_id, event })?;
        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{line}")?;
            stdout.flush()?;
        }
        if let Some(relay) = relay.as_deref_mut() {
            relay.send(line).await;
        }
    }
    Ok(())
}

/// Sends each stdin line to the current child, as if typed.
async fn forward_stdin(spawner: PtySpawner) {
    forward_lines(BufReader::new(tokio::io::stdin()), spawner).await;
}

async fn forward_lines<R: AsyncBufRead + Unpin>(reader: R, spawner: PtySpawner) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => type_line(&spawner, line).await,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
}

/// PTY writes block, so they run off the async workers. Awaiting each write
/// keeps lines in order.
async fn type_line(spawner: &PtySpawner, line: String) {
    let spawner = spawner.clone();
    let written =
        tokio::task::spawn_blocking(move || spawner.send_input(format!("{line}\r").as_bytes()))
            .await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Dropping input, CLI not running"),
        Err(e) => warn!(error = %e, "Input writer panicked"),
    }
}

/// Receives from `rx`, or pends forever when there is none.
async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Run(args) => args,
            Commands::Strip => panic!("expected run"),
        }
    }

    #[test]
    fn test_trailing_command_overrides_config() {
        let args = parse(&[
            "chatterm",
            "run",
            "--config",
            "/nonexistent/chatterm.yml",
            "--",
            "aider",
            "--no-git",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.cli.command, "aider");
        assert_eq!(config.cli.args, vec!["--no-git"]);
    }

    #[test]
    fn test_defaults_without_overrides() {
        let args = parse(&["chatterm", "run", "--config", "/nonexistent/chatterm.yml"]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.cli.command, "claude");
        assert!(config.cli.workspace_root.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatterm.yml");
        std::fs::write(&path, "relay_url: ws://file\ncli:\n  command: codex\n").unwrap();

        let args = parse(&[
            "chatterm",
            "run",
            "--config",
            path.to_str().unwrap(),
            "--relay-url",
            "ws://flag",
            "--cwd",
            "/tmp",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.cli.command, "codex");
        assert_eq!(config.relay_url.as_deref(), Some("ws://flag"));
        assert_eq!(config.cli.workspace_root, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_session_id_flag() {
        let args = parse(&["chatterm", "run", "--session-id", "abc"]);
        assert_eq!(args.session_id(), "abc");
        let args = parse(&["chatterm", "run"]);
        assert!(args.session_id().starts_with("session-"));
    }

    #[test]
    fn test_restart_marker_resets_session() {
        let mut session = ChatSession::new("s");
        assert!(apply_output(&mut session, ProcessOutput::Data(b"partial".to_vec())).is_empty());
        assert!(apply_output(&mut session, ProcessOutput::Restarted).is_empty());
        assert!(apply_output(&mut session, ProcessOutput::Eof).is_empty());
    }

    #[test]
    fn test_event_line_shape() {
        let event = ChatEvent::PromptReady {
            timestamp: chrono::Utc::now(),
        };
        let line = serde_json::to_value(EventLine {
            session_id: "s1",
            event: &event,
        })
        .unwrap();
        assert_eq!(line["session_id"], "s1");
        assert_eq!(line["event"]["type"], "prompt_ready");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_lines_reach_the_child() {
        let cli = chatterm_core::CliConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), r#"read line; echo "got:$line""#.to_string()],
            workspace_root: Some(std::env::temp_dir()),
            ..chatterm_core::CliConfig::default()
        };
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let spawner = PtySpawner::new(PtyConfig::from_cli(&cli), output_tx);
        let _process = spawner.spawn().unwrap();

        forward_lines(&b"hello\n"[..], spawner.clone()).await;

        let mut output = Vec::new();
        while let Ok(Some(ProcessOutput::Data(data))) =
            tokio::time::timeout(std::time::Duration::from_secs(10), output_rx.recv()).await
        {
            output.extend(data);
            if String::from_utf8_lossy(&output).contains("got:hello") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&output).contains("got:hello"));
    }
}
