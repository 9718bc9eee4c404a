//! The AI CLI running in a pseudo-terminal.
//!
//! [`PtySpawner`] owns the spawn recipe, the output channel and the input
//! side of whichever child is current. Each spawn yields a [`PtyProcess`],
//! the [`ProcessHandle`] the recovery manager watches.
//!
//! Threads:
//! - a reader thread per child forwards PTY output as [`ProcessOutput::Data`]
//!   and ends with [`ProcessOutput::Eof`];
//! - an exit watcher per child polls `try_wait` and publishes the exit on a
//!   watch channel. Dropping the [`PtyProcess`] kills a child that is still
//!   running.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chatterm_core::CliConfig;
use chatterm_proto::{Liveness, ProcessExit, ProcessHandle, ProcessOutput, RestartFn};
#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;
use portable_pty::{Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to open pty: {0}")]
    Pty(String),

    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("no process is running")]
    NotRunning,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How to spawn the CLI.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Terminal width.
    pub cols: u16,
    /// Terminal height.
    pub rows: u16,
    /// Captured once so a vanished current directory cannot break restarts.
    pub workspace_root: PathBuf,
    /// Time between SIGTERM and SIGKILL when killing.
    pub grace_period: Duration,
}

impl PtyConfig {
    pub fn from_cli(cli: &CliConfig) -> Self {
        let workspace_root = cli.workspace_root.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });
        Self {
            command: cli.command.clone(),
            args: cli.args.clone(),
            cols: cli.cols,
            rows: cli.rows,
            workspace_root,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

type InputSlot = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Spawns the CLI and keeps the writer of the current child.
#[derive(Clone)]
pub struct PtySpawner {
    config: Arc<PtyConfig>,
    output_tx: mpsc::UnboundedSender<ProcessOutput>,
    input: InputSlot,
}

impl PtySpawner {
    pub fn new(config: PtyConfig, output_tx: mpsc::UnboundedSender<ProcessOutput>) -> Self {
        Self {
            config: Arc::new(config),
            output_tx,
            input: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &PtyConfig {
        &self.config
    }

    /// Spawns a new child. Its output goes to the spawner's channel and it
    /// becomes the target of [`send_input`](Self::send_input).
    pub fn spawn(&self) -> Result<PtyProcess, ProcessError> {
        let config = &self.config;
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        cmd.cwd(&config.workspace_root);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::Spawn {
                command: config.command.clone(),
                message: e.to_string(),
            })?;

        // Drop the slave so the reader sees EOF once the child is gone.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        *lock(&self.input) = Some(writer);

        spawn_reader(reader, self.output_tx.clone());

        let process = PtyProcess::start(child, pair.master, config.grace_period);
        info!(
            command = %config.command,
            pid = ?process.pid(),
            cwd = %config.workspace_root.display(),
            "Spawned CLI in pty"
        );
        Ok(process)
    }

    /// Writes to the current child's terminal.
    pub fn send_input(&self, data: &[u8]) -> Result<(), ProcessError> {
        let mut slot = lock(&self.input);
        let writer = slot.as_mut().ok_or(ProcessError::NotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Restart callback for the recovery manager.
    ///
    /// Sends [`ProcessOutput::Restarted`] before spawning, so everything the
    /// new child prints arrives after the marker.
    pub fn restart_fn(&self) -> RestartFn {
        let spawner = self.clone();
        Box::new(move || {
            let spawner = spawner.clone();
            Box::pin(async move {
                let _ = spawner.output_tx.send(ProcessOutput::Restarted);
                let process = spawner
                    .spawn()
                    .with_context(|| format!("failed to restart `{}`", spawner.config.command))?;
                Ok(Box::new(process) as Box<dyn ProcessHandle>)
            })
        })
    }
}

/// A running child in a pty.
pub struct PtyProcess {
    pid: Option<u32>,
    killed: AtomicBool,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Closing the master hangs up the child.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    grace_period: Duration,
}

impl PtyProcess {
    fn start(
        child: Box<dyn Child + Send + Sync>,
        master: Box<dyn MasterPty + Send>,
        grace_period: Duration,
    ) -> Self {
        let pid = child.process_id();
        let killer = child.clone_killer();
        let (exit_tx, exit_rx) = watch::channel(None);
        watch_exit(child, exit_tx);

        Self {
            pid,
            killed: AtomicBool::new(false),
            exit_rx,
            killer: Mutex::new(killer),
            _master: Mutex::new(master),
            grace_period,
        }
    }

    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    #[cfg(unix)]
    async fn terminate(&self) {
        let Some(raw) = self.pid else {
            self.force_kill();
            return;
        };
        let pid = Pid::from_raw(raw as i32);

        debug!(pid = %pid, "Sending SIGTERM");
        let _ = kill(pid, Signal::SIGTERM);

        if tokio::time::timeout(self.grace_period, wait_exit(self.exit_rx.clone()))
            .await
            .is_ok()
        {
            return;
        }

        debug!(pid = %pid, "Grace period expired, sending SIGKILL");
        let _ = kill(pid, Signal::SIGKILL);
    }

    #[allow(clippy::unused_async)] // Same signature as the unix variant
    #[cfg(not(unix))]
    async fn terminate(&self) {
        self.force_kill();
    }

    fn force_kill(&self) {
        if let Err(e) = lock(&self.killer).kill() {
            warn!(error = %e, "Failed to kill child process");
        }
    }
}

#[async_trait]
impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn liveness(&self) -> Liveness {
        if self.killed.load(Ordering::SeqCst) {
            return Liveness::Dead("process was killed".to_string());
        }
        if let Some(exit) = self.exit_rx.borrow().clone() {
            return Liveness::Exited(exit);
        }
        match self.pid {
            None | Some(0) => Liveness::Dead("invalid pid".to_string()),
            Some(pid) => check_pid(pid),
        }
    }

    async fn exited(&self) -> ProcessExit {
        wait_exit(self.exit_rx.clone())
            .await
            .unwrap_or_else(|| ProcessExit::Errored {
                message: "exit watcher stopped".to_string(),
            })
    }

    async fn kill(&self) {
        if self.has_exited() {
            return;
        }
        self.killed.store(true, Ordering::SeqCst);
        self.terminate().await;
    }
}

/// Signal-0 check: the PID must still name a process.
#[cfg(unix)]
fn check_pid(pid: u32) -> Liveness {
    match kill(Pid::from_raw(pid as i32), None) {
        // EPERM means the process exists but belongs to someone else.
        Ok(()) | Err(nix::errno::Errno::EPERM) => Liveness::Alive,
        Err(e) => Liveness::Dead(format!("pid {pid} not found: {e}")),
    }
}

#[cfg(not(unix))]
fn check_pid(_pid: u32) -> Liveness {
    Liveness::Alive
}

async fn wait_exit(mut exit_rx: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    exit_rx
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|exit| exit.clone())
}

fn spawn_reader(reader: Box<dyn Read + Send>, output_tx: mpsc::UnboundedSender<ProcessOutput>) {
    debug!("Spawning PTY output reader thread");
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader: EOF");
                    let _ = output_tx.send(ProcessOutput::Eof);
                    break;
                }
                Ok(n) => {
                    if output_tx.send(ProcessOutput::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Linux reports EIO on the master once the child side closes.
                    debug!(error = %e, "PTY reader stopped");
                    let _ = output_tx.send(ProcessOutput::Eof);
                    break;
                }
            }
        }
    });
}

fn watch_exit(mut child: Box<dyn Child + Send + Sync>, exit_tx: watch::Sender<Option<ProcessExit>>) {
    std::thread::spawn(move || {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let exit = exit_from_status(&status);
                    debug!(exit = %exit.describe(), "Child exited");
                    exit_tx.send_replace(Some(exit));
                    break;
                }
                Ok(None) => {
                    if exit_tx.is_closed() {
                        debug!("Process handle dropped, killing child");
                        let _ = child.kill();
                        break;
                    }
                    std::thread::sleep(EXIT_POLL_INTERVAL);
                }
                Err(e) => {
                    exit_tx.send_replace(Some(ProcessExit::Errored {
                        message: e.to_string(),
                    }));
                    break;
                }
            }
        }
    });
}

fn exit_from_status(status: &ExitStatus) -> ProcessExit {
    match status.signal() {
        Some(signal) => ProcessExit::Exited {
            code: None,
            signal: Some(signal.to_string()),
        },
        None => ProcessExit::Exited {
            code: Some(status.exit_code() as i32),
            signal: None,
        },
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
