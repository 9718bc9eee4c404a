//! Process auto-recovery.
//!
//! One tokio task per monitored session waits for the process to exit, polls
//! its liveness on `health_check_interval`, and on failure restarts it through
//! the session's [`RestartFn`] with backoff.
//!
//! Failure accounting:
//! - every non-clean exit, process error or failed liveness check counts once
//!   in `total_failures` and `consecutive_failures`;
//! - while `consecutive_failures <= max_retries` a restart is attempted,
//!   after that `MaxRetriesReached` is emitted once and the session is left
//!   `exhausted` until the next `start_monitoring`;
//! - the streak is forgiven only when a restarted process stays up for
//!   `stability_window` or exits cleanly. A restart that crashes straight away
//!   still counts towards the ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatterm_core::RecoveryConfig;
use chatterm_proto::{Liveness, ProcessExit, ProcessHandle, RecoveryEvent, RestartFn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-session recovery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryState {
    pub is_recovering: bool,
    pub retry_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_recovery_time: Option<DateTime<Utc>>,
    pub total_failures: u32,
    pub consecutive_failures: u32,
    /// Set once `MaxRetriesReached` has been emitted.
    pub exhausted: bool,
}

struct Monitor {
    state: RecoveryState,
    /// Distinguishes a replaced monitor's task from the current one.
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: Mutex<RecoveryConfig>,
    monitors: Mutex<HashMap<String, Monitor>>,
    next_generation: Mutex<u64>,
    events_tx: mpsc::UnboundedSender<RecoveryEvent>,
}

/// Watches child processes and restarts them when they fail.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct AutoRecoveryManager {
    inner: Arc<Inner>,
}

impl AutoRecoveryManager {
    pub fn new(config: RecoveryConfig, events_tx: mpsc::UnboundedSender<RecoveryEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                monitors: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                events_tx,
            }),
        }
    }

    /// Starts supervising `process` under `session_id`.
    ///
    /// Replaces (and cancels) an existing monitor for the same id.
    pub fn start_monitoring(
        &self,
        session_id: impl Into<String>,
        process: Box<dyn ProcessHandle>,
        restart: RestartFn,
    ) {
        let session_id = session_id.into();
        let generation = {
            let mut next = lock(&self.inner.next_generation);
            *next += 1;
            *next
        };
        let cancel = CancellationToken::new();

        {
            let mut monitors = lock(&self.inner.monitors);
            if let Some(previous) = monitors.remove(&session_id) {
                warn!(session_id = %session_id, "Session already monitored, replacing monitor");
                previous.stop();
            }
            monitors.insert(
                session_id.clone(),
                Monitor {
                    state: RecoveryState::default(),
                    generation,
                    cancel: cancel.clone(),
                    task: None,
                },
            );
        }

        info!(session_id = %session_id, pid = ?process.pid(), "Monitoring process");
        let task = SessionTask {
            inner: Arc::clone(&self.inner),
            session_id: session_id.clone(),
            generation,
            cancel,
            restart,
        };
        let handle = tokio::spawn(task.run(process));

        let mut monitors = lock(&self.inner.monitors);
        match monitors.get_mut(&session_id) {
            Some(monitor) if monitor.generation == generation => monitor.task = Some(handle),
            // Stopped or replaced before the handle was stored.
            _ => handle.abort(),
        }
    }

    /// Stops supervising `session_id` and forgets its state. No-op when the
    /// session is not monitored.
    pub fn stop_monitoring(&self, session_id: &str) {
        if let Some(monitor) = lock(&self.inner.monitors).remove(session_id) {
            info!(session_id = %session_id, "Stopped monitoring");
            monitor.stop();
        }
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        lock(&self.inner.monitors).contains_key(session_id)
    }

    /// Snapshot of the session's recovery state.
    pub fn state(&self, session_id: &str) -> Option<RecoveryState> {
        lock(&self.inner.monitors)
            .get(session_id)
            .map(|monitor| monitor.state.clone())
    }

    /// Replaces the configuration. Running monitors pick it up at their next
    /// decision point.
    pub fn update_config(&self, config: RecoveryConfig) {
        *lock(&self.inner.config) = config;
    }

    pub fn config(&self) -> RecoveryConfig {
        self.inner.config()
    }
}

impl Monitor {
    fn stop(self) {
        self.cancel.cancel();
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

impl Inner {
    fn config(&self) -> RecoveryConfig {
        lock(&self.config).clone()
    }

    /// Runs `f` on the session's state if `generation` still owns it.
    fn with_state<R>(
        &self,
        session_id: &str,
        generation: u64,
        f: impl FnOnce(&mut RecoveryState) -> R,
    ) -> Option<R> {
        let mut monitors = lock(&self.monitors);
        monitors
            .get_mut(session_id)
            .filter(|monitor| monitor.generation == generation)
            .map(|monitor| f(&mut monitor.state))
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.events_tx.send(event);
    }
}

enum Decision {
    Recover { attempt: u32 },
    Exhausted { consecutive: u32, total: u32 },
    RestartDisabled,
    AlreadyRecovering,
}

/// Why the current process stopped being usable.
enum Outcome {
    Clean,
    Failed(String),
}

struct SessionTask {
    inner: Arc<Inner>,
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
    restart: RestartFn,
}

impl SessionTask {
    async fn run(self, mut process: Box<dyn ProcessHandle>) {
        let mut stable_at: Option<Instant> = None;

        loop {
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return,
                outcome = self.watch(process.as_ref(), &mut stable_at) => outcome,
            };

            let reason = match outcome {
                Outcome::Clean => {
                    info!(session_id = %self.session_id, "Process exited cleanly");
                    self.forgive_failures();
                    return;
                }
                Outcome::Failed(reason) => reason,
            };

            // Exited processes return at once; a hung one is torn down.
            process.kill().await;

            process = match self.recover(reason).await {
                Some(next) => next,
                None => return,
            };
            stable_at = Some(Instant::now() + self.inner.config().stability_window());
        }
    }

    /// Waits until the process exits or fails a liveness check.
    async fn watch(
        &self,
        process: &dyn ProcessHandle,
        stable_at: &mut Option<Instant>,
    ) -> Outcome {
        let mut health = tokio::time::interval(self.inner.config().health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        health.tick().await;

        loop {
            tokio::select! {
                exit = process.exited() => return classify(&exit),
                _ = health.tick() => match process.liveness() {
                    Liveness::Alive => {
                        debug!(session_id = %self.session_id, "Health check passed");
                    }
                    Liveness::Exited(exit) => return classify(&exit),
                    Liveness::Dead(reason) => {
                        warn!(session_id = %self.session_id, reason = %reason, "Health check failed");
                        return Outcome::Failed(reason);
                    }
                },
                () = sleep_until_some(*stable_at) => {
                    *stable_at = None;
                    info!(session_id = %self.session_id, "Restarted process is stable");
                    self.forgive_failures();
                }
            }
        }
    }

    /// Counts the failure and restarts until a process comes up or the
    /// session gives up. Returns the new process.
    async fn recover(&self, mut reason: String) -> Option<Box<dyn ProcessHandle>> {
        loop {
            let config = self.inner.config();
            warn!(session_id = %self.session_id, reason = %reason, "Process failed");

            let decision = self.inner.with_state(&self.session_id, self.generation, |state| {
                state.total_failures += 1;
                state.consecutive_failures += 1;
                state.last_failure_time = Some(Utc::now());

                if !config.enable_auto_restart {
                    Decision::RestartDisabled
                } else if state.consecutive_failures > config.max_retries {
                    state.exhausted = true;
                    Decision::Exhausted {
                        consecutive: state.consecutive_failures,
                        total: state.total_failures,
                    }
                } else if state.is_recovering {
                    Decision::AlreadyRecovering
                } else {
                    state.is_recovering = true;
                    state.retry_count += 1;
                    Decision::Recover {
                        attempt: state.retry_count,
                    }
                }
            })?;

            let attempt = match decision {
                Decision::Recover { attempt } => attempt,
                Decision::Exhausted { consecutive, total } => {
                    error!(
                        session_id = %self.session_id,
                        consecutive_failures = consecutive,
                        total_failures = total,
                        "Max recovery retries reached, giving up"
                    );
                    self.inner.emit(RecoveryEvent::MaxRetriesReached {
                        session_id: self.session_id.clone(),
                        consecutive_failures: consecutive,
                        total_failures: total,
                    });
                    return None;
                }
                Decision::RestartDisabled => {
                    info!(session_id = %self.session_id, "Auto-restart disabled, not restarting");
                    return None;
                }
                Decision::AlreadyRecovering => {
                    debug!(session_id = %self.session_id, "Recovery already in progress");
                    return None;
                }
            };

            let delay = config.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(
                session_id = %self.session_id,
                attempt,
                delay_ms,
                "Restarting process"
            );
            self.inner.emit(RecoveryEvent::RecoveryStarted {
                session_id: self.session_id.clone(),
                attempt,
                delay_ms,
            });

            tokio::time::sleep(delay).await;
            let result = (self.restart)().await;

            self.inner.with_state(&self.session_id, self.generation, |state| {
                state.is_recovering = false;
                if result.is_ok() {
                    state.last_recovery_time = Some(Utc::now());
                }
            })?;

            match result {
                Ok(process) => {
                    let pid = process.pid();
                    info!(session_id = %self.session_id, attempt, pid = ?pid, "Process restarted");
                    self.inner.emit(RecoveryEvent::RecoverySucceeded {
                        session_id: self.session_id.clone(),
                        attempt,
                        pid,
                    });
                    return Some(process);
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, attempt, error = %e, "Restart failed");
                    self.inner.emit(RecoveryEvent::RecoveryFailed {
                        session_id: self.session_id.clone(),
                        attempt,
                        error: format!("{e:#}"),
                    });
                    tokio::time::sleep(config.restart_failure_delay()).await;
                    reason = format!("restart failed: {e:#}");
                }
            }
        }
    }

    fn forgive_failures(&self) {
        self.inner.with_state(&self.session_id, self.generation, |state| {
            state.consecutive_failures = 0;
            state.retry_count = 0;
        });
    }
}

fn classify(exit: &ProcessExit) -> Outcome {
    if exit.is_clean() {
        Outcome::Clean
    } else {
        Outcome::Failed(exit.describe())
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RestartOutcome, ScriptedProcess, scripted_restarts};
    use std::time::Duration;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_retries: 3,
            retry_delay_ms: 100,
            exponential_backoff: true,
            health_check_interval_ms: 1000,
            enable_auto_restart: true,
            stability_window_ms: 5000,
            restart_failure_delay_ms: 500,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RecoveryEvent>) -> RecoveryEvent {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restarts_with_backoff() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (replacement, _replacement_control) = ScriptedProcess::new(11);
        let (restart, calls) = scripted_restarts([RestartOutcome::Spawn(replacement)]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(1);

        assert_eq!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryStarted {
                session_id: "s1".to_string(),
                attempt: 1,
                delay_ms: 100,
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoverySucceeded {
                session_id: "s1".to_string(),
                attempt: 1,
                pid: Some(11),
            }
        );
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let state = manager.state("s1").unwrap();
        assert_eq!(state.total_failures, 1);
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.is_recovering);
        assert!(state.last_recovery_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_does_not_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (restart, calls) = scripted_restarts([]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(0);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(manager.state("s1").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_window_forgives_streak() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (replacement, _keep_alive) = ScriptedProcess::new(11);
        let (restart, _) = scripted_restarts([RestartOutcome::Spawn(replacement)]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(2);
        next_event(&mut rx).await;
        next_event(&mut rx).await;
        assert_eq!(manager.state("s1").unwrap().consecutive_failures, 1);

        tokio::time::sleep(Duration::from_millis(5100)).await;
        let state = manager.state("s1").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_detects_dead_process() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (replacement, _keep_alive) = ScriptedProcess::new(11);
        let (restart, _) = scripted_restarts([RestartOutcome::Spawn(replacement)]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.set_liveness(Liveness::Dead("pid vanished".to_string()));

        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryStarted { attempt: 1, .. }
        ));
        assert_eq!(control.kill_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_callback_failure_counts_as_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (replacement, _keep_alive) = ScriptedProcess::new(12);
        let (restart, calls) = scripted_restarts([
            RestartOutcome::Fail("binary missing".to_string()),
            RestartOutcome::Spawn(replacement),
        ]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(1);

        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryStarted { attempt: 1, delay_ms: 100, .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryFailed { attempt: 1, ref error, .. } if error.contains("binary missing")
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryStarted { attempt: 2, delay_ms: 200, .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoverySucceeded { attempt: 2, pid: Some(12), .. }
        ));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(manager.state("s1").unwrap().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_disabled_only_counts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RecoveryConfig {
            enable_auto_restart: false,
            ..fast_config()
        };
        let manager = AutoRecoveryManager::new(config, tx);

        let (process, control) = ScriptedProcess::new(10);
        let (restart, calls) = scripted_restarts([]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(1);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(manager.state("s1").unwrap().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_cancels_pending_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (process, control) = ScriptedProcess::new(10);
        let (replacement, _keep_alive) = ScriptedProcess::new(11);
        let (restart, calls) = scripted_restarts([RestartOutcome::Spawn(replacement)]);
        manager.start_monitoring("s1", Box::new(process), restart);

        control.exit_with(1);
        assert!(matches!(
            next_event(&mut rx).await,
            RecoveryEvent::RecoveryStarted { .. }
        ));

        manager.stop_monitoring("s1");
        assert!(!manager.is_monitoring("s1"));
        assert!(manager.state("s1").is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());

        // Safe when nothing is monitored.
        manager.stop_monitoring("s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_monitoring_twice_replaces_monitor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AutoRecoveryManager::new(fast_config(), tx);

        let (first, first_control) = ScriptedProcess::new(10);
        let (restart, first_calls) = scripted_restarts([]);
        manager.start_monitoring("s1", Box::new(first), restart);

        let (second, _second_control) = ScriptedProcess::new(20);
        let (restart, _) = scripted_restarts([]);
        manager.start_monitoring("s1", Box::new(second), restart);

        first_control.exit_with(1);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(first_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(manager.state("s1").unwrap(), RecoveryState::default());
    }
}
