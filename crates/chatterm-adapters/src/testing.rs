//! Scripted doubles for the process and transport boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chatterm_proto::{Liveness, ProcessExit, ProcessHandle, RestartFn, Transport, TransportError};
use tokio::sync::watch;

/// A [`ProcessHandle`] whose exit and liveness are set through its
/// [`ProcessControl`]. It runs until told otherwise or killed.
pub struct ScriptedProcess {
    pid: u32,
    shared: Arc<ProcessShared>,
}

pub struct ProcessControl {
    shared: Arc<ProcessShared>,
}

struct ProcessShared {
    exit_tx: watch::Sender<Option<ProcessExit>>,
    liveness: Mutex<Option<Liveness>>,
    kills: AtomicUsize,
}

impl ScriptedProcess {
    pub fn new(pid: u32) -> (Self, ProcessControl) {
        let shared = Arc::new(ProcessShared {
            exit_tx: watch::channel(None).0,
            liveness: Mutex::new(None),
            kills: AtomicUsize::new(0),
        });
        (
            Self {
                pid,
                shared: Arc::clone(&shared),
            },
            ProcessControl { shared },
        )
    }
}

impl ProcessControl {
    /// Makes the process exit with `code`.
    pub fn exit_with(&self, code: i32) {
        self.exit(ProcessExit::Exited {
            code: Some(code),
            signal: None,
        });
    }

    pub fn exit(&self, exit: ProcessExit) {
        self.shared.exit_tx.send_replace(Some(exit));
    }

    /// Overrides what liveness checks report while the process has not exited.
    pub fn set_liveness(&self, liveness: Liveness) {
        *lock(&self.shared.liveness) = Some(liveness);
    }

    pub fn kill_count(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn liveness(&self) -> Liveness {
        if let Some(exit) = self.shared.exit_tx.borrow().clone() {
            return Liveness::Exited(exit);
        }
        lock(&self.shared.liveness)
            .clone()
            .unwrap_or(Liveness::Alive)
    }

    async fn exited(&self) -> ProcessExit {
        let mut exit_rx = self.shared.exit_tx.subscribe();
        exit_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|exit| exit.clone())
            .unwrap_or_else(|| ProcessExit::Errored {
                message: "scripted process dropped".to_string(),
            })
    }

    async fn kill(&self) {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        self.shared.exit_tx.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(ProcessExit::Exited {
                code: None,
                signal: Some("SIGKILL".to_string()),
            });
            true
        });
    }
}

/// What the next call of a scripted restart callback returns.
pub enum RestartOutcome {
    Spawn(ScriptedProcess),
    Fail(String),
}

/// Builds a [`RestartFn`] that plays `outcomes` in order and then fails.
///
/// The counter tracks how many times the callback was invoked.
pub fn scripted_restarts(
    outcomes: impl IntoIterator<Item = RestartOutcome>,
) -> (RestartFn, Arc<AtomicUsize>) {
    let queue: Arc<Mutex<VecDeque<RestartOutcome>>> =
        Arc::new(Mutex::new(outcomes.into_iter().collect()));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let restart: RestartFn = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let next = lock(&queue).pop_front();
        Box::pin(async move {
            match next {
                Some(RestartOutcome::Spawn(process)) => {
                    Ok(Box::new(process) as Box<dyn ProcessHandle>)
                }
                Some(RestartOutcome::Fail(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("no scripted process left")),
            }
        })
    });

    (restart, calls)
}

/// A [`Transport`] that records commands and plays scripted connect results.
#[derive(Default)]
pub struct MockTransport {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    pings: AtomicUsize,
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    fail_pings: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues the result of a future `connect` call. Unscripted calls succeed.
    pub fn push_connect_result(&self, result: Result<(), TransportError>) {
        lock(&self.connect_results).push_back(result);
    }

    pub fn set_fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.connect_results).pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_pings.load(Ordering::SeqCst) {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
