//! Reports how each supervised child ended, so the run loop can tell a clean
//! exit from a crash the recovery manager will handle.

use anyhow::Result;
use async_trait::async_trait;
use chatterm_adapters::PtySpawner;
use chatterm_proto::{Liveness, ProcessExit, ProcessHandle, RestartFn};
use tokio::sync::mpsc;

/// Forwards every observed exit of the wrapped process to `exits_tx`.
pub struct TrackedProcess {
    inner: Box<dyn ProcessHandle>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
}

impl TrackedProcess {
    pub fn new(inner: Box<dyn ProcessHandle>, exits_tx: mpsc::UnboundedSender<ProcessExit>) -> Self {
        Self { inner, exits_tx }
    }
}

#[async_trait]
impl ProcessHandle for TrackedProcess {
    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    fn liveness(&self) -> Liveness {
        let liveness = self.inner.liveness();
        if let Liveness::Exited(exit) = &liveness {
            let _ = self.exits_tx.send(exit.clone());
        }
        liveness
    }

    async fn exited(&self) -> ProcessExit {
        let exit = self.inner.exited().await;
        let _ = self.exits_tx.send(exit.clone());
        exit
    }

    async fn kill(&self) {
        self.inner.kill().await;
    }
}

/// Spawns the first child, tracked.
pub fn spawn_tracked(
    spawner: &PtySpawner,
    exits_tx: &mpsc::UnboundedSender<ProcessExit>,
) -> Result<TrackedProcess> {
    let process = spawner.spawn()?;
    Ok(TrackedProcess::new(Box::new(process), exits_tx.clone()))
}

/// The spawner's restart callback, with every replacement tracked too.
pub fn tracked_restart_fn(
    spawner: &PtySpawner,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
) -> RestartFn {
    track_restarts(spawner.restart_fn(), exits_tx)
}

fn track_restarts(restart: RestartFn, exits_tx: mpsc::UnboundedSender<ProcessExit>) -> RestartFn {
    Box::new(move || {
        let next = restart();
        let exits_tx = exits_tx.clone();
        Box::pin(async move {
            let process = next.await?;
            Ok(Box::new(TrackedProcess::new(process, exits_tx)) as Box<dyn ProcessHandle>)
        })
    })
}
