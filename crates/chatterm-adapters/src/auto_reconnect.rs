//! Transport auto-reconnect.
//!
//! [`AutoReconnectManager`] keeps one client [`Transport`] connected. It reacts
//! to lifecycle, network and visibility signals, retries with capped
//! exponential backoff, and pings on an interval while connected.
//!
//! At most one reconnect attempt is in flight: `is_reconnecting` is set under
//! the state lock before the backoff delay starts, and cleared by the attempt
//! itself before its result is fed back into [`on_connect`] or
//! [`on_connect_error`].
//!
//! [`on_connect`]: AutoReconnectManager::on_connect
//! [`on_connect_error`]: AutoReconnectManager::on_connect_error

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatterm_core::ReconnectConfig;
use chatterm_proto::{
    ClientSignal, MANUAL_DISCONNECT_REASON, NetworkStatus, PING_TIMEOUT_REASON, ReconnectEvent,
    Transport, TransportError, TransportEvent, Visibility,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Connection bookkeeping, one per manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_reconnecting: bool,
    pub retry_count: u32,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub total_reconnects: u32,
    pub consecutive_failures: u32,
    pub network_status: NetworkStatus,
}

#[derive(Default)]
struct Shared {
    config: ReconnectConfig,
    state: ConnectionState,
    /// Set by a deliberate disconnect; cleared by `connect()`.
    manual: bool,
    /// A connection existed and was lost, so the next connect is a reconnect.
    lost_connection: bool,
    /// `MaxRetriesReached` already emitted for the current streak.
    exhausted: bool,
    reconnect_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    events_tx: mpsc::UnboundedSender<ReconnectEvent>,
    shared: Mutex<Shared>,
}

/// Keeps a transport connected.
///
/// Cheap to clone; all clones drive the same connection. Must be used from
/// within a tokio runtime.
#[derive(Clone)]
pub struct AutoReconnectManager {
    inner: Arc<Inner>,
}

impl AutoReconnectManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ReconnectConfig,
        events_tx: mpsc::UnboundedSender<ReconnectEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                events_tx,
                shared: Mutex::new(Shared {
                    config,
                    ..Shared::default()
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state.is_connected
    }

    pub fn update_config(&self, config: ReconnectConfig) {
        self.inner.lock().config = config;
    }

    /// Connects now, cancelling any scheduled attempt.
    ///
    /// Clears a previous deliberate disconnect. Failure counters are left
    /// alone; only an established connection resets them.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut shared = self.inner.lock();
            shared.manual = false;
            shared.exhausted = false;
            shared.state.is_reconnecting = false;
            abort(&mut shared.reconnect_task);
        }

        match self.inner.transport.connect().await {
            Ok(()) => {
                self.inner.on_connect();
                Ok(())
            }
            Err(e) => {
                self.inner.on_connect_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Disconnects on purpose. Pending reconnects and the heartbeat are
    /// cancelled before the transport is closed, and no reconnect follows.
    pub async fn disconnect(&self) {
        {
            let mut shared = self.inner.lock();
            shared.manual = true;
            shared.state.is_reconnecting = false;
            abort(&mut shared.reconnect_task);
            abort(&mut shared.heartbeat_task);
        }
        info!("Disconnecting transport");
        self.inner.transport.disconnect().await;

        let mut shared = self.inner.lock();
        if shared.state.is_connected {
            shared.state.is_connected = false;
            shared.state.last_disconnect_time = Some(Utc::now());
        }
    }

    pub fn on_connect(&self) {
        self.inner.on_connect();
    }

    pub fn on_disconnect(&self, reason: &str) {
        self.inner.on_disconnect(reason);
    }

    pub fn on_connect_error(&self, error: &str) {
        self.inner.on_connect_error(error);
    }

    pub fn on_network_change(&self, status: NetworkStatus) {
        self.inner.on_network_change(status);
    }

    pub fn on_visibility_change(&self, visibility: Visibility) {
        self.inner.on_visibility_change(visibility);
    }

    /// Feeds signals into the handlers until the channel closes.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<ClientSignal>) {
        while let Some(signal) = signals.recv().await {
            debug!(?signal, "Client signal");
            match signal {
                ClientSignal::Transport(TransportEvent::Connected | TransportEvent::Reconnected) => {
                    self.on_connect();
                }
                ClientSignal::Transport(TransportEvent::Disconnected { reason }) => {
                    self.on_disconnect(&reason);
                }
                ClientSignal::Transport(TransportEvent::ConnectError { error }) => {
                    self.on_connect_error(&error);
                }
                ClientSignal::Network(status) => self.on_network_change(status),
                ClientSignal::Visibility(visibility) => self.on_visibility_change(visibility),
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ReconnectEvent) {
        let _ = self.events_tx.send(event);
    }

    fn on_connect(self: &Arc<Self>) {
        let mut shared = self.lock();
        let attempts = shared.state.retry_count;

        shared.state.is_connected = true;
        shared.state.is_reconnecting = false;
        shared.state.retry_count = 0;
        shared.state.consecutive_failures = 0;
        shared.state.last_connect_time = Some(Utc::now());
        shared.exhausted = false;
        abort(&mut shared.reconnect_task);

        if shared.lost_connection {
            shared.lost_connection = false;
            shared.state.total_reconnects += 1;
            info!(attempts, "Reconnected");
            self.emit(ReconnectEvent::ReconnectSucceeded { attempts });
        } else {
            info!("Connected");
        }

        self.start_heartbeat(&mut shared);
    }

    fn on_disconnect(self: &Arc<Self>, reason: &str) {
        let mut shared = self.lock();
        // One lost socket can be reported twice, by the heartbeat and by the
        // transport itself. Only the first report counts.
        if !shared.state.is_connected {
            debug!(reason, "Already disconnected");
            if reason == MANUAL_DISCONNECT_REASON {
                shared.manual = true;
            }
            return;
        }
        shared.state.is_connected = false;
        shared.state.last_disconnect_time = Some(Utc::now());
        shared.state.consecutive_failures += 1;
        shared.lost_connection = true;
        abort(&mut shared.heartbeat_task);

        if reason == MANUAL_DISCONNECT_REASON {
            info!(reason, "Disconnected by client, not reconnecting");
            shared.manual = true;
            return;
        }
        if shared.state.network_status == NetworkStatus::Offline {
            info!(reason, "Disconnected while offline, waiting for network");
            return;
        }

        warn!(reason, consecutive_failures = shared.state.consecutive_failures, "Disconnected");
        self.start_reconnect(&mut shared);
    }

    fn on_connect_error(self: &Arc<Self>, error: &str) {
        let mut shared = self.lock();
        shared.state.is_connected = false;
        shared.state.consecutive_failures += 1;
        shared.lost_connection = true;

        let attempt = shared.state.retry_count;
        warn!(attempt, error, "Connection attempt failed");
        self.emit(ReconnectEvent::ReconnectFailed {
            attempt,
            error: error.to_string(),
        });

        if shared.manual || shared.state.network_status == NetworkStatus::Offline {
            return;
        }
        self.start_reconnect(&mut shared);
    }

    fn on_network_change(self: &Arc<Self>, status: NetworkStatus) {
        let mut shared = self.lock();
        shared.state.network_status = status;
        info!(?status, "Network status changed");
        self.emit(ReconnectEvent::NetworkChange { status });

        if status == NetworkStatus::Online && !shared.state.is_connected && !shared.manual {
            self.start_reconnect(&mut shared);
        }
    }

    fn on_visibility_change(self: &Arc<Self>, visibility: Visibility) {
        let mut shared = self.lock();
        debug!(?visibility, "Visibility changed");

        if visibility == Visibility::Visible
            && !shared.state.is_connected
            && !shared.manual
            && shared.state.network_status != NetworkStatus::Offline
        {
            self.start_reconnect(&mut shared);
        }
    }

    /// Schedules one reconnect attempt unless one is in flight or the retry
    /// ceiling is passed. Called with the state lock held.
    fn start_reconnect(self: &Arc<Self>, shared: &mut Shared) {
        if shared.state.is_reconnecting {
            debug!("Reconnect already in progress");
            return;
        }

        if shared.state.consecutive_failures > shared.config.max_retries {
            if !shared.exhausted {
                shared.exhausted = true;
                let consecutive_failures = shared.state.consecutive_failures;
                error!(consecutive_failures, "Max reconnect retries reached, giving up");
                self.emit(ReconnectEvent::MaxRetriesReached {
                    consecutive_failures,
                });
            }
            return;
        }

        shared.state.is_reconnecting = true;
        shared.state.retry_count += 1;
        let attempt = shared.state.retry_count;
        let delay = shared.config.delay_for(attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        info!(attempt, delay_ms, "Scheduling reconnect");
        self.emit(ReconnectEvent::ReconnectStarted { attempt, delay_ms });

        let inner = Arc::clone(self);
        abort(&mut shared.reconnect_task);
        shared.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(attempt, "Reconnecting");
            let result = inner.transport.connect().await;

            {
                let mut shared = inner.lock();
                shared.state.is_reconnecting = false;
                // Finished; nothing left to abort.
                shared.reconnect_task = None;
            }

            match result {
                Ok(()) => inner.on_connect(),
                Err(e) => inner.on_connect_error(&e.to_string()),
            }
        }));
    }

    fn start_heartbeat(self: &Arc<Self>, shared: &mut Shared) {
        abort(&mut shared.heartbeat_task);
        if !shared.config.enable_heartbeat {
            return;
        }

        let interval = shared.config.ping_interval();
        let inner = Arc::clone(self);
        shared.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let failure = match tokio::time::timeout(interval, inner.transport.ping()).await {
                    Ok(Ok(())) => {
                        debug!("Heartbeat ok");
                        continue;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "no response".to_string(),
                };

                warn!(error = %failure, "Heartbeat failed");
                inner.lock().heartbeat_task = None;
                inner.on_disconnect(PING_TIMEOUT_REASON);
                break;
            }
        }));
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}
