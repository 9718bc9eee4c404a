//! Optional WebSocket relay for chat events.
//!
//! Frames produced while the relay is down wait in an [`Outbox`] and are sent
//! in order once the reconnect manager reports the connection back.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chatterm_adapters::{AutoReconnectManager, WsTransport};
use chatterm_core::ReconnectConfig;
use chatterm_proto::{ReconnectEvent, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames kept while disconnected. The oldest are dropped past this.
pub const OUTBOX_CAPACITY: usize = 1024;

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameSink for WsTransport {
    async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        self.send_text(frame).await
    }
}

/// Ordered queue of frames not yet delivered.
#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: String) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped.is_power_of_two() {
                warn!(dropped = self.dropped, "Relay outbox full, dropping oldest frames");
            }
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sends queued frames in order, stopping at the first failure. The
    /// failed frame stays at the front. Returns how many frames were sent.
    pub async fn flush(&mut self, sink: &dyn FrameSink) -> usize {
        let mut sent = 0;
        while let Some(frame) = self.frames.front() {
            match sink.send_frame(frame.clone()).await {
                Ok(()) => {
                    self.frames.pop_front();
                    sent += 1;
                }
                Err(e) => {
                    debug!(error = %e, queued = self.frames.len(), "Relay send failed, keeping frames");
                    break;
                }
            }
        }
        sent
    }
}

/// The relay transport, its reconnect manager and the pending frames.
pub struct Relay {
    transport: Arc<WsTransport>,
    manager: AutoReconnectManager,
    outbox: Outbox,
}

impl Relay {
    /// Builds the relay and starts the signal pump. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn start(
        url: &str,
        config: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>, mpsc::UnboundedReceiver<String>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(WsTransport::new(url, signals_tx, inbound_tx));
        let manager = AutoReconnectManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            config,
            events_tx,
        );
        let pump = manager.clone();
        tokio::spawn(async move { pump.run(signals_rx).await });

        let relay = Self {
            transport,
            manager,
            outbox: Outbox::new(OUTBOX_CAPACITY),
        };
        (relay, events_rx, inbound_rx)
    }

    /// First connection. A failure is retried in the background.
    pub async fn connect(&self) {
        if let Err(e) = self.manager.connect().await {
            warn!(url = %self.transport.url(), error = %e, "Relay unavailable, will retry");
        }
    }

    /// Queues `frame` and sends everything queued if connected.
    pub async fn send(&mut self, frame: String) {
        self.outbox.push(frame);
        self.flush().await;
    }

    pub async fn flush(&mut self) {
        if !self.manager.is_connected() || self.outbox.is_empty() {
            return;
        }
        let sent = self.outbox.flush(self.transport.as_ref()).await;
        if sent > 1 {
            debug!(sent, "Flushed queued relay frames");
        }
    }

    pub async fn close(&mut self) {
        self.flush().await;
        if !self.outbox.is_empty() {
            warn!(undelivered = self.outbox.len(), "Closing relay with queued frames");
        }
        self.manager.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                return Err(TransportError::NotConnected);
            }
            sent.push(frame);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_sends_in_order() {
        let mut outbox = Outbox::new(8);
        outbox.push("a".to_string());
        outbox.push("b".to_string());
        outbox.push("c".to_string());

        let sink = RecordingSink::default();
        assert_eq!(outbox.flush(&sink).await, 3);
        assert!(outbox.is_empty());
        assert_eq!(*sink.sent.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_remaining_frames() {
        let mut outbox = Outbox::new(8);
        for frame in ["a", "b", "c"] {
            outbox.push(frame.to_string());
        }

        let sink = RecordingSink {
            fail_after: Some(1),
            ..RecordingSink::default()
        };
        assert_eq!(outbox.flush(&sink).await, 1);
        assert_eq!(outbox.len(), 2);

        let sink = RecordingSink::default();
        outbox.flush(&sink).await;
        assert_eq!(*sink.sent.lock().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_full_outbox_drops_oldest() {
        let mut outbox = Outbox::new(2);
        outbox.push("a".to_string());
        outbox.push("b".to_string());
        outbox.push("c".to_string());

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.frames, ["b", "c"]);
        assert_eq!(outbox.dropped, 1);
    }
}
