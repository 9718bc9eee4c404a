//! WebSocket relay client.
//!
//! Implements [`Transport`] for the reconnect manager. Inbound text frames go
//! to an inbound channel; losing the socket is reported on the signal channel
//! as [`TransportEvent::Disconnected`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chatterm_proto::{ClientSignal, MANUAL_DISCONNECT_REASON, Transport, TransportError, TransportEvent};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CLOSED_REASON: &str = "transport close";

pub struct WsTransport {
    url: String,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    signals_tx: mpsc::UnboundedSender<ClientSignal>,
    inbound_tx: mpsc::UnboundedSender<String>,
}

impl WsTransport {
    pub fn new(
        url: impl Into<String>,
        signals_tx: mpsc::UnboundedSender<ClientSignal>,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            url: url.into(),
            sink: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            signals_tx,
            inbound_tx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Sends `value` as one JSON text frame.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(value).map_err(|e| TransportError::Send(e.to_string()))?;
        self.send_text(text).await
    }

    fn replace_reader(&self, reader: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut *lock(&self.reader), reader);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        debug!(url = %self.url, "Connecting relay");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, mut stream) = stream.split();

        // Stop the old reader first so it cannot report the old socket closing.
        self.replace_reader(None);
        *self.sink.lock().await = Some(sink);

        let signals_tx = self.signals_tx.clone();
        let inbound_tx = self.inbound_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| CLOSED_REASON.to_string());
                    }
                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("transport error: {e}"),
                    None => break CLOSED_REASON.to_string(),
                }
            };
            debug!(reason = %reason, "Relay socket closed");
            let _ = signals_tx.send(ClientSignal::Transport(TransportEvent::Disconnected { reason }));
        });
        self.replace_reader(Some(reader));

        info!(url = %self.url, "Relay connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.replace_reader(None);
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            let _ = self
                .signals_tx
                .send(ClientSignal::Transport(TransportEvent::Disconnected {
                    reason: MANUAL_DISCONNECT_REASON.to_string(),
                }));
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
