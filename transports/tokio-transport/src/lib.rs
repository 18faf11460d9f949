//! WebSocket transport for the live chat channel.
//!
//! STOMP frames are carried as WebSocket text messages; the transport only
//! moves bytes and leaves framing to the caller.

use async_trait::async_trait;
use bytes::Bytes;
use chatcore::net::{Transport, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

/// Text when the payload is UTF-8, binary otherwise.
fn to_message(data: &[u8]) -> Message {
    match std::str::from_utf8(data) {
        Ok(text) => Message::text(text.to_owned()),
        Err(_) => Message::binary(data.to_vec()),
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!(target: "Transport", "--> Sending {} bytes", data.len());
        sink.send(to_message(data))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Transport", "Error while closing socket: {e}");
            }
        }
    }
}

/// Dials the configured WebSocket URL for every new transport.
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {}", self.url);
        let (client, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() || msg.is_binary() {
                    let data: Bytes = msg.into_data();
                    trace!(target: "Transport", "<-- Received {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::DataReceived(data))
                        .await
                        .is_err()
                    {
                        warn!(target: "Transport", "Event receiver dropped, closing read pump");
                        break;
                    }
                } else if msg.is_close() {
                    trace!(target: "Transport", "Received close frame");
                    break;
                }
            }
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
