use crate::config::Credential;
use crate::transport::{Transport, TransportEvent};
use chatcore::stomp::{Command, StompDecoder, StompFrame};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("Timed out waiting for CONNECTED")]
    Timeout,
    #[error("Server rejected the connection: {0}")]
    Rejected(String),
    #[error("Unexpected event during handshake: {0}")]
    UnexpectedEvent(String),
}

type Result<T> = std::result::Result<T, HandshakeError>;

/// Result of a completed STOMP handshake.
#[derive(Debug)]
pub struct StompSession {
    pub version: String,
    /// Raw `heart-beat` header of CONNECTED, if any.
    pub server_heartbeat: Option<String>,
    /// Decoder state carried over so frames that arrived together with
    /// CONNECTED are not lost.
    pub decoder: StompDecoder,
}

/// Sends CONNECT with the bearer credential and waits for CONNECTED.
pub async fn do_handshake(
    transport: &Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    host: &str,
    credential: &Credential,
    heartbeat: Duration,
    response_timeout: Duration,
) -> Result<StompSession> {
    let mut decoder = StompDecoder::new();

    debug!(target: "Handshake", "--> Sending CONNECT to {host}");
    let connect = StompFrame::connect(host, credential.token(), heartbeat.as_millis() as u64);
    transport.send(&connect.encode()).await?;

    let reply = loop {
        if let Some(decoded) = decoder.decode_frame() {
            match decoded {
                Ok(frame) => break frame,
                Err(e) => return Err(HandshakeError::UnexpectedEvent(e.to_string())),
            }
        }
        match timeout(response_timeout, transport_events.recv()).await {
            Ok(Some(TransportEvent::DataReceived(data))) => decoder.feed(&data),
            Ok(Some(TransportEvent::Connected)) => continue,
            Ok(Some(TransportEvent::Disconnected)) => {
                return Err(HandshakeError::UnexpectedEvent(
                    "Disconnected during handshake".to_string(),
                ));
            }
            Ok(None) | Err(_) => return Err(HandshakeError::Timeout),
        }
    };

    match reply.command {
        Command::Connected => {
            let version = reply.get_header("version").unwrap_or("1.2").to_string();
            info!(target: "Handshake", "STOMP session established (version {version})");
            Ok(StompSession {
                version,
                server_heartbeat: reply.get_header("heart-beat").map(str::to_string),
                decoder,
            })
        }
        Command::Error => Err(HandshakeError::Rejected(
            reply
                .get_header("message")
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned()),
        )),
        other => Err(HandshakeError::UnexpectedEvent(format!(
            "{other} before CONNECTED"
        ))),
    }
}
