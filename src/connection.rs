//! The reconnectable live channel of one conversation.
//!
//! A [`Connection`] owns at most one transport at a time. `run` dials, performs
//! the STOMP handshake, subscribes to the conversation topic and then pumps
//! inbound frames until the transport drops, after which it backs off and
//! dials again. Each successful handshake starts a new *generation*;
//! subscriptions and the heartbeat task are scoped to a generation.

use crate::config::{Credential, SessionConfig};
use crate::handshake::{self, HandshakeError};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use bytes::Bytes;
use chatcore::stomp::{Command, HEARTBEAT, StompDecoder, StompFrame};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open transport: {0}")]
    Dial(anyhow::Error),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Failed to send frame: {0}")]
    Send(anyhow::Error),
    #[error("Not connected")]
    NotConnected,
    #[error("Transport dropped")]
    Dropped,
    #[error("Server sent ERROR: {0}")]
    Server(String),
    #[error("Gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// The topic subscription of a fresh connection is in place.
    Subscribed { generation: u64 },
    Message { destination: String, body: Bytes },
    Failed(TransportError),
}

pub struct Connection {
    transport_factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    credential: Credential,
    topic: String,

    state: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// destination -> subscription id, for the current generation only
    subscriptions: Mutex<HashMap<String, String>>,
    next_subscription_id: AtomicU64,
    outbox: Mutex<VecDeque<StompFrame>>,
    generation: AtomicU64,

    is_running: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    pub fn new(
        transport_factory: Arc<dyn TransportFactory>,
        config: SessionConfig,
        credential: Credential,
        topic: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        let connection = Arc::new(Self {
            transport_factory,
            config,
            credential,
            topic: topic.into(),
            state,
            transport: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
            outbox: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            shutdown,
            events,
        });
        (connection, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn queued_frames(&self) -> usize {
        self.outbox.lock().await.len()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(target: "Connection", "State changed to {next:?}");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drives the connection until `disconnect` is called or the reconnect
    /// budget runs out.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Connection", "`run` called while already running.");
            return;
        }
        let _running = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::SeqCst);
        });

        let mut shutdown = self.shutdown.subscribe();
        let policy = self.config.reconnect.clone();
        let mut failures = 0u32;
        let mut next_state = ConnectionState::Connecting;

        while !self.is_shutting_down() {
            self.set_state(next_state);
            next_state = ConnectionState::Reconnecting;

            match self.connect().await {
                Ok(live) => {
                    failures = 0;
                    match self.read_messages_loop(live).await {
                        Ok(()) => debug!(target: "Connection", "Message loop exited gracefully."),
                        Err(e) => warn!(target: "Connection", "Message loop exited: {e}"),
                    }
                    self.cleanup_connection_state().await;
                }
                Err(e) => {
                    self.cleanup_connection_state().await;
                    failures += 1;
                    warn!(target: "Connection", "Connection attempt {failures} failed: {e}");
                    if failures >= policy.max_attempts {
                        error!(target: "Connection", "Giving up after {failures} attempts.");
                        self.emit(ConnectionEvent::Failed(TransportError::RetriesExhausted {
                            attempts: failures,
                        }));
                        break;
                    }
                }
            }

            if self.is_shutting_down() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = policy.delay_for(failures.max(1)) + jitter(policy.base_delay);
            info!(
                target: "Connection",
                "Will attempt to reconnect in {:?} (attempt {})",
                delay,
                failures + 1
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }

        self.cleanup_connection_state().await;
        self.set_state(ConnectionState::Disconnected);
        info!(target: "Connection", "Run loop has shut down.");
    }

    async fn connect(self: &Arc<Self>) -> Result<LiveChannel, TransportError> {
        let (transport, mut transport_events) = self
            .transport_factory
            .create_transport()
            .await
            .map_err(TransportError::Dial)?;

        let session = match handshake::do_handshake(
            &transport,
            &mut transport_events,
            self.config.stomp_host(),
            &self.credential,
            self.config.heartbeat_interval,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                transport.disconnect().await;
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscriptions.lock().await.clear();
        *self.transport.lock().await = Some(transport);

        self.subscribe(&self.topic).await?;
        self.flush_outbox_and_go_live().await?;
        self.emit(ConnectionEvent::Subscribed { generation });

        let server_heartbeat = session.server_heartbeat.as_deref();
        if let Some(interval) = negotiate_heartbeat(self.config.heartbeat_interval, server_heartbeat)
        {
            let connection = self.clone();
            tokio::spawn(async move { connection.heartbeat_loop(generation, interval).await });
        }

        Ok(LiveChannel {
            decoder: session.decoder,
            events: transport_events,
            read_timeout: negotiate_read_timeout(self.config.heartbeat_interval, server_heartbeat),
        })
    }

    async fn cleanup_connection_state(&self) {
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.subscriptions.lock().await.clear();
    }

    /// Subscribes once per connection; returns `false` if already subscribed.
    pub async fn subscribe(&self, destination: &str) -> Result<bool, TransportError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(destination) {
            return Ok(false);
        }
        let id = format!(
            "sub-{}",
            self.next_subscription_id.fetch_add(1, Ordering::SeqCst)
        );
        self.send_frame(&StompFrame::subscribe(&id, destination))
            .await?;
        info!(target: "Connection", "Subscribed to {destination} as {id}");
        subscriptions.insert(destination.to_string(), id);
        Ok(true)
    }

    /// Fire-and-forget send. While offline the frame is queued and flushed,
    /// in order, once the next connection has resubscribed.
    pub async fn send(&self, destination: &str, body: impl Into<Bytes>) {
        let frame = StompFrame::send(destination, body);
        let mut outbox = self.outbox.lock().await;
        if self.is_connected() && outbox.is_empty() {
            match self.send_frame(&frame).await {
                Ok(()) => return,
                Err(e) => warn!(target: "Connection", "Send to {destination} failed, queueing: {e}"),
            }
        }
        debug!(target: "Connection", "Queueing frame for {destination}");
        outbox.push_back(frame);
    }

    /// Sends only if a connection is up. Returns whether the frame went out.
    pub async fn send_if_connected(&self, destination: &str, body: impl Into<Bytes>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.send_frame(&StompFrame::send(destination, body)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Connection", "Send to {destination} failed: {e}");
                false
            }
        }
    }

    /// Sends queued frames, then enters `Connected`. The outbox stays locked
    /// throughout so `send` cannot overtake a queued frame.
    async fn flush_outbox_and_go_live(&self) -> Result<(), TransportError> {
        let mut outbox = self.outbox.lock().await;
        if !outbox.is_empty() {
            info!(target: "Connection", "Flushing {} queued frame(s)", outbox.len());
        }
        while let Some(frame) = outbox.front() {
            self.send_frame(frame).await?;
            outbox.pop_front();
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn send_frame(&self, frame: &StompFrame) -> Result<(), TransportError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        trace!(target: "Connection", "--> {}", frame.command);
        transport
            .send(&frame.encode())
            .await
            .map_err(TransportError::Send)
    }

    /// Tears the connection down for good. Only the first call does any work.
    pub async fn disconnect(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        // Take the transport before signalling shutdown so the run loop does
        // not close it first.
        let transport = self.transport.lock().await.take();
        if self.shutdown.send_replace(true) {
            if let Some(transport) = transport {
                transport.disconnect().await;
            }
            return false;
        }
        info!(target: "Connection", "Disconnecting intentionally.");

        if let Some(transport) = transport {
            let subscription_ids: Vec<String> = self
                .subscriptions
                .lock()
                .await
                .drain()
                .map(|(_, id)| id)
                .collect();
            for id in subscription_ids {
                let _ = transport.send(&StompFrame::unsubscribe(&id).encode()).await;
            }
            let _ = transport
                .send(&StompFrame::disconnect("disconnect").encode())
                .await;
            transport.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        true
    }

    async fn read_messages_loop(&self, live: LiveChannel) -> Result<(), TransportError> {
        debug!(target: "Connection", "Starting message loop...");
        let LiveChannel {
            mut decoder,
            events: mut transport_events,
            read_timeout,
        } = live;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            while let Some(decoded) = decoder.decode_frame() {
                match decoded {
                    Ok(frame) => self.handle_frame(frame)?,
                    Err(e) => warn!(target: "Connection", "Dropping malformed frame: {e}"),
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => return Ok(()),
                _ = read_idle(read_timeout) => {
                    warn!(target: "Connection", "Nothing received for {read_timeout:?}, dropping transport.");
                    return Err(TransportError::Dropped);
                }
                event = transport_events.recv() => match event {
                    Some(TransportEvent::DataReceived(data)) => decoder.feed(&data),
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => {
                        if self.is_shutting_down() {
                            return Ok(());
                        }
                        info!(target: "Connection", "Transport disconnected unexpectedly.");
                        return Err(TransportError::Dropped);
                    }
                },
            }
        }
    }

    fn handle_frame(&self, frame: StompFrame) -> Result<(), TransportError> {
        match frame.command {
            Command::Message => {
                let destination = frame.get_header("destination").unwrap_or_default().to_string();
                trace!(target: "Connection", "<-- MESSAGE on {destination}");
                self.emit(ConnectionEvent::Message {
                    destination,
                    body: frame.body,
                });
                Ok(())
            }
            Command::Error => {
                let message = frame
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                warn!(target: "Connection", "Server sent ERROR: {message}");
                self.emit(ConnectionEvent::Failed(TransportError::Server(message.clone())));
                // The server closes the socket after ERROR.
                Err(TransportError::Server(message))
            }
            Command::Receipt => {
                debug!(target: "Connection", "<-- RECEIPT {:?}", frame.get_header("receipt-id"));
                Ok(())
            }
            other => {
                debug!(target: "Connection", "Ignoring unexpected {other} frame");
                Ok(())
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(target: "Connection/Heartbeat", "Sending heartbeats every {interval:?}");

        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if self.generation() != generation || !self.is_connected() {
                        debug!(target: "Connection/Heartbeat", "Connection generation {generation} is gone, exiting heartbeat loop.");
                        return;
                    }
                    let transport = self.transport.lock().await.clone();
                    let Some(transport) = transport else {
                        return;
                    };
                    if let Err(e) = transport.send(HEARTBEAT).await {
                        warn!(target: "Connection/Heartbeat", "Heartbeat failed: {e}");
                        return;
                    }
                    trace!(target: "Connection/Heartbeat", "--> heartbeat");
                }
                _ = shutdown_signalled(&mut shutdown) => return,
            }
        }
    }
}

/// A freshly subscribed transport, handed from `connect` to the read loop.
struct LiveChannel {
    decoder: StompDecoder,
    events: mpsc::Receiver<TransportEvent>,
    read_timeout: Option<Duration>,
}

/// Resolves once shutdown is requested. The `watch::Ref` from `wait_for`
/// is dropped here so callers' `select!` futures stay `Send`.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn read_idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn jitter(base: Duration) -> Duration {
    let max = (base.as_millis() / 4) as u64;
    Duration::from_millis(rand::rng().random_range(0..=max))
}

/// Outgoing heartbeat period agreed from our `heart-beat` offer and the
/// server's CONNECTED header (`sx,sy`): the larger of our interval and `sy`,
/// or none when either side declines.
pub fn negotiate_heartbeat(ours: Duration, server_header: Option<&str>) -> Option<Duration> {
    let wanted_by_server = server_header?
        .split(',')
        .nth(1)
        .and_then(|sy| sy.trim().parse::<u64>().ok())
        .map(Duration::from_millis)?;
    if ours.is_zero() || wanted_by_server.is_zero() {
        return None;
    }
    Some(ours.max(wanted_by_server))
}

/// How long the read loop tolerates silence: twice the incoming heartbeat
/// period agreed from our offer and the server's `sx`, or none when either
/// side declines.
pub fn negotiate_read_timeout(ours: Duration, server_header: Option<&str>) -> Option<Duration> {
    let server_sends = server_header?
        .split(',')
        .next()
        .and_then(|sx| sx.trim().parse::<u64>().ok())
        .map(Duration::from_millis)?;
    if ours.is_zero() || server_sends.is_zero() {
        return None;
    }
    Some(ours.max(server_sends) * 2)
}
