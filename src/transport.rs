pub use chatcore::net::{Transport, TransportEvent, TransportFactory};
pub use chatsync_tokio_transport::TokioWebSocketTransportFactory;

#[cfg(test)]
pub mod mock {
    //! Scripted transports for driving a connection in tests.
    //!
    //! Every transport created by [`MockTransportFactory`] records what is
    //! sent on it and answers a STOMP `CONNECT` with `CONNECTED`, so the
    //! handshake completes without a server. Tests hold the event sender of
    //! each transport and can inject frames or simulate a drop.

    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chatcore::stomp::{Command, HEARTBEAT, StompDecoder, StompFrame};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::{Notify, mpsc};

    pub struct MockTransport {
        events: mpsc::Sender<TransportEvent>,
        sent: StdMutex<Vec<StompFrame>>,
        decoder: StdMutex<StompDecoder>,
        closed: AtomicBool,
        heartbeats: AtomicU32,
        reject_handshake: bool,
        server_heartbeat: String,
        subscribe_gate: Option<Arc<Notify>>,
        holding_subscribe: AtomicBool,
    }

    impl MockTransport {
        /// Frames sent on this transport, heartbeats excluded.
        pub fn sent(&self) -> Vec<StompFrame> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn sent_commands(&self, command: Command) -> Vec<StompFrame> {
            self.sent()
                .into_iter()
                .filter(|f| f.command == command)
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn heartbeats(&self) -> u32 {
            self.heartbeats.load(Ordering::SeqCst)
        }

        /// Whether a SUBSCRIBE is waiting on the factory's subscribe gate.
        pub fn is_holding_subscribe(&self) -> bool {
            self.holding_subscribe.load(Ordering::SeqCst)
        }

        /// Pushes a server frame to the client.
        pub async fn push(&self, frame: StompFrame) {
            let _ = self
                .events
                .send(TransportEvent::DataReceived(Bytes::from(frame.encode())))
                .await;
        }

        /// Pushes raw bytes, for feeding broken frames.
        pub async fn push_raw(&self, data: &'static [u8]) {
            let _ = self
                .events
                .send(TransportEvent::DataReceived(Bytes::from_static(data)))
                .await;
        }

        /// Simulates the server dropping the connection.
        pub async fn drop_connection(&self) {
            let _ = self.events.send(TransportEvent::Disconnected).await;
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
            if self.is_closed() {
                return Err(anyhow::anyhow!("transport closed"));
            }
            if data == HEARTBEAT {
                self.heartbeats.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            let mut frames = Vec::new();
            if let Ok(mut decoder) = self.decoder.lock() {
                decoder.feed(data);
                while let Some(Ok(frame)) = decoder.decode_frame() {
                    frames.push(frame);
                }
            }
            for frame in frames {
                if frame.command == Command::Subscribe {
                    if let Some(gate) = &self.subscribe_gate {
                        self.holding_subscribe.store(true, Ordering::SeqCst);
                        gate.notified().await;
                        self.holding_subscribe.store(false, Ordering::SeqCst);
                    }
                }
                if frame.command == Command::Connect {
                    let reply = if self.reject_handshake {
                        StompFrame::new(Command::Error).header("message", "bad credentials")
                    } else {
                        StompFrame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", self.server_heartbeat.as_str())
                    };
                    let _ = self
                        .events
                        .try_send(TransportEvent::DataReceived(Bytes::from(reply.encode())));
                }
                if let Ok(mut sent) = self.sent.lock() {
                    sent.push(frame);
                }
            }
            Ok(())
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out scripted transports; can be told to fail dials.
    #[derive(Default)]
    pub struct MockTransportFactory {
        created: StdMutex<Vec<Arc<MockTransport>>>,
        failures_left: AtomicU32,
        reject_handshake: AtomicBool,
        server_heartbeat: StdMutex<Option<String>>,
        subscribe_gate: StdMutex<Option<Arc<Notify>>>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// The next `count` dials fail.
        pub fn fail_next(&self, count: u32) {
            self.failures_left.store(count, Ordering::SeqCst);
        }

        pub fn reject_handshakes(&self, reject: bool) {
            self.reject_handshake.store(reject, Ordering::SeqCst);
        }

        /// `heart-beat` header answered in CONNECTED; defaults to `0,0`.
        pub fn server_heartbeat(&self, header: &str) {
            if let Ok(mut slot) = self.server_heartbeat.lock() {
                *slot = Some(header.to_string());
            }
        }

        /// SUBSCRIBE frames on transports created from now on wait for a
        /// permit on the returned gate before they go out.
        pub fn hold_subscriptions(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            if let Ok(mut slot) = self.subscribe_gate.lock() {
                *slot = Some(gate.clone());
            }
            gate
        }

        pub fn created(&self) -> Vec<Arc<MockTransport>> {
            self.created.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn latest(&self) -> Option<Arc<MockTransport>> {
            self.created().last().cloned()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let pending_failure = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if pending_failure {
                return Err(anyhow::anyhow!("dial refused"));
            }

            let (tx, rx) = mpsc::channel(64);
            let transport = Arc::new(MockTransport {
                events: tx.clone(),
                sent: StdMutex::new(Vec::new()),
                decoder: StdMutex::new(StompDecoder::new()),
                closed: AtomicBool::new(false),
                heartbeats: AtomicU32::new(0),
                reject_handshake: self.reject_handshake.load(Ordering::SeqCst),
                server_heartbeat: self
                    .server_heartbeat
                    .lock()
                    .ok()
                    .and_then(|h| h.clone())
                    .unwrap_or_else(|| "0,0".to_string()),
                subscribe_gate: self.subscribe_gate.lock().ok().and_then(|g| g.clone()),
                holding_subscribe: AtomicBool::new(false),
            });
            if let Ok(mut created) = self.created.lock() {
                created.push(transport.clone());
            }
            let _ = tx.send(TransportEvent::Connected).await;
            Ok((transport, rx))
        }
    }
}
