//! Signaling client
//!
//! One WebSocket at a time against the configured server list. Outbound
//! emits are fire-and-forget channel sends so any task may emit
//! concurrently; request/ack calls correlate replies through a pending map.
//! A full pass over the server list with no successful connection is fatal.

use super::events::{self, AckPayload, Envelope};
use super::SignalingError;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Delay before advancing to the next server after a connect error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Events surfaced to the node's dispatch loop
#[derive(Debug)]
pub enum SignalingEvent {
    /// A connection was (re)established; the node must sign in again and
    /// restart its device update ticker.
    Connected { server: String },
    Offer(events::OfferPayload),
    Answer(events::AnswerPayload),
    IceCandidate(events::IceCandidatePayload),
    Command(events::CommandPayload),
    /// The service asked for an immediate stats sample of every peer
    StatsRequested,
}

struct Shared {
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>,
    next_ack: AtomicU64,
}

impl Shared {
    fn register_ack(&self) -> (u64, oneshot::Receiver<AckPayload>) {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn resolve_ack(&self, id: u64, payload: AckPayload) {
        if let Some(tx) = self.pending_acks.lock().unwrap().remove(&id) {
            let _ = tx.send(payload);
        }
    }

    fn drop_ack(&self, id: u64) {
        self.pending_acks.lock().unwrap().remove(&id);
    }

    /// Fail every in-flight request when the connection drops
    fn fail_pending(&self) {
        self.pending_acks.lock().unwrap().clear();
    }
}

/// Handle used by the rest of the node to emit signaling events.
/// Cheap to clone; safe to use from any task.
#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl SignalingClient {
    /// Create a client handle and the driver that owns the connection.
    /// The driver must be spawned; it resolves only with a fatal error.
    pub fn new(
        servers: Vec<String>,
        event_tx: mpsc::UnboundedSender<SignalingEvent>,
    ) -> (Self, ClientDriver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending_acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
        });

        let client = Self {
            outbound: outbound_tx,
            shared: shared.clone(),
        };
        let driver = ClientDriver {
            servers,
            outbound_rx,
            shared,
            event_tx,
        };
        (client, driver)
    }

    /// Fire-and-forget emit
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), SignalingError> {
        self.send_envelope(event, payload, None)
    }

    /// Request/ack emit. The ack envelope is returned for the caller to
    /// inspect; a missing reply within `timeout` is an error.
    pub async fn emit_with_ack<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<AckPayload, SignalingError> {
        let (id, rx) = self.shared.register_ack();
        if let Err(err) = self.send_envelope(event, payload, Some(id)) {
            self.shared.drop_ack(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SignalingError::ConnectionClosed),
            Err(_) => {
                self.shared.drop_ack(id);
                Err(SignalingError::AckTimeout)
            }
        }
    }

    /// Client wired to a bare channel, for exercising emitters in tests
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let client = Self {
            outbound: outbound_tx,
            shared: Arc::new(Shared {
                pending_acks: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(1),
            }),
        };
        (client, outbound_rx)
    }

    fn send_envelope<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
        ack: Option<u64>,
    ) -> Result<(), SignalingError> {
        let envelope = Envelope {
            event: event.to_string(),
            data: serde_json::to_value(payload)?,
            ack,
        };
        let text = serde_json::to_string(&envelope)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| SignalingError::ConnectionClosed)
    }
}

/// Owns the WebSocket connection and the server-list failover policy
pub struct ClientDriver {
    servers: Vec<String>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
}

impl ClientDriver {
    /// Run until the server list is exhausted without a single successful
    /// connection in a full pass. The returned error is fatal.
    pub async fn run(mut self) -> SignalingError {
        loop {
            let mut connected_this_pass = false;

            for server in self.servers.clone() {
                let url = match ws_url(&server) {
                    Ok(url) => url,
                    Err(err) => {
                        tracing::error!(%server, %err, "invalid signaling server");
                        continue;
                    }
                };

                match tokio_tungstenite::connect_async(url).await {
                    Ok((ws, _)) => {
                        tracing::info!(%server, "signaling connected");
                        connected_this_pass = true;
                        let _ = self
                            .event_tx
                            .send(SignalingEvent::Connected {
                                server: server.clone(),
                            });

                        if let Err(err) = self.drive(ws).await {
                            tracing::warn!(%server, %err, "signaling connection lost");
                        }
                        self.shared.fail_pending();
                    }
                    Err(err) => {
                        tracing::warn!(%server, %err, "signaling connect error");
                    }
                }

                tokio::time::sleep(RECONNECT_DELAY).await;
            }

            if !connected_this_pass {
                tracing::error!("no signaling server reachable");
                return SignalingError::ServersExhausted;
            }
        }
    }

    async fn drive(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<(), SignalingError> {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(message) => sink
                            .send(message)
                            .await
                            .map_err(|e| SignalingError::Transport(e.to_string()))?,
                        None => return Ok(()),
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => sink
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| SignalingError::Transport(e.to_string()))?,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SignalingError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            return Err(SignalingError::Transport(err.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(%err, "unparseable signaling frame");
                return;
            }
        };

        let forward = |event: SignalingEvent| {
            let _ = self.event_tx.send(event);
        };

        match envelope.event.as_str() {
            events::EV_ACK => {
                let Some(id) = envelope.ack else {
                    tracing::warn!("ack frame without correlation id");
                    return;
                };
                match serde_json::from_value::<AckPayload>(envelope.data) {
                    Ok(payload) => self.shared.resolve_ack(id, payload),
                    Err(err) => tracing::warn!(%err, "malformed ack payload"),
                }
            }
            events::EV_OFFER => match serde_json::from_value(envelope.data) {
                Ok(payload) => forward(SignalingEvent::Offer(payload)),
                Err(err) => tracing::warn!(%err, "malformed offer"),
            },
            events::EV_ANSWER => match serde_json::from_value(envelope.data) {
                Ok(payload) => forward(SignalingEvent::Answer(payload)),
                Err(err) => tracing::warn!(%err, "malformed answer"),
            },
            events::EV_ICE_CANDIDATE => match serde_json::from_value(envelope.data) {
                Ok(payload) => forward(SignalingEvent::IceCandidate(payload)),
                Err(err) => tracing::warn!(%err, "malformed ice candidate"),
            },
            events::EV_COMMAND => match serde_json::from_value(envelope.data) {
                Ok(payload) => forward(SignalingEvent::Command(payload)),
                Err(err) => tracing::warn!(%err, "malformed command"),
            },
            events::EV_CLIENT_REQUEST_STATS => forward(SignalingEvent::StatsRequested),
            other => {
                tracing::debug!(event = other, "ignoring unknown signaling event");
            }
        }
    }
}

/// Convert a configured http(s) server URL into its ws(s) form
fn ws_url(server: &str) -> Result<String, SignalingError> {
    let mut url = url::Url::parse(server)
        .map_err(|_| SignalingError::InvalidServer(server.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(SignalingError::InvalidServer(server.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidServer(server.to_string()))?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_conversion() {
        assert_eq!(ws_url("http://host:3000").unwrap(), "ws://host:3000/");
        assert_eq!(ws_url("https://host:3000").unwrap(), "wss://host:3000/");
        assert!(ws_url("ftp://host").is_err());
        assert!(ws_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_ack_resolution() {
        let shared = Shared {
            pending_acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
        };

        let (id, rx) = shared.register_ack();
        shared.resolve_ack(
            id,
            AckPayload {
                success: true,
                data: None,
                error: None,
            },
        );
        let ack = rx.await.unwrap();
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_pending_acks_fail_on_disconnect() {
        let shared = Shared {
            pending_acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
        };

        let (_, rx) = shared.register_ack();
        shared.fail_pending();
        // Sender dropped; the waiter observes a closed channel
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_emit_with_ack_times_out() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (client, _driver) = SignalingClient::new(vec![], event_tx);

        let result = client
            .emit_with_ack(
                events::EV_SIGN_IN,
                &serde_json::json!({}),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(SignalingError::AckTimeout)));
    }
}
