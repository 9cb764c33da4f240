//! Peer session manager
//!
//! Owns every peer session and is the only writer of the peer map. Signaling
//! events (offer/answer/ICE) drive the per-peer state machine; data-channel
//! messages start and cancel transfers; two watchdog mechanisms (a per-peer
//! single-shot timer and a global sweeper) reap silent peers.

use super::protocol::ControlMessage;
use super::session::{PeerSession, PeerState, SessionEvent};
use super::stats::{self, PeerStatsSample};
use super::streamer::{self, RtcChunkChannel, TransferRequest};
use super::{PeerError, INACTIVITY_TIMEOUT, STATS_INTERVAL, SWEEP_INTERVAL};
use crate::config::WebRtcConfig;
use crate::signaling::events::{
    AnswerPayload, IceCandidatePayload, OfferPayload, EV_ANSWER, EV_ICE_CANDIDATE, EV_OFFER,
    EV_PEER_STATS,
};
use crate::signaling::SignalingClient;
use crate::storage::FragmentIndex;
use crate::system::MemoryStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the fragment data channel created by the offering side
const DATA_CHANNEL_LABEL: &str = "fragments";

/// Manages the lifecycle of all remote peers
pub struct PeerSessionManager {
    inner: Arc<Inner>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

struct Inner {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    peers: Mutex<HashMap<String, PeerSession>>,
    index: Arc<FragmentIndex>,
    signaling: SignalingClient,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerSessionManager {
    pub fn new(
        webrtc_config: &WebRtcConfig,
        index: Arc<FragmentIndex>,
        signaling: SignalingClient,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(
            webrtc::interceptor::registry::Registry::new(),
            &mut media_engine,
        )?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                api,
                ice_servers: ice_servers_from(webrtc_config),
                peers: Mutex::new(HashMap::new()),
                index,
                signaling,
                events_tx,
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// Spawn the manager's housekeeping tasks: the session event loop and
    /// the global inactivity sweeper.
    pub fn start(&self) {
        if let Some(events_rx) = self.events_rx.lock().unwrap().take() {
            tokio::spawn(Inner::run_events(self.inner.clone(), events_rx));
            tokio::spawn(Inner::run_sweeper(self.inner.clone()));
        }
    }

    /// Initiate a connection to a remote peer. A duplicate request for a
    /// live session is a no-op.
    pub async fn connect(&self, remote_id: &str) -> Result<(), PeerError> {
        if self.inner.peers.lock().await.contains_key(remote_id) {
            tracing::debug!(peer = %remote_id, "connect: session already exists");
            return Ok(());
        }

        let connection = self.inner.create_session(remote_id).await?;

        // The offering side opens the data channel before negotiating
        let dc = connection
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await?;
        Inner::wire_data_channel(&self.inner, remote_id.to_string(), dc.clone());
        {
            let mut peers = self.inner.peers.lock().await;
            if let Some(session) = peers.get_mut(remote_id) {
                session.data_channel = Some(dc);
                session.state = PeerState::Negotiating;
            }
        }

        let offer = connection.create_offer(None).await?;
        connection.set_local_description(offer.clone()).await?;
        if let Err(err) = self.inner.signaling.emit(
            EV_OFFER,
            &OfferPayload {
                remote_id: remote_id.to_string(),
                sdp: offer.sdp,
            },
        ) {
            tracing::debug!(peer = %remote_id, %err, "offer emit failed");
        }

        Ok(())
    }

    /// Handle a remote offer: create or reuse the session, answer, and emit
    /// the answer. Any failure tears the session down and drops silently.
    pub async fn on_offer(&self, remote_id: &str, sdp: String) {
        if let Err(err) = self.inner.handle_offer(remote_id, sdp).await {
            tracing::warn!(peer = %remote_id, %err, "offer handling failed");
            self.inner.cleanup_peer(remote_id).await;
        }
    }

    /// Handle a remote answer for a session this node initiated
    pub async fn on_answer(&self, remote_id: &str, sdp: String) {
        if let Err(err) = self.inner.handle_answer(remote_id, sdp).await {
            tracing::warn!(peer = %remote_id, %err, "answer dropped");
        }
    }

    /// Apply a trickle ICE candidate. Null or empty candidates are ignored;
    /// candidates that arrive before the remote description are buffered.
    pub async fn on_ice_candidate(&self, payload: IceCandidatePayload) {
        if let Err(err) = self.inner.handle_candidate(&payload).await {
            tracing::warn!(peer = %payload.remote_id, %err, "ice candidate dropped");
        }
    }

    /// Reset the inactivity timer for a peer
    pub async fn update_last_activity(&self, remote_id: &str) {
        self.inner.touch(remote_id).await;
    }

    /// Tear down one peer
    pub async fn disconnect(&self, remote_id: &str) {
        self.inner.cleanup_peer(remote_id).await;
    }

    /// Tear down every peer
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.inner.peers.lock().await.keys().cloned().collect();
        for id in ids {
            self.inner.cleanup_peer(&id).await;
        }
    }

    /// Peers with a live session
    pub async fn connected_peers(&self) -> Vec<String> {
        self.inner.peers.lock().await.keys().cloned().collect()
    }

    /// Publish an immediate stats sample for every live peer, outside the
    /// regular 1 s cadence
    pub async fn publish_stats_now(&self) {
        let targets: Vec<_> = {
            let peers = self.inner.peers.lock().await;
            peers
                .values()
                .map(|s| {
                    (
                        s.remote_id.clone(),
                        s.connection.clone(),
                        s.stats_snapshot.clone(),
                    )
                })
                .collect()
        };

        for (remote_id, connection, snapshot) in targets {
            let sample = stats::collect(&remote_id, &connection, &snapshot).await;
            if let Err(err) = self.inner.signaling.emit(EV_PEER_STATS, &sample) {
                tracing::debug!(%err, "stats publish failed");
            }
        }
    }
}

impl Inner {
    /// Create a peer connection and register the session. The caller holds
    /// no lock; the new entry is inserted before this returns.
    async fn create_session(
        self: &Arc<Self>,
        remote_id: &str,
    ) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await?);

        self.install_connection_handlers(remote_id.to_string(), &connection);

        let mut session = PeerSession::new(remote_id.to_string(), connection.clone());
        session.stats_task = Some(self.spawn_stats(
            remote_id.to_string(),
            connection.clone(),
            session.stats_snapshot.clone(),
        ));
        self.arm_timer(&mut session);

        self.peers
            .lock()
            .await
            .insert(remote_id.to_string(), session);
        tracing::info!(peer = %remote_id, "peer session created");

        Ok(connection)
    }

    fn install_connection_handlers(
        self: &Arc<Self>,
        remote_id: String,
        connection: &Arc<RTCPeerConnection>,
    ) {
        let inner = self.clone();
        let peer = remote_id.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let inner = inner.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            tracing::info!(peer = %peer, "transport connected");
                            inner.set_state(&peer, PeerState::Connected).await;
                            inner.touch(&peer).await;
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            tracing::info!(peer = %peer, ?state, "transport terminal");
                            inner.cleanup_peer(&peer).await;
                        }
                        RTCPeerConnectionState::Disconnected => {
                            // Transient; ICE may recover. The watchdog reaps
                            // the peer if traffic never resumes.
                            tracing::warn!(peer = %peer, "transport disconnected");
                        }
                        _ => {}
                    }
                })
            },
        ));

        let inner = self.clone();
        let peer = remote_id.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let inner = inner.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let payload = IceCandidatePayload {
                            remote_id: peer.clone(),
                            candidate: Some(json.candidate),
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };
                        if let Err(err) = inner.signaling.emit(EV_ICE_CANDIDATE, &payload) {
                            tracing::debug!(%err, "ice candidate emit failed");
                        }
                    }
                    Err(err) => tracing::warn!(peer = %peer, %err, "candidate serialization"),
                }
            })
        }));

        let inner = self.clone();
        let peer = remote_id;
        connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let inner = inner.clone();
            let peer = peer.clone();
            Box::pin(async move {
                tracing::debug!(peer = %peer, label = dc.label(), "remote data channel");
                Inner::wire_data_channel(&inner, peer.clone(), dc.clone());
                let mut peers = inner.peers.lock().await;
                if let Some(session) = peers.get_mut(&peer) {
                    session.data_channel = Some(dc);
                }
            })
        }));
    }

    /// Attach open/message handlers to a data channel (either side)
    fn wire_data_channel(inner: &Arc<Self>, remote_id: String, dc: Arc<RTCDataChannel>) {
        let on_open_inner = inner.clone();
        let on_open_peer = remote_id.clone();
        dc.on_open(Box::new(move || {
            let inner = on_open_inner.clone();
            let peer = on_open_peer.clone();
            Box::pin(async move {
                tracing::info!(peer = %peer, "data channel open");
                inner.set_state(&peer, PeerState::Ready).await;
                inner.touch(&peer).await;
            })
        }));

        let inner = inner.clone();
        let dc_handle = dc.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inner = inner.clone();
            let peer = remote_id.clone();
            let dc = dc_handle.clone();
            Box::pin(async move {
                inner.touch(&peer).await;

                if !msg.is_string {
                    tracing::debug!(peer = %peer, "ignoring binary frame from peer");
                    return;
                }
                let text = String::from_utf8_lossy(&msg.data);
                match ControlMessage::parse(&text) {
                    Ok(ControlMessage::ReadyNode {
                        fragment_id,
                        session_id,
                    }) => {
                        tracing::info!(
                            peer = %peer,
                            fragment = %fragment_id,
                            session = %session_id,
                            "transfer requested"
                        );
                        let request = TransferRequest {
                            peer_id: peer.clone(),
                            fragment_id,
                            session_id,
                        };
                        tokio::spawn(streamer::run_transfer(
                            request,
                            RtcChunkChannel(dc.clone()),
                            inner.index.clone(),
                            inner.signaling.clone(),
                            inner.events_tx.clone(),
                            MemoryStatus::sample,
                        ));
                    }
                    Ok(ControlMessage::Canceled { session_id, .. }) => {
                        inner.cancel_transfer(&peer, &session_id).await;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, %err, "unknown control message ignored");
                    }
                }
            })
        }));
    }

    async fn handle_offer(self: &Arc<Self>, remote_id: &str, sdp: String) -> Result<(), PeerError> {
        let existing = {
            let peers = self.peers.lock().await;
            peers.get(remote_id).map(|s| s.state)
        };

        let connection = match existing {
            // Glare: answer on the session still negotiating
            Some(PeerState::New) | Some(PeerState::Negotiating) => {
                let peers = self.peers.lock().await;
                peers
                    .get(remote_id)
                    .map(|s| s.connection.clone())
                    .ok_or_else(|| PeerError::SessionNotFound(remote_id.to_string()))?
            }
            // A live or closing session must fully close before a new offer
            // is accepted
            Some(state) => {
                tracing::warn!(peer = %remote_id, ?state, "offer ignored, session busy");
                return Ok(());
            }
            None => self.create_session(remote_id).await?,
        };

        self.set_state(remote_id, PeerState::Negotiating).await;

        let offer = RTCSessionDescription::offer(sdp)?;
        connection.set_remote_description(offer).await?;
        self.drain_pending_candidates(remote_id, &connection).await;

        let answer = connection.create_answer(None).await?;
        connection.set_local_description(answer.clone()).await?;

        self.signaling
            .emit(
                EV_ANSWER,
                &AnswerPayload {
                    remote_id: remote_id.to_string(),
                    sdp: answer.sdp,
                },
            )
            .ok();

        self.touch(remote_id).await;
        Ok(())
    }

    async fn handle_answer(
        self: &Arc<Self>,
        remote_id: &str,
        sdp: String,
    ) -> Result<(), PeerError> {
        let connection = {
            let peers = self.peers.lock().await;
            peers
                .get(remote_id)
                .map(|s| s.connection.clone())
                .ok_or_else(|| PeerError::SessionNotFound(remote_id.to_string()))?
        };

        let answer = RTCSessionDescription::answer(sdp)?;
        connection.set_remote_description(answer).await?;
        self.drain_pending_candidates(remote_id, &connection).await;
        self.touch(remote_id).await;
        Ok(())
    }

    async fn handle_candidate(
        self: &Arc<Self>,
        payload: &IceCandidatePayload,
    ) -> Result<(), PeerError> {
        let candidate = match payload.candidate.as_deref() {
            Some(candidate) if !candidate.is_empty() => candidate.to_string(),
            // End-of-candidates markers are expected and ignored
            _ => return Ok(()),
        };

        let connection = {
            let peers = self.peers.lock().await;
            peers
                .get(&payload.remote_id)
                .map(|s| s.connection.clone())
                .ok_or_else(|| PeerError::SessionNotFound(payload.remote_id.clone()))?
        };

        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: payload.sdp_mid.clone(),
            sdp_mline_index: payload.sdp_mline_index,
            ..Default::default()
        };

        if connection.remote_description().await.is_some() {
            connection.add_ice_candidate(init).await?;
        } else {
            let mut peers = self.peers.lock().await;
            if let Some(session) = peers.get_mut(&payload.remote_id) {
                session.pending_candidates.push(init);
            }
        }

        self.touch(&payload.remote_id).await;
        Ok(())
    }

    /// Apply candidates buffered before the remote description was set
    async fn drain_pending_candidates(
        self: &Arc<Self>,
        remote_id: &str,
        connection: &Arc<RTCPeerConnection>,
    ) {
        let pending = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(remote_id) {
                Some(session) => std::mem::take(&mut session.pending_candidates),
                None => return,
            }
        };
        for init in pending {
            if let Err(err) = connection.add_ice_candidate(init).await {
                tracing::warn!(peer = %remote_id, %err, "buffered candidate rejected");
            }
        }
    }

    async fn set_state(self: &Arc<Self>, remote_id: &str, state: PeerState) {
        let mut peers = self.peers.lock().await;
        if let Some(session) = peers.get_mut(remote_id) {
            session.state = state;
        }
    }

    /// Record activity and rearm the single-shot inactivity timer
    async fn touch(self: &Arc<Self>, remote_id: &str) {
        let mut peers = self.peers.lock().await;
        if let Some(session) = peers.get_mut(remote_id) {
            session.touch();
            self.arm_timer(session);
        }
    }

    fn arm_timer(self: &Arc<Self>, session: &mut PeerSession) {
        if let Some(previous) = session.inactivity_timer.take() {
            previous.abort();
        }
        let inner = self.clone();
        let remote_id = session.remote_id.clone();
        session.inactivity_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(INACTIVITY_TIMEOUT).await;
            tracing::info!(peer = %remote_id, "inactivity timeout");
            // Teardown runs in its own task so aborting this timer handle
            // during cleanup cannot interrupt the teardown itself
            tokio::spawn(async move { inner.cleanup_peer(&remote_id).await });
        }));
    }

    fn spawn_stats(
        self: &Arc<Self>,
        remote_id: String,
        connection: Arc<RTCPeerConnection>,
        snapshot: Arc<std::sync::Mutex<stats::CounterSnapshot>>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = stats::collect(&remote_id, &connection, &snapshot).await;
                if let Err(err) = inner.signaling.emit(EV_PEER_STATS, &sample) {
                    tracing::debug!(%err, "stats publish failed");
                }
            }
        })
    }

    async fn cancel_transfer(self: &Arc<Self>, remote_id: &str, session_id: &str) {
        let peers = self.peers.lock().await;
        match peers.get(remote_id).and_then(|s| s.transfers.get(session_id)) {
            Some(handle) => {
                tracing::info!(peer = %remote_id, session = %session_id, "transfer canceled by peer");
                handle.cancel();
            }
            None => {
                tracing::warn!(peer = %remote_id, session = %session_id, "cancel for unknown session");
            }
        }
    }

    /// Ordered, idempotent teardown of one peer
    async fn cleanup_peer(self: &Arc<Self>, remote_id: &str) {
        let session = self.peers.lock().await.remove(remote_id);
        let Some(mut session) = session else {
            return;
        };
        session.state = PeerState::Closing;

        // 1. Stop the stats ticker and emit the final disconnected sample
        if let Some(task) = session.stats_task.take() {
            task.abort();
        }
        if let Err(err) = self
            .signaling
            .emit(EV_PEER_STATS, &PeerStatsSample::disconnected(remote_id))
        {
            tracing::debug!(%err, "final stats sample not delivered");
        }

        // 2. Cancel every in-flight transfer
        for handle in session.transfers.values() {
            handle.cancel();
        }

        // 3. Clear the inactivity timer
        if let Some(timer) = session.inactivity_timer.take() {
            timer.abort();
        }

        // 4. Close the data channel
        if let Some(dc) = session.data_channel.take() {
            if let Err(err) = dc.close().await {
                tracing::debug!(peer = %remote_id, %err, "data channel close");
            }
        }

        // 5. Close the transport
        if let Err(err) = session.connection.close().await {
            tracing::debug!(peer = %remote_id, %err, "connection close");
        }

        tracing::info!(peer = %remote_id, "peer session removed");
    }

    /// Session event loop: transfer registration/removal and activity
    /// refreshes funnel through here so the manager stays the single writer
    async fn run_events(inner: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Activity { peer_id } => {
                    inner.touch(&peer_id).await;
                }
                SessionEvent::TransferStarted { peer_id, handle } => {
                    let mut peers = inner.peers.lock().await;
                    match peers.get_mut(&peer_id) {
                        Some(session) => {
                            session
                                .transfers
                                .insert(handle.session_id.clone(), handle);
                        }
                        None => {
                            // Peer torn down between READY_NODE and now
                            handle.cancel();
                        }
                    }
                }
                SessionEvent::TransferFinished {
                    peer_id,
                    session_id,
                } => {
                    let mut peers = inner.peers.lock().await;
                    if let Some(session) = peers.get_mut(&peer_id) {
                        session.transfers.remove(&session_id);
                    }
                }
            }
        }
    }

    /// Global sweeper: catches peers whose timer never armed, e.g. sessions
    /// that stalled in negotiation
    async fn run_sweeper(inner: Arc<Self>) {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let stale: Vec<String> = {
                let peers = inner.peers.lock().await;
                peers
                    .iter()
                    .filter(|(_, s)| s.last_activity.elapsed() > INACTIVITY_TIMEOUT)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for remote_id in stale {
                tracing::info!(peer = %remote_id, "sweeper closing silent peer");
                inner.cleanup_peer(&remote_id).await;
            }
        }
    }
}

fn ice_servers_from(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.as_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
