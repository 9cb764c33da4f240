//! Per-peer session state and transfer bookkeeping

use super::stats::CounterSnapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Notifications from streamer tasks and channel callbacks back to the
/// session manager, which owns all peer state
pub(crate) enum SessionEvent {
    /// Traffic or state change for a peer; rearms the inactivity timer
    Activity { peer_id: String },
    /// A transfer passed its pre-flight gates and began streaming
    TransferStarted {
        peer_id: String,
        handle: Arc<TransferHandle>,
    },
    /// A transfer reached a terminal status
    TransferFinished {
        peer_id: String,
        session_id: String,
    },
}

/// Peer connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Offer received or local connect intent
    New,
    /// SDP and ICE in flight
    Negotiating,
    /// Transport ready, waiting for the data channel
    Connected,
    /// Data channel open
    Ready,
    /// Teardown in progress
    Closing,
}

/// Transfer lifecycle. Exactly one terminal state is reached per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::InProgress)
    }

    /// Status token used in fragment_status events
    pub fn as_event(&self) -> &'static str {
        match self {
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Canceled => "CANCELED",
        }
    }
}

/// Shared bookkeeping for one in-flight transfer.
///
/// All fields except `canceled` are written only by the owning streamer
/// task; `canceled` may also be set by the session manager or the remote
/// cancel handler.
pub struct TransferHandle {
    pub fragment_id: String,
    pub session_id: String,
    pub started_at: Instant,
    pub total_bytes: u64,
    sent_bytes: AtomicU64,
    canceled: AtomicBool,
}

impl TransferHandle {
    pub fn new(fragment_id: String, session_id: String, total_bytes: u64) -> Self {
        Self {
            fragment_id,
            session_id,
            started_at: Instant::now(),
            total_bytes,
            sent_bytes: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
        }
    }

    /// Request cooperative cancellation; the in-flight chunk completes first
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    /// Record bytes handed to the transport. Never exceeds `total_bytes`.
    pub fn record_sent(&self, bytes: u64) {
        debug_assert!(self.sent_bytes() + bytes <= self.total_bytes);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// State for one remote peer, owned by the session manager
pub struct PeerSession {
    pub remote_id: String,
    pub state: PeerState,
    pub connection: Arc<RTCPeerConnection>,
    pub data_channel: Option<Arc<RTCDataChannel>>,
    /// ICE candidates that arrived before the remote description was set
    pub pending_candidates: Vec<RTCIceCandidateInit>,
    pub last_activity: Instant,
    /// Single-shot inactivity timer, rearmed on every activity event
    pub inactivity_timer: Option<JoinHandle<()>>,
    pub transfers: HashMap<String, Arc<TransferHandle>>,
    pub stats_task: Option<JoinHandle<()>>,
    /// Previous data-channel counters, shared with the sampler task
    pub stats_snapshot: Arc<Mutex<CounterSnapshot>>,
}

impl PeerSession {
    pub fn new(remote_id: String, connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            remote_id,
            state: PeerState::New,
            connection,
            data_channel: None,
            pending_candidates: Vec::new(),
            last_activity: Instant::now(),
            inactivity_timer: None,
            transfers: HashMap::new(),
            stats_task: None,
            stats_snapshot: Arc::new(Mutex::new(CounterSnapshot::default())),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
