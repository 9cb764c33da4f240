//! Peer Module - session lifecycle, data-channel protocol, and streaming
//!
//! One session per remote peer id, owned exclusively by the
//! [`PeerSessionManager`]. Signaling events feed the session state machine;
//! data-channel control messages start and cancel fragment transfers; the
//! inactivity watchdog and stats sampler run alongside each session.

mod manager;
pub mod protocol;
mod session;
pub mod stats;
mod streamer;

pub use manager::PeerSessionManager;
pub use protocol::{ControlMessage, CHUNK_SIZE};
pub use session::{PeerState, TransferHandle, TransferStatus};
pub use stats::PeerStatsSample;

use std::time::Duration;
use thiserror::Error;

/// A peer with no traffic for this long is torn down
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the global sweeper that catches peers whose timer never armed
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Transport stats sampling cadence per peer
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("no session for peer {0}")]
    SessionNotFound(String),

    #[error("session id must be 1..=255 ASCII bytes, got {0}")]
    InvalidSessionId(usize),

    #[error("malformed chunk frame")]
    MalformedFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
