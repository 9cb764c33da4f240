//! P2P Node - storage-node agent for a content distribution network
//!
//! The node advertises capacity to a central signaling service, consumes
//! delete/download commands, and serves cached fragments to remote peers
//! over authenticated WebRTC data channels negotiated through the service.

pub mod config;
pub mod net;
pub mod node;
pub mod origin;
pub mod peer;
pub mod signaling;
pub mod storage;
pub mod system;

use thiserror::Error;

/// Main error type for node operations
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("signaling error: {0}")]
    Signaling(#[from] signaling::SignalingError),

    #[error("peer error: {0}")]
    Peer(#[from] peer::PeerError),

    #[error("origin error: {0}")]
    Origin(#[from] origin::OriginError),

    #[error("no storage available: {0}")]
    NoStorage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
