//! Signaling Module
//!
//! The signaling service is a reliable ordered message bus with request/ack
//! semantics. This module owns the client connection (with server-list
//! failover) and the wire event definitions shared with the service.

mod client;
pub mod events;

pub use client::{ClientDriver, SignalingClient, SignalingEvent};
pub use events::{
    AckPayload, AnswerPayload, CommandPayload, Envelope, FragmentStatusPayload,
    HashVerifyPayload, IceCandidatePayload, OfferPayload, ResourceHash, SignInPayload,
    SignUpResponse,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("all signaling servers exhausted")]
    ServersExhausted,

    #[error("signaling request timed out")]
    AckTimeout,

    #[error("signaling request rejected: {0}")]
    Rejected(String),

    #[error("signaling connection closed")]
    ConnectionClosed,

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("invalid signaling server url: {0}")]
    InvalidServer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
