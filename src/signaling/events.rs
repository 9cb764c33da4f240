//! Wire events exchanged with the signaling service
//!
//! Every frame is a JSON text message with an `event` name, a `data`
//! payload, and an optional `ack` correlation id. Ack replies come back on
//! the reserved `ack` event carrying a success envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Event names, node -> service
pub const EV_SIGN_UP: &str = "sign_up";
pub const EV_SIGN_IN: &str = "sign_in";
pub const EV_DEVICE_UPDATE: &str = "device_update";
pub const EV_HASH_VERIFY: &str = "hash_verify";
pub const EV_HASH_EMPTY: &str = "hash_empty";
pub const EV_COMMAND_ACK: &str = "command_ack";
pub const EV_COMMAND_VERIFY: &str = "command_verify";
pub const EV_FRAGMENT_STATUS: &str = "fragment_status";
pub const EV_PEER_STATS: &str = "peer_stats";

// Event names, both directions
pub const EV_OFFER: &str = "offer";
pub const EV_ANSWER: &str = "answer";
pub const EV_ICE_CANDIDATE: &str = "ice_candidate";

// Event names, service -> node
pub const EV_COMMAND: &str = "command";
pub const EV_CLIENT_REQUEST_STATS: &str = "client_request_stats";
pub const EV_ACK: &str = "ack";

/// Outer frame for every signaling message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

/// Request/ack response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sign-in credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInPayload {
    pub id: String,
    pub auth_token: String,
}

/// Credentials issued by a successful sign-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub id: String,
    pub auth_token: String,
}

/// SDP offer relayed through the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub remote_id: String,
    pub sdp: String,
}

/// SDP answer relayed through the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub remote_id: String,
    pub sdp: String,
}

/// Trickle ICE candidate relayed through the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub remote_id: String,
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// A delete/download instruction from the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub payload: Vec<String>,
}

/// Transfer progress/terminal report for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentStatusPayload {
    pub peer_id: String,
    pub session_id: String,
    pub fragment_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_sec: Option<u64>,
}

/// One fragment id/hash pair for inventory verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHash {
    pub fragment_id: String,
    pub hash: String,
}

/// One chunk of the startup inventory report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashVerifyPayload {
    pub index: usize,
    pub total: usize,
    pub resources: Vec<ResourceHash>,
}

/// Inventory entries per hash_verify chunk
pub const HASH_VERIFY_CHUNK: usize = 5;

/// Partition the inventory into hash_verify chunks.
///
/// `index` is the offset of the chunk's first entry; `total` the number of
/// chunks overall.
pub fn hash_verify_chunks(resources: Vec<ResourceHash>) -> Vec<HashVerifyPayload> {
    let total = resources.len().div_ceil(HASH_VERIFY_CHUNK);
    resources
        .chunks(HASH_VERIFY_CHUNK)
        .enumerate()
        .map(|(i, chunk)| HashVerifyPayload {
            index: i * HASH_VERIFY_CHUNK,
            total,
            resources: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope {
            event: EV_SIGN_IN.into(),
            data: serde_json::json!({"id": "n1", "auth_token": "t"}),
            ack: Some(7),
        };
        let raw = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.event, "sign_in");
        assert_eq!(parsed.ack, Some(7));
    }

    #[test]
    fn test_ack_omitted_when_absent() {
        let env = Envelope {
            event: EV_HASH_EMPTY.into(),
            data: Value::Null,
            ack: None,
        };
        let raw = serde_json::to_string(&env).unwrap();
        assert!(!raw.contains("ack"));
    }

    #[test]
    fn test_hash_verify_chunking() {
        let resources: Vec<ResourceHash> = (0..12)
            .map(|i| ResourceHash {
                fragment_id: format!("frag-{i}"),
                hash: "00".repeat(32),
            })
            .collect();

        let chunks = hash_verify_chunks(resources);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 5);
        assert_eq!(chunks[2].index, 10);
        assert_eq!(chunks[2].resources.len(), 2);
        assert!(chunks.iter().all(|c| c.total == 3));
    }

    #[test]
    fn test_hash_verify_chunking_empty() {
        assert!(hash_verify_chunks(vec![]).is_empty());
    }
}
