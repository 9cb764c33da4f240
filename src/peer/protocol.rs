//! Data-channel wire protocol
//!
//! The channel is ordered and reliable. Control messages are UTF-8 JSON text
//! frames; fragment data flows as binary frames:
//!
//! ```text
//! byte 0        : session_id length L (1..255)
//! byte 1        : last-chunk flag     (0 or 1)
//! bytes 2..2+L  : session_id (ASCII)
//! bytes 2+L..   : payload (<= CHUNK_SIZE)
//! ```
//!
//! There is no in-band payload length; receivers take the frame remainder.

use super::PeerError;
use serde::{Deserialize, Serialize};

/// Fragment chunk payload size
pub const CHUNK_SIZE: usize = 53 * 1024;

/// Buffered-bytes level above which the streamer pauses reads
pub const MAX_BUFFER_THRESHOLD: usize = CHUNK_SIZE * 5;

/// Buffered-bytes level the streamer waits for before resuming
pub const DRAIN_TARGET: usize = CHUNK_SIZE;

/// Poll cadence while waiting for the send buffer to drain
pub const THROTTLE_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// Buffered-bytes level that counts as memory pressure at transfer start
pub const PRESSURE_BUFFERED_BYTES: usize = 10 * 1024 * 1024;

/// Control messages exchanged as JSON text frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Remote requests streaming of a fragment under a session id
    #[serde(rename = "READY_NODE")]
    ReadyNode {
        fragment_id: String,
        session_id: String,
    },

    /// Either side aborts a transfer
    #[serde(rename = "CANCELED")]
    Canceled {
        session_id: String,
        fragment_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlMessage {
    /// Parse an inbound text frame. Unknown `type` values fail here and are
    /// logged and ignored by the caller.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A decoded chunk frame, borrowing from the wire buffer
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub session_id: &'a str,
    pub last: bool,
    pub payload: &'a [u8],
}

/// Frame one fragment chunk for the wire
pub fn encode_chunk_frame(
    session_id: &str,
    last: bool,
    payload: &[u8],
) -> Result<Vec<u8>, PeerError> {
    let id = session_id.as_bytes();
    if id.is_empty() || id.len() > 255 {
        return Err(PeerError::InvalidSessionId(id.len()));
    }

    let mut frame = Vec::with_capacity(2 + id.len() + payload.len());
    frame.push(id.len() as u8);
    frame.push(u8::from(last));
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a chunk frame received from the wire
pub fn decode_chunk_frame(frame: &[u8]) -> Result<ChunkFrame<'_>, PeerError> {
    if frame.len() < 2 {
        return Err(PeerError::MalformedFrame);
    }
    let id_len = frame[0] as usize;
    if id_len == 0 || frame.len() < 2 + id_len {
        return Err(PeerError::MalformedFrame);
    }
    let last = match frame[1] {
        0 => false,
        1 => true,
        _ => return Err(PeerError::MalformedFrame),
    };
    let session_id =
        std::str::from_utf8(&frame[2..2 + id_len]).map_err(|_| PeerError::MalformedFrame)?;

    Ok(ChunkFrame {
        session_id,
        last,
        payload: &frame[2 + id_len..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_chunk_frame("S1", false, b"payload bytes").unwrap();
        let decoded = decode_chunk_frame(&frame).unwrap();

        assert_eq!(decoded.session_id, "S1");
        assert!(!decoded.last);
        assert_eq!(decoded.payload, b"payload bytes");
    }

    #[test]
    fn test_last_chunk_flag() {
        let frame = encode_chunk_frame("session-abc", true, &[0xAB; 16]).unwrap();
        assert_eq!(frame[0], 11);
        assert_eq!(frame[1], 1);
        let decoded = decode_chunk_frame(&frame).unwrap();
        assert!(decoded.last);
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = encode_chunk_frame("S", true, &[]).unwrap();
        let decoded = decode_chunk_frame(&frame).unwrap();
        assert!(decoded.payload.is_empty());
        assert!(decoded.last);
    }

    #[test]
    fn test_session_id_length_limits() {
        assert!(matches!(
            encode_chunk_frame("", false, b"x"),
            Err(PeerError::InvalidSessionId(0))
        ));
        let long = "a".repeat(256);
        assert!(encode_chunk_frame(&long, false, b"x").is_err());
        let max = "a".repeat(255);
        assert!(encode_chunk_frame(&max, false, b"x").is_ok());
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode_chunk_frame(&[]).is_err());
        assert!(decode_chunk_frame(&[5]).is_err());
        // Declared id length exceeds the frame
        assert!(decode_chunk_frame(&[10, 0, b'a', b'b']).is_err());
        // Flag byte outside {0, 1}
        assert!(decode_chunk_frame(&[1, 2, b'a']).is_err());
        // Zero-length session id
        assert!(decode_chunk_frame(&[0, 0, b'a']).is_err());
    }

    #[test]
    fn test_frames_concatenate_to_fragment() {
        let fragment: Vec<u8> = (0..=255u8).cycle().take(3 * CHUNK_SIZE + 100).collect();
        let mut sent = 0usize;
        let mut rebuilt = Vec::new();
        let mut frames = 0;

        while sent < fragment.len() {
            let end = (sent + CHUNK_SIZE).min(fragment.len());
            let last = end == fragment.len();
            let frame = encode_chunk_frame("S9", last, &fragment[sent..end]).unwrap();
            let decoded = decode_chunk_frame(&frame).unwrap();

            assert_eq!(decoded.session_id, "S9");
            assert_eq!(decoded.last, last);
            rebuilt.extend_from_slice(decoded.payload);
            sent = end;
            frames += 1;
        }

        assert_eq!(frames, 4);
        assert_eq!(rebuilt, fragment);
    }

    #[test]
    fn test_ready_node_parse() {
        let msg = ControlMessage::parse(
            r#"{"type": "READY_NODE", "fragment_id": "F1", "session_id": "S1"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ControlMessage::ReadyNode { ref fragment_id, ref session_id }
                if fragment_id == "F1" && session_id == "S1"
        ));
    }

    #[test]
    fn test_canceled_parse_with_optional_error() {
        let msg = ControlMessage::parse(
            r#"{"type": "CANCELED", "session_id": "S1", "fragment_id": "F1"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ControlMessage::Canceled { error: None, .. }));

        let msg = ControlMessage::parse(
            r#"{"type": "CANCELED", "session_id": "S1", "fragment_id": "F1", "error": "LOW_MEMORY"}"#,
        )
        .unwrap();
        assert!(
            matches!(msg, ControlMessage::Canceled { error: Some(ref e), .. } if e == "LOW_MEMORY")
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ControlMessage::parse(r#"{"type": "PING"}"#).is_err());
        assert!(ControlMessage::parse("not json").is_err());
    }
}
