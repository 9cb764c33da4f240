//! Per-peer transport telemetry
//!
//! Once per second the sampler reads the connection's stats report and
//! derives round-trip time, data-channel byte rates (deltas against the
//! previous sample), and the discovered candidate endpoints bucketed into
//! public and private addresses.

use crate::net::{self, IpKind, IpVersion};
use serde::Serialize;
use std::sync::Mutex;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Data-channel counters carried between samples for delta computation
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One telemetry sample published to the signaling service
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatsSample {
    pub peer_id: String,
    /// Sample time, Unix milliseconds
    pub timestamp: i64,
    /// Selected candidate-pair RTT in milliseconds, -1 when unavailable
    pub rtt: f64,
    #[serde(rename = "bytesSent")]
    pub bytes_sent: u64,
    #[serde(rename = "bytesReceived")]
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_private_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_private_ipv4: Option<String>,
    #[serde(rename = "isDisconnected")]
    pub is_disconnected: bool,
}

impl PeerStatsSample {
    fn empty(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            rtt: -1.0,
            bytes_sent: 0,
            bytes_received: 0,
            local_ipv4: None,
            local_ipv6: None,
            local_private_ipv4: None,
            remote_ipv4: None,
            remote_ipv6: None,
            remote_private_ipv4: None,
            is_disconnected: false,
        }
    }

    /// The final sample emitted after teardown
    pub fn disconnected(peer_id: &str) -> Self {
        let mut sample = Self::empty(peer_id);
        sample.is_disconnected = true;
        sample
    }
}

/// Collect one sample from the connection's stats report
pub async fn collect(
    peer_id: &str,
    connection: &RTCPeerConnection,
    previous: &Mutex<CounterSnapshot>,
) -> PeerStatsSample {
    let mut sample = PeerStatsSample::empty(peer_id);
    let report = connection.get_stats().await;

    let mut current = CounterSnapshot::default();

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) => {
                if pair.nominated && pair.current_round_trip_time > 0.0 {
                    sample.rtt = pair.current_round_trip_time * 1000.0;
                }
            }
            StatsReportType::LocalCandidate(candidate) => {
                assign_endpoint(&mut sample, &candidate.ip, true);
            }
            StatsReportType::RemoteCandidate(candidate) => {
                assign_endpoint(&mut sample, &candidate.ip, false);
            }
            StatsReportType::DataChannel(channel) => {
                current.bytes_sent += channel.bytes_sent as u64;
                current.bytes_received += channel.bytes_received as u64;
            }
            _ => {}
        }
    }

    let mut prev = previous.lock().unwrap();
    sample.bytes_sent = current.bytes_sent.saturating_sub(prev.bytes_sent);
    sample.bytes_received = current.bytes_received.saturating_sub(prev.bytes_received);
    *prev = current;

    sample
}

/// Bucket one candidate address into the sample's endpoint fields.
/// First discovery wins per bucket; private v6 folds into the v6 field.
pub(crate) fn assign_endpoint(sample: &mut PeerStatsSample, ip: &str, local: bool) {
    let Some(class) = net::classify(ip) else {
        return;
    };

    let slot = match (local, class.version, class.kind) {
        (true, IpVersion::V4, IpKind::Public) => &mut sample.local_ipv4,
        (true, IpVersion::V4, IpKind::Private) => &mut sample.local_private_ipv4,
        (true, IpVersion::V6, _) => &mut sample.local_ipv6,
        (false, IpVersion::V4, IpKind::Public) => &mut sample.remote_ipv4,
        (false, IpVersion::V4, IpKind::Private) => &mut sample.remote_private_ipv4,
        (false, IpVersion::V6, _) => &mut sample.remote_ipv6,
    };
    if slot.is_none() {
        *slot = Some(ip.to_string());
    }
}
