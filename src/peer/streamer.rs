//! Fragment streamer
//!
//! One streamer task per READY_NODE request. Pre-flight gates check the
//! fragment index, the channel state, and host memory; the streaming loop
//! reads the file chunk by chunk, pausing while the channel's send buffer is
//! above the throttle threshold and aborting when the drain deadline lapses.

use super::protocol::{
    self, ControlMessage, CHUNK_SIZE, DRAIN_TARGET, MAX_BUFFER_THRESHOLD,
    PRESSURE_BUFFERED_BYTES, THROTTLE_CHECK_INTERVAL,
};
use super::session::{SessionEvent, TransferHandle, TransferStatus};
use super::PeerError;
use crate::signaling::events::{FragmentStatusPayload, EV_FRAGMENT_STATUS};
use crate::signaling::SignalingClient;
use crate::storage::FragmentIndex;
use crate::system::MemoryStatus;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Cadence of activity refreshes while a transfer is streaming, so the
/// inactivity watchdog does not reap a busy peer
const ACTIVITY_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Error reported when the drain deadline lapses
const THROTTLED_ERROR: &str = "Transfer throttled too long";

// Pre-flight and progress status tokens for fragment_status events
const STATUS_STARTING: &str = "STARTING";
const STATUS_FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
const STATUS_DATA_CHANNEL_CLOSED: &str = "DATA_CHANNEL_CLOSED";
const STATUS_LOW_MEMORY: &str = "LOW_MEMORY";

/// The streamer's view of the outbound channel. Concrete sessions use the
/// WebRTC data channel; tests substitute a scripted transport.
pub(crate) trait ChunkChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn buffered(&self) -> usize;
    async fn send_chunk(&self, frame: Vec<u8>) -> Result<(), PeerError>;
    async fn send_control(&self, text: String) -> Result<(), PeerError>;
}

/// WebRTC-backed channel used by live sessions
pub(crate) struct RtcChunkChannel(pub Arc<RTCDataChannel>);

impl ChunkChannel for RtcChunkChannel {
    fn is_open(&self) -> bool {
        self.0.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered(&self) -> usize {
        self.0.buffered_amount().await
    }

    async fn send_chunk(&self, frame: Vec<u8>) -> Result<(), PeerError> {
        self.0.send(&Bytes::from(frame)).await?;
        Ok(())
    }

    async fn send_control(&self, text: String) -> Result<(), PeerError> {
        self.0.send_text(text).await?;
        Ok(())
    }
}

/// Identifies one READY_NODE request
#[derive(Debug, Clone)]
pub(crate) struct TransferRequest {
    pub peer_id: String,
    pub fragment_id: String,
    pub session_id: String,
}

/// How long a paused transfer may wait for the send buffer to drain.
/// Scales with the amount buffered, bounded to 1..=10 seconds.
pub(crate) fn drain_deadline(buffered: usize) -> Duration {
    Duration::from_millis(((buffered / 1024) as u64).clamp(1_000, 10_000))
}

/// Run one transfer to a terminal status.
///
/// Pre-flight gates run first; a gate failure reports status and returns
/// without registering the transfer. A registered transfer always ends with
/// exactly one of COMPLETED, FAILED, or CANCELED and a TransferFinished
/// notification to the manager.
pub(crate) async fn run_transfer<C, M>(
    request: TransferRequest,
    channel: C,
    index: Arc<FragmentIndex>,
    signaling: SignalingClient,
    events: mpsc::UnboundedSender<SessionEvent>,
    memory: M,
) where
    C: ChunkChannel,
    M: Fn() -> MemoryStatus + Send,
{
    emit_status(&signaling, &request, STATUS_STARTING, None, None);

    // Gate 1: the fragment must be indexed and present on disk
    let path = match index.resolve(&request.fragment_id) {
        Some(path) if path.is_file() => path,
        _ => {
            tracing::warn!(
                fragment = %request.fragment_id,
                peer = %request.peer_id,
                "fragment not found, dropping transfer"
            );
            emit_status(&signaling, &request, STATUS_FILE_NOT_FOUND, None, None);
            return;
        }
    };

    // Gate 2: the data channel must be open
    if !channel.is_open() {
        emit_status(&signaling, &request, STATUS_DATA_CHANNEL_CLOSED, None, None);
        return;
    }

    // Gate 3: refuse under memory pressure, telling the peer why
    if memory().under_pressure() || channel.buffered().await > PRESSURE_BUFFERED_BYTES {
        tracing::warn!(
            fragment = %request.fragment_id,
            peer = %request.peer_id,
            "resource pressure, refusing transfer"
        );
        let cancel = ControlMessage::Canceled {
            session_id: request.session_id.clone(),
            fragment_id: request.fragment_id.clone(),
            error: Some(STATUS_LOW_MEMORY.to_string()),
        };
        if let Ok(text) = cancel.to_json() {
            if let Err(err) = channel.send_control(text).await {
                tracing::warn!(%err, "failed to send cancel frame");
            }
        }
        emit_status(&signaling, &request, STATUS_LOW_MEMORY, None, None);
        return;
    }

    let total_bytes = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            emit_status(&signaling, &request, STATUS_FILE_NOT_FOUND, None, None);
            return;
        }
    };

    let handle = Arc::new(TransferHandle::new(
        request.fragment_id.clone(),
        request.session_id.clone(),
        total_bytes,
    ));
    let _ = events.send(SessionEvent::TransferStarted {
        peer_id: request.peer_id.clone(),
        handle: handle.clone(),
    });
    emit_status(
        &signaling,
        &request,
        TransferStatus::InProgress.as_event(),
        None,
        Some(&handle),
    );

    let (status, error) = stream_fragment(&request, &channel, &path, &handle, &events).await;

    emit_terminal(&signaling, &request, &handle, status, error);
    let _ = events.send(SessionEvent::TransferFinished {
        peer_id: request.peer_id.clone(),
        session_id: request.session_id.clone(),
    });
}

/// The chunk loop. Returns the terminal status and an optional error text.
async fn stream_fragment<C: ChunkChannel>(
    request: &TransferRequest,
    channel: &C,
    path: &std::path::Path,
    handle: &Arc<TransferHandle>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> (TransferStatus, Option<String>) {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => return (TransferStatus::Failed, Some(err.to_string())),
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut last_refresh = tokio::time::Instant::now();

    loop {
        if handle.is_canceled() {
            return (TransferStatus::Canceled, None);
        }

        // Back-pressure: pause reads until the buffer drains or the
        // deadline (sized once per pause) lapses
        if channel.buffered().await > MAX_BUFFER_THRESHOLD {
            let deadline =
                tokio::time::Instant::now() + drain_deadline(channel.buffered().await);
            loop {
                tokio::time::sleep(THROTTLE_CHECK_INTERVAL).await;
                if handle.is_canceled() {
                    return (TransferStatus::Canceled, None);
                }
                if channel.buffered().await <= DRAIN_TARGET {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(
                        session = %request.session_id,
                        peer = %request.peer_id,
                        "send buffer did not drain in time"
                    );
                    return (TransferStatus::Failed, Some(THROTTLED_ERROR.to_string()));
                }
            }
        }

        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(
                    session = %request.session_id,
                    %err,
                    "fragment read error"
                );
                return (TransferStatus::Failed, Some(err.to_string()));
            }
        };
        if read == 0 {
            if handle.sent_bytes() == handle.total_bytes {
                return (TransferStatus::Completed, None);
            }
            // File shrank underneath the transfer
            return (
                TransferStatus::Failed,
                Some("fragment shorter than expected".to_string()),
            );
        }

        let last = handle.sent_bytes() + read as u64 >= handle.total_bytes;
        let frame = match protocol::encode_chunk_frame(&request.session_id, last, &buf[..read]) {
            Ok(frame) => frame,
            Err(err) => return (TransferStatus::Failed, Some(err.to_string())),
        };
        if let Err(err) = channel.send_chunk(frame).await {
            return (TransferStatus::Failed, Some(err.to_string()));
        }
        handle.record_sent(read as u64);

        if last_refresh.elapsed() >= ACTIVITY_REFRESH_INTERVAL {
            let _ = events.send(SessionEvent::Activity {
                peer_id: request.peer_id.clone(),
            });
            last_refresh = tokio::time::Instant::now();
        }
    }
}

fn emit_status(
    signaling: &SignalingClient,
    request: &TransferRequest,
    status: &str,
    error: Option<String>,
    handle: Option<&Arc<TransferHandle>>,
) {
    let payload = FragmentStatusPayload {
        peer_id: request.peer_id.clone(),
        session_id: request.session_id.clone(),
        fragment_id: request.fragment_id.clone(),
        status: status.to_string(),
        error,
        sent_bytes: handle.map(|h| h.sent_bytes()),
        total_bytes: handle.map(|h| h.total_bytes),
        duration_ms: None,
        bytes_per_sec: None,
    };
    if let Err(err) = signaling.emit(EV_FRAGMENT_STATUS, &payload) {
        tracing::debug!(%err, "could not report transfer status");
    }
}

fn emit_terminal(
    signaling: &SignalingClient,
    request: &TransferRequest,
    handle: &Arc<TransferHandle>,
    status: TransferStatus,
    error: Option<String>,
) {
    let elapsed = handle.started_at.elapsed();
    let duration_ms = elapsed.as_millis() as u64;
    let bytes_per_sec = if elapsed.as_secs_f64() > 0.0 {
        (handle.sent_bytes() as f64 / elapsed.as_secs_f64()) as u64
    } else {
        handle.sent_bytes()
    };

    let payload = FragmentStatusPayload {
        peer_id: request.peer_id.clone(),
        session_id: request.session_id.clone(),
        fragment_id: request.fragment_id.clone(),
        status: status.as_event().to_string(),
        error,
        sent_bytes: Some(handle.sent_bytes()),
        total_bytes: Some(handle.total_bytes),
        duration_ms: Some(duration_ms),
        bytes_per_sec: Some(bytes_per_sec),
    };
    if let Err(err) = signaling.emit(EV_FRAGMENT_STATUS, &payload) {
        tracing::debug!(%err, "could not report transfer status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::events::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message;

    struct MockChannel {
        open: bool,
        buffered: AtomicUsize,
        frames: Mutex<Vec<Vec<u8>>>,
        control: Mutex<Vec<String>>,
    }

    impl MockChannel {
        fn open_with_buffer(buffered: usize) -> Arc<Self> {
            Arc::new(Self {
                open: true,
                buffered: AtomicUsize::new(buffered),
                frames: Mutex::new(Vec::new()),
                control: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChunkChannel for Arc<MockChannel> {
        fn is_open(&self) -> bool {
            self.open
        }

        async fn buffered(&self) -> usize {
            self.buffered.load(Ordering::Relaxed)
        }

        async fn send_chunk(&self, frame: Vec<u8>) -> Result<(), PeerError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn send_control(&self, text: String) -> Result<(), PeerError> {
            self.control.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn normal_memory() -> MemoryStatus {
        MemoryStatus {
            available: 50,
            total: 100,
        }
    }

    fn low_memory() -> MemoryStatus {
        MemoryStatus {
            available: 5,
            total: 100,
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            peer_id: "peer-A".into(),
            fragment_id: "F1".into(),
            session_id: "S1".into(),
        }
    }

    fn statuses(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let env: Envelope = serde_json::from_str(&text).unwrap();
            if env.event == EV_FRAGMENT_STATUS {
                out.push((
                    env.data["status"].as_str().unwrap().to_string(),
                    env.data["error"].as_str().map(str::to_string),
                ));
            }
        }
        out
    }

    fn index_with_fragment(dir: &TempDir, id: &str, data: &[u8]) -> Arc<FragmentIndex> {
        let index = FragmentIndex::new();
        let path = dir.path().join(id);
        std::fs::write(&path, data).unwrap();
        index.insert(id.to_string(), path);
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_happy_path_streams_four_frames() {
        let dir = TempDir::new().unwrap();
        let fragment: Vec<u8> = (0..160 * 1024).map(|i| (i % 251) as u8).collect();
        let index = index_with_fragment(&dir, "F1", &fragment);
        let channel = MockChannel::open_with_buffer(0);
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        run_transfer(
            request(),
            channel.clone(),
            index,
            signaling,
            events_tx,
            normal_memory,
        )
        .await;

        // 160 KiB at 53 KiB per chunk is four frames, last flag on the last
        let frames = channel.frames.lock().unwrap();
        assert_eq!(frames.len(), 4);
        let mut rebuilt = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let decoded = protocol::decode_chunk_frame(frame).unwrap();
            assert_eq!(decoded.session_id, "S1");
            assert_eq!(decoded.last, i == frames.len() - 1);
            rebuilt.extend_from_slice(decoded.payload);
        }
        assert_eq!(rebuilt, fragment);

        let seen = statuses(&mut sig_rx);
        let names: Vec<&str> = seen.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(names, vec!["STARTING", "IN_PROGRESS", "COMPLETED"]);

        // Registration happened, then the terminal notification
        let started = events_rx.recv().await.unwrap();
        let handle = match started {
            SessionEvent::TransferStarted { handle, .. } => handle,
            _ => panic!("expected TransferStarted"),
        };
        assert_eq!(handle.sent_bytes(), handle.total_bytes);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            SessionEvent::TransferFinished { ref session_id, .. } if session_id == "S1"
        ));
    }

    #[tokio::test]
    async fn test_missing_fragment_sends_no_frames() {
        let channel = MockChannel::open_with_buffer(0);
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        run_transfer(
            request(),
            channel.clone(),
            Arc::new(FragmentIndex::new()),
            signaling,
            events_tx,
            normal_memory,
        )
        .await;

        assert!(channel.frames.lock().unwrap().is_empty());
        let seen = statuses(&mut sig_rx);
        assert_eq!(seen.last().unwrap().0, "FILE_NOT_FOUND");
        // Never registered
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_is_refused() {
        let dir = TempDir::new().unwrap();
        let index = index_with_fragment(&dir, "F1", b"data");
        let channel = Arc::new(MockChannel {
            open: false,
            buffered: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
        });
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        run_transfer(request(), channel.clone(), index, signaling, events_tx, normal_memory)
            .await;

        assert!(channel.frames.lock().unwrap().is_empty());
        assert_eq!(statuses(&mut sig_rx).last().unwrap().0, "DATA_CHANNEL_CLOSED");
    }

    #[tokio::test]
    async fn test_low_memory_sends_cancel_frame() {
        let dir = TempDir::new().unwrap();
        let index = index_with_fragment(&dir, "F1", b"data");
        let channel = MockChannel::open_with_buffer(0);
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        run_transfer(request(), channel.clone(), index, signaling, events_tx, low_memory)
            .await;

        assert!(channel.frames.lock().unwrap().is_empty());
        let control = channel.control.lock().unwrap();
        assert_eq!(control.len(), 1);
        let msg = ControlMessage::parse(&control[0]).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::Canceled { error: Some(ref e), .. } if e == "LOW_MEMORY"
        ));
        assert_eq!(statuses(&mut sig_rx).last().unwrap().0, "LOW_MEMORY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backpressure_pause() {
        let dir = TempDir::new().unwrap();
        let index = index_with_fragment(&dir, "F1", &vec![0u8; 4 * CHUNK_SIZE]);
        // Buffer pinned above the pause threshold: the streamer parks in the
        // drain poll before sending anything
        let channel = MockChannel::open_with_buffer(MAX_BUFFER_THRESHOLD + 1);
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_transfer(
            request(),
            channel.clone(),
            index,
            signaling,
            events_tx,
            normal_memory,
        ));

        let started = loop {
            match events_rx.recv().await.unwrap() {
                SessionEvent::TransferStarted { handle, .. } => break handle,
                _ => continue,
            }
        };
        started.cancel();
        task.await.unwrap();

        assert!(channel.frames.lock().unwrap().is_empty());
        let seen = statuses(&mut sig_rx);
        assert_eq!(seen.last().unwrap().0, "CANCELED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_timeout_fails_transfer() {
        let dir = TempDir::new().unwrap();
        let index = index_with_fragment(&dir, "F1", &vec![0u8; 2 * CHUNK_SIZE]);
        // Pinned buffer that never drains; deadline clamps to the 1 s floor
        let channel = MockChannel::open_with_buffer(MAX_BUFFER_THRESHOLD + 1);
        let (signaling, mut sig_rx) = SignalingClient::test_pair();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        run_transfer(
            request(),
            channel.clone(),
            index,
            signaling,
            events_tx,
            normal_memory,
        )
        .await;

        assert!(channel.frames.lock().unwrap().is_empty());
        let seen = statuses(&mut sig_rx);
        let (status, error) = seen.last().unwrap();
        assert_eq!(status, "FAILED");
        assert_eq!(error.as_deref(), Some("Transfer throttled too long"));
    }

    #[test]
    fn test_drain_deadline_bounds() {
        assert_eq!(drain_deadline(0), Duration::from_secs(1));
        assert_eq!(drain_deadline(512 * 1024), Duration::from_secs(1));
        assert_eq!(drain_deadline(5_000 * 1024), Duration::from_secs(5));
        assert_eq!(drain_deadline(20 * 1024 * 1024), Duration::from_secs(10));
    }
}
