/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! A scripted signaling server and in-memory media stack for driving a
//! whole session through the public API.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use videocall_session::errors::MediaError;
use videocall_session::peer::{
    RtcConfiguration, RtpEncodingParameters, RtpTransceiver, SessionDescription,
    TransceiverDirection,
};
use videocall_session::{
    AudioVideoController, AudioVideoObserver, MediaKind, MediaStream, MediaStreamBroker,
    MediaStreamTrack, MeetingSessionConfiguration, MeetingSessionStatus,
    MeetingSessionStatusCode, PeerConnection, PeerConnectionFactory,
};
use videocall_transport::{SignalingTransport, TransportEvent, WebSocketConnectError};
use videocall_types::{
    decode_frame, encode_frame, FrameType, IndexFrame, JoinAckFrame, MediaType, SignalFrame,
    SignalMessage, StreamDescriptor, SubscribeAckFrame, SubscribeFrame,
};

pub const SELF_ATTENDEE: &str = "self-attendee";

const ANSWER_SDP: &str = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=rtpmap:96 VP8/90000\r\n";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn configuration() -> MeetingSessionConfiguration {
    MeetingSessionConfiguration {
        meeting_id: "meeting".into(),
        attendee_id: SELF_ATTENDEE.into(),
        signaling_url: "ws://signaling.test/control".into(),
        connection_timeout_ms: 2_000,
        reconnect_fixed_wait_ms: 0,
        reconnect_short_backoff_ms: 10,
        reconnect_long_backoff_ms: 20,
        ..Default::default()
    }
}

pub fn controller(
    configuration: MeetingSessionConfiguration,
    server: Arc<FakeServer>,
) -> (AudioVideoController, Arc<RecordingObserver>) {
    let controller = AudioVideoController::with_transport(
        configuration,
        server,
        Arc::new(FakeBroker),
        Arc::new(FakeFactory::default()),
    )
    .expect("valid configuration");
    let observer = Arc::new(RecordingObserver::default());
    controller.add_observer(observer.clone());
    (controller, observer)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub fn video_sender(stream_id: u32, attendee_id: &str) -> StreamDescriptor {
    StreamDescriptor {
        stream_id,
        group_id: stream_id,
        attendee_id: attendee_id.to_string(),
        external_user_id: attendee_id.to_string(),
        media_type: MediaType::Video,
        track_label: format!("{attendee_id}-video"),
        max_bitrate_kbps: 600,
        avg_bitrate_bps: 500_000,
        width: 640,
        height: 384,
        framerate: 15,
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub started: AtomicUsize,
    pub reconnecting: AtomicUsize,
    pub stopped: Mutex<Vec<MeetingSessionStatusCode>>,
}

impl AudioVideoObserver for RecordingObserver {
    fn audio_video_did_start_connecting(&self, reconnecting: bool) {
        if reconnecting {
            self.reconnecting.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn audio_video_did_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn audio_video_did_stop(&self, status: MeetingSessionStatus) {
        self.stopped.lock().push(status.status_code());
    }
}

/// Answers JOIN with an ack and the current index, SUBSCRIBE with an
/// answer, LEAVE with an ack and PING with a pong.
#[derive(Default)]
pub struct FakeServer {
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    pub sent: Mutex<Vec<SignalFrame>>,
    pub index: Mutex<IndexFrame>,
    pub connects: AtomicUsize,
    pub ignore_join: AtomicBool,
    pub hold_subscribe_acks: AtomicBool,
    held_acks: Mutex<Vec<SignalFrame>>,
}

impl FakeServer {
    pub async fn push(&self, frame: SignalFrame) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            let text = encode_frame(&frame).expect("encode");
            let _ = sender.send(TransportEvent::Message(text)).await;
        }
    }

    pub async fn push_index(&self, index: IndexFrame) {
        *self.index.lock() = index.clone();
        self.push(SignalFrame::new(SignalMessage::Index(index))).await;
    }

    /// The connection vanishes without a close handshake.
    pub async fn drop_connection(&self) {
        let sender = self.events.lock().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::Closed {
                    code: 1006,
                    reason: String::new(),
                })
                .await;
        }
    }

    /// Answers every held SUBSCRIBE and stops holding new ones.
    pub async fn release_subscribe_acks(&self) {
        self.hold_subscribe_acks.store(false, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.held_acks.lock());
        for ack in held {
            self.push(ack).await;
        }
    }

    pub fn held_ack_count(&self) -> usize {
        self.held_acks.lock().len()
    }

    pub fn count(&self, frame_type: FrameType) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.frame_type() == frame_type)
            .count()
    }

    pub fn subscribes(&self) -> Vec<SubscribeFrame> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| match &f.message {
                SignalMessage::Subscribe(subscribe) => Some(subscribe.clone()),
                _ => None,
            })
            .collect()
    }

    fn reply_for(&self, frame: &SignalFrame) -> Vec<SignalFrame> {
        match &frame.message {
            SignalMessage::Join(_) if self.ignore_join.load(Ordering::SeqCst) => Vec::new(),
            SignalMessage::Join(_) => vec![
                SignalFrame::new(SignalMessage::JoinAck(JoinAckFrame::default())),
                SignalFrame::new(SignalMessage::Index(self.index.lock().clone())),
            ],
            SignalMessage::Subscribe(_) => {
                let ack = SignalFrame::new(SignalMessage::SubscribeAck(SubscribeAckFrame {
                    sdp_answer: ANSWER_SDP.into(),
                    tracks: Vec::new(),
                }));
                if self.hold_subscribe_acks.load(Ordering::SeqCst) {
                    self.held_acks.lock().push(ack);
                    return Vec::new();
                }
                vec![ack]
            }
            SignalMessage::Leave => vec![SignalFrame::new(SignalMessage::LeaveAck)],
            SignalMessage::Ping(ping) => vec![SignalFrame::new(SignalMessage::Pong(*ping))],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl SignalingTransport for FakeServer {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, WebSocketConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, text: String) -> anyhow::Result<()> {
        let frame = decode_frame(&text)?;
        let replies = self.reply_for(&frame);
        self.sent.lock().push(frame);
        for reply in replies {
            self.push(reply).await;
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()> {
        let sender = self.events.lock().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::Closed {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.events.lock().is_some()
    }
}

pub struct FakeBroker;

#[async_trait]
impl MediaStreamBroker for FakeBroker {
    async fn acquire_audio_input_stream(&self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(
            "mic",
            vec![MediaStreamTrack::new("mic-track", MediaKind::Audio)],
        ))
    }

    async fn acquire_video_input_stream(&self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(
            "camera",
            vec![MediaStreamTrack::new("camera-track", MediaKind::Video)],
        ))
    }

    async fn release_media_stream(&self, _stream: &MediaStream) {}
}

struct FakeTransceiver {
    mid: String,
    kind: MediaKind,
    direction: Mutex<TransceiverDirection>,
    track: Mutex<Option<MediaStreamTrack>>,
    encodings: Mutex<Vec<RtpEncodingParameters>>,
}

#[async_trait]
impl RtpTransceiver for FakeTransceiver {
    fn mid(&self) -> Option<String> {
        Some(self.mid.clone())
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        *self.direction.lock()
    }

    fn set_direction(&self, direction: TransceiverDirection) {
        *self.direction.lock() = direction;
    }

    fn sender_track(&self) -> Option<MediaStreamTrack> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<MediaStreamTrack>) -> Result<(), MediaError> {
        *self.track.lock() = track;
        Ok(())
    }

    fn encodings(&self) -> Vec<RtpEncodingParameters> {
        self.encodings.lock().clone()
    }

    async fn set_encodings(&self, encodings: Vec<RtpEncodingParameters>) -> Result<(), MediaError> {
        *self.encodings.lock() = encodings;
        Ok(())
    }

    fn set_codec_preferences(&self, _codecs: &[String]) -> Result<(), MediaError> {
        Ok(())
    }

    fn stop(&self) {}
}

pub struct FakePeer {
    transceivers: Mutex<Vec<Arc<FakeTransceiver>>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: Mutex<VecDeque<String>>,
    gathered: Mutex<Vec<String>>,
}

impl Default for FakePeer {
    fn default() -> Self {
        Self {
            transceivers: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            candidates: Mutex::new(VecDeque::from([
                "a=candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            ])),
            gathered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
        send_encodings: Vec<RtpEncodingParameters>,
    ) -> Arc<dyn RtpTransceiver> {
        let mut transceivers = self.transceivers.lock();
        let transceiver = Arc::new(FakeTransceiver {
            mid: transceivers.len().to_string(),
            kind,
            direction: Mutex::new(direction),
            track: Mutex::new(None),
            encodings: Mutex::new(send_encodings),
        });
        transceivers.push(transceiver.clone());
        transceiver
    }

    fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>> {
        self.transceivers
            .lock()
            .iter()
            .map(|t| t.clone() as Arc<dyn RtpTransceiver>)
            .collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let mut sdp = String::from("v=0\r\n");
        for t in self.transceivers.lock().iter() {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\n", t.kind, t.mid));
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    /// The local offer with every candidate gathered so far.
    fn local_description(&self) -> Option<SessionDescription> {
        let gathered = self.gathered.lock().clone();
        self.local.lock().clone().map(|mut description| {
            for candidate in gathered {
                description.sdp.push_str(&candidate);
                description.sdp.push_str("\r\n");
            }
            description
        })
    }

    async fn next_ice_candidate(&self) -> Option<String> {
        let next = self.candidates.lock().pop_front();
        if let Some(candidate) = &next {
            self.gathered.lock().push(candidate.clone());
        }
        next
    }

    fn close(&self) {}
}

#[derive(Default)]
pub struct FakeFactory {
    pub created: AtomicUsize,
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        _configuration: &RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePeer::default()))
    }
}
