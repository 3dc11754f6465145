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

//! In-memory collaborators for unit tests.

use crate::config::MeetingSessionConfiguration;
use crate::errors::{MediaError, TaskError};
use crate::media::{MediaKind, MediaStream, MediaStreamBroker, MediaStreamTrack};
use crate::observer::ObserverSet;
use crate::peer::{
    PeerConnection, PeerConnectionFactory, RtcConfiguration, RtpEncodingParameters,
    RtpTransceiver, SessionDescription, TransceiverDirection,
};
use crate::policy::{AllHighestVideoBandwidthPolicy, NScaleVideoUplinkBandwidthPolicy};
use crate::reconnect_controller::{FullJitterBackoff, ReconnectController};
use crate::session_state::{SessionCollaborators, SessionContext, SessionController};
use crate::signaling_client::SignalingClient;
use crate::status::MeetingSessionStatus;
use crate::turn_credentials::{
    TurnCredentialsError, TurnCredentialsProvider, TurnCredentialsRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use videocall_transport::{SignalingTransport, TransportEvent, WebSocketConnectError};
use videocall_types::{
    decode_frame, encode_frame, FrameType, IndexFrame, JoinAckFrame, SignalFrame, SignalMessage,
    SubscribeAckFrame, TurnCredentials,
};

pub const ANSWER_SDP: &str = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 98\r\n\
a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/video-layers-allocation00\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:98 H264/90000\r\n";

const CANDIDATE: &str = "a=candidate:1 1 udp 1 10.0.0.1 5000 typ host";

pub struct FakeTransceiver {
    mid: String,
    kind: MediaKind,
    direction: Mutex<TransceiverDirection>,
    track: Mutex<Option<MediaStreamTrack>>,
    encodings: Mutex<Vec<RtpEncodingParameters>>,
    pub codecs: Mutex<Vec<String>>,
    pub stopped: AtomicBool,
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

    fn set_codec_preferences(&self, codecs: &[String]) -> Result<(), MediaError> {
        *self.codecs.lock() = codecs.to_vec();
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct FakePeerConnection {
    transceivers: Mutex<Vec<Arc<FakeTransceiver>>>,
    local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<VecDeque<String>>,
    gathered: AtomicUsize,
    pub hang_gathering: AtomicBool,
    pub closed: AtomicBool,
}

impl Default for FakePeerConnection {
    fn default() -> Self {
        Self {
            transceivers: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(VecDeque::from([CANDIDATE.to_string()])),
            gathered: AtomicUsize::new(0),
            hang_gathering: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl FakePeerConnection {
    /// ICE gathering never completes and yields no candidate.
    pub fn stalled() -> Self {
        let peer = Self::default();
        peer.candidates.lock().clear();
        peer.hang_gathering.store(true, Ordering::SeqCst);
        peer
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
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
            codecs: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
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
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::PeerConnection("closed".into()));
        }
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

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        *self.remote.lock() = Some(description);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let gathered = self.gathered.load(Ordering::SeqCst);
        self.local.lock().clone().map(|mut description| {
            for _ in 0..gathered {
                description.sdp.push_str(CANDIDATE);
                description.sdp.push_str("\r\n");
            }
            description
        })
    }

    async fn next_ice_candidate(&self) -> Option<String> {
        let next = self.candidates.lock().pop_front();
        if next.is_some() {
            self.gathered.fetch_add(1, Ordering::SeqCst);
        } else if self.hang_gathering.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        next
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerConnectionFactory {
    pub created: Mutex<Vec<Arc<FakePeerConnection>>>,
    pub stall_next: AtomicBool,
}

impl FakePeerConnectionFactory {
    pub fn last(&self) -> Option<Arc<FakePeerConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerConnectionFactory {
    async fn create(
        &self,
        _configuration: &RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let peer = if self.stall_next.swap(false, Ordering::SeqCst) {
            Arc::new(FakePeerConnection::stalled())
        } else {
            Arc::new(FakePeerConnection::default())
        };
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeMediaStreamBroker {
    pub released: AtomicUsize,
}

#[async_trait]
impl MediaStreamBroker for FakeMediaStreamBroker {
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

    async fn release_media_stream(&self, _stream: &MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A signaling server that answers JOIN, SUBSCRIBE and LEAVE.
#[derive(Default)]
pub struct ScriptedTransport {
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    pub sent: Mutex<Vec<SignalFrame>>,
    pub index: Mutex<IndexFrame>,
    pub connects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub unanswered: Mutex<HashSet<FrameType>>,
}

impl ScriptedTransport {
    pub async fn push(&self, frame: SignalFrame) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            let text = encode_frame(&frame).expect("encode");
            let _ = sender.send(TransportEvent::Message(text)).await;
        }
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

    pub fn sent_types(&self) -> Vec<FrameType> {
        self.sent.lock().iter().map(|f| f.frame_type()).collect()
    }

    fn reply_for(&self, frame: &SignalFrame) -> Vec<SignalFrame> {
        if self.unanswered.lock().contains(&frame.frame_type()) {
            return Vec::new();
        }
        match &frame.message {
            SignalMessage::Join(_) => vec![
                SignalFrame::new(SignalMessage::JoinAck(JoinAckFrame {
                    video_subscription_limit: Some(25),
                    ..Default::default()
                })),
                SignalFrame::new(SignalMessage::Index(self.index.lock().clone())),
            ],
            SignalMessage::Subscribe(_) => {
                vec![SignalFrame::new(SignalMessage::SubscribeAck(SubscribeAckFrame {
                    sdp_answer: ANSWER_SDP.into(),
                    tracks: Vec::new(),
                }))]
            }
            SignalMessage::Leave => vec![SignalFrame::new(SignalMessage::LeaveAck)],
            SignalMessage::Ping(ping) => vec![SignalFrame::new(SignalMessage::Pong(*ping))],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, WebSocketConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(WebSocketConnectError::Other("refused".into()));
        }
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

pub const SELF_ATTENDEE: &str = "self-attendee";

/// A controller that accepts nothing.
pub struct InertController;

impl SessionController for InertController {
    fn update(&self, _need_notify: bool) -> bool {
        false
    }

    fn handle_meeting_session_status(
        &self,
        _status: MeetingSessionStatus,
        _error: Option<TaskError>,
    ) -> bool {
        false
    }
}

pub fn test_configuration() -> MeetingSessionConfiguration {
    MeetingSessionConfiguration {
        meeting_id: "meeting".into(),
        attendee_id: SELF_ATTENDEE.into(),
        signaling_url: "ws://signaling.test/control".into(),
        ..Default::default()
    }
}

pub fn harness(transport: Arc<ScriptedTransport>) -> Arc<SessionContext> {
    harness_with(
        transport,
        Arc::new(FakePeerConnectionFactory::default()),
        Arc::new(FakeMediaStreamBroker::default()),
        Weak::<InertController>::new(),
    )
}

pub fn harness_with(
    transport: Arc<ScriptedTransport>,
    factory: Arc<FakePeerConnectionFactory>,
    broker: Arc<FakeMediaStreamBroker>,
    controller: Weak<dyn SessionController>,
) -> Arc<SessionContext> {
    build_context(
        test_configuration(),
        transport,
        factory,
        broker,
        Arc::new(FakeTurnCredentialsProvider::default()),
        controller,
    )
}

pub fn harness_configured(
    configuration: MeetingSessionConfiguration,
    transport: Arc<ScriptedTransport>,
    turn: Arc<FakeTurnCredentialsProvider>,
) -> Arc<SessionContext> {
    build_context(
        configuration,
        transport,
        Arc::new(FakePeerConnectionFactory::default()),
        Arc::new(FakeMediaStreamBroker::default()),
        turn,
        Weak::<InertController>::new(),
    )
}

fn build_context(
    configuration: MeetingSessionConfiguration,
    transport: Arc<ScriptedTransport>,
    factory: Arc<FakePeerConnectionFactory>,
    broker: Arc<FakeMediaStreamBroker>,
    turn: Arc<FakeTurnCredentialsProvider>,
    controller: Weak<dyn SessionController>,
) -> Arc<SessionContext> {
    let collaborators = SessionCollaborators {
        signaling: SignalingClient::new(transport),
        media_stream_broker: broker,
        peer_connection_factory: factory,
        uplink_policy: Arc::new(Mutex::new(NScaleVideoUplinkBandwidthPolicy::new(SELF_ATTENDEE))),
        downlink_policy: Arc::new(Mutex::new(AllHighestVideoBandwidthPolicy::new(SELF_ATTENDEE))),
        reconnect_controller: ReconnectController::new(
            Duration::from_millis(configuration.reconnect_timeout_ms),
            Box::new(FullJitterBackoff::new(0, 10, 50)),
        ),
        turn_credentials_provider: turn,
    };
    Arc::new(SessionContext::new(
        configuration,
        collaborators,
        Arc::new(ObserverSet::new()),
        controller,
    ))
}

/// Hands out fixed credentials, or refuses every request.
#[derive(Default)]
pub struct FakeTurnCredentialsProvider {
    pub requests: Mutex<Vec<TurnCredentialsRequest>>,
    forbidden: bool,
}

impl FakeTurnCredentialsProvider {
    pub fn forbidden() -> Self {
        Self {
            forbidden: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TurnCredentialsProvider for FakeTurnCredentialsProvider {
    async fn fetch(
        &self,
        request: &TurnCredentialsRequest,
    ) -> Result<TurnCredentials, TurnCredentialsError> {
        self.requests.lock().push(request.clone());
        if self.forbidden {
            return Err(TurnCredentialsError::Forbidden("not allowed".into()));
        }
        Ok(TurnCredentials {
            username: "turn-user".into(),
            password: "turn-password".into(),
            ttl_seconds: 300,
            uris: vec!["turn:turn.test:3478".into()],
        })
    }
}
