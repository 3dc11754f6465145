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

//! State shared by every task of a session.
//!
//! [`SessionContext`] holds the collaborators and is created once per
//! controller. [`SessionState`] holds what one connection attempt learns and
//! is replaced on a fresh connect and partially cleared on reconnect.
//!
//! Field ownership. Only the listed writers mutate a field; everything else
//! reads it.
//!
//! | field | written by |
//! |---|---|
//! | `audio_input` | `ReceiveAudioInputTask`, `CleanStoppedSessionTask` |
//! | `video_input`, `video_duplex_mode`, `video_capture_and_encode_parameters` | `ReceiveVideoInputTask`, `CleanStoppedSessionTask` |
//! | `signaling_open_duration_ms` | `OpenSignalingConnectionTask` |
//! | `turn_credentials` | `JoinAndReceiveIndexTask`, `ReceiveTurnCredentialsTask` |
//! | `index_frame`, `video_subscription_limit`, `server_side_network_adaption` | `JoinAndReceiveIndexTask` |
//! | `video_stream_index`, `videos_to_receive`, `last_known_video_availability`, `last_remote_video_sources` | `ReceiveVideoStreamIndexTask` |
//! | `peer` | `CreatePeerConnectionTask`, cleanup tasks |
//! | `video_subscriptions`, `max_video_tile_count` | `AttachMediaInputTask`, in-place updates |
//! | `sdp_offer` | `CreateSdpTask`, `SetLocalDescriptionTask` |
//! | `ice_candidates`, `ice_gathering_duration_ms` | `FinishGatheringIceCandidatesTask` |
//! | `sdp_answer`, `last_videos_to_receive`, `last_video_subscription_configuration` | `SubscribeAndReceiveSubscribeAckTask`, in-place updates |
//! | `videos_paused` | `ReceiveRemoteVideoPauseResumeTask` |
//! | `attendee_presence_duration_ms` | `WaitForAttendeePresenceTask` |
//! | codec fields | `SetRemoteDescriptionTask` |
//!
//! Multi-step updates hold [`SessionContext::update_lock`] so index
//! ingestion never computes a policy decision against half-updated state.

use crate::config::MeetingSessionConfiguration;
use crate::connection_health::ConnectionHealthData;
use crate::errors::TaskError;
use crate::event_controller::EventController;
use crate::events::{AudioVideoEventAttributes, AudioVideoEventName};
use crate::media::{MediaKind, MediaStream, MediaStreamBroker, MediaStreamTrack};
use crate::observer::{MeetingSessionVideoAvailability, ObserverId, ObserverSet, VideoSource};
use crate::peer::{PeerConnection, PeerConnectionFactory};
use crate::policy::{
    EncodingParameters, SharedDownlinkPolicy, SharedUplinkPolicy,
    VideoCaptureAndEncodeParameters,
};
use crate::realtime::RealtimeController;
use crate::reconnect_controller::ReconnectController;
use crate::signaling_client::SignalingClient;
use crate::status::MeetingSessionStatus;
use crate::transceiver_controller::TransceiverController;
use crate::turn_credentials::TurnCredentialsProvider;
use crate::video_stream_index::VideoStreamIndex;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use videocall_types::{
    IndexFrame, ServerSideNetworkAdaption, StreamServiceType, TurnCredentials,
    VideoSubscriptionConfiguration,
};

/// The parts of the orchestrator that tasks call back into.
pub trait SessionController: Send + Sync {
    /// Request an update; `false` if it was rejected.
    fn update(&self, need_notify: bool) -> bool;

    /// Route a non-OK status. Returns `true` if the status was handled by
    /// recovery (a restart or a scheduled reconnect).
    fn handle_meeting_session_status(
        &self,
        status: MeetingSessionStatus,
        error: Option<TaskError>,
    ) -> bool;
}

#[derive(Default)]
pub struct SessionState {
    pub audio_input: Option<MediaStream>,
    pub video_input: Option<MediaStream>,
    /// The application asked for local video. The next update acquires or
    /// releases the camera to match.
    pub local_video_requested: bool,
    pub video_duplex_mode: StreamServiceType,
    pub video_capture_and_encode_parameters: VideoCaptureAndEncodeParameters,
    pub last_encoding_parameters: Option<EncodingParameters>,

    pub turn_credentials: Option<TurnCredentials>,
    pub index_frame: Option<IndexFrame>,
    pub server_side_network_adaption: ServerSideNetworkAdaption,
    pub video_subscription_limit: usize,

    pub video_stream_index: VideoStreamIndex,
    pub videos_to_receive: BTreeSet<u32>,
    /// `None` until the first subscribe was acknowledged.
    pub last_videos_to_receive: Option<BTreeSet<u32>>,
    pub video_subscriptions: Vec<u32>,
    /// Keyed by group id.
    pub last_video_subscription_configuration: BTreeMap<u32, VideoSubscriptionConfiguration>,
    pub videos_paused: BTreeSet<u32>,
    pub last_known_video_availability: Option<MeetingSessionVideoAvailability>,
    pub last_remote_video_sources: Vec<VideoSource>,

    pub peer: Option<Arc<dyn PeerConnection>>,
    pub sdp_offer: Option<String>,
    pub sdp_answer: Option<String>,
    pub ice_candidates: Vec<String>,

    pub current_video_send_codec: Option<String>,
    pub prioritized_send_codecs: Vec<String>,
    /// Codecs that failed at runtime. Survives reconnects.
    pub degraded_video_send_codecs: Vec<String>,

    pub signaling_open_duration_ms: Option<u64>,
    pub ice_gathering_duration_ms: Option<u64>,
    pub attendee_presence_duration_ms: Option<u64>,
    pub meeting_start_duration_ms: Option<u64>,
    pub poor_connection_count: u32,
    pub max_video_tile_count: u32,
    pub connect_requested_at: Option<Instant>,
    pub started_at: Option<Instant>,
}

impl SessionState {
    pub fn new(configuration: &MeetingSessionConfiguration) -> Self {
        Self {
            server_side_network_adaption: configuration.server_side_network_adaption,
            video_subscription_limit: configuration.video_subscription_limit,
            ..Default::default()
        }
    }

    /// Drop what belongs to the failed connection: the peer, SDP, ICE, the
    /// TURN credentials, transceiver mappings and codec negotiation. Media
    /// inputs, the stream index and metrics stay.
    pub fn reset_for_reconnect(&mut self) {
        self.peer = None;
        self.sdp_offer = None;
        self.sdp_answer = None;
        self.ice_candidates.clear();
        self.turn_credentials = None;
        self.index_frame = None;
        self.last_videos_to_receive = None;
        self.video_subscriptions.clear();
        self.last_video_subscription_configuration.clear();
        self.current_video_send_codec = None;
        self.prioritized_send_codecs.clear();
        self.last_encoding_parameters = None;
    }

    pub fn audio_track(&self) -> Option<MediaStreamTrack> {
        self.audio_input
            .as_ref()
            .and_then(|s| s.first_track(MediaKind::Audio))
            .cloned()
    }

    pub fn video_track(&self) -> Option<MediaStreamTrack> {
        self.video_input
            .as_ref()
            .and_then(|s| s.first_track(MediaKind::Video))
            .cloned()
    }

    pub fn meeting_duration_ms(&self) -> u64 {
        self.started_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Collaborators the orchestrator is built from.
pub struct SessionCollaborators {
    pub signaling: SignalingClient,
    pub media_stream_broker: Arc<dyn MediaStreamBroker>,
    pub peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    pub uplink_policy: SharedUplinkPolicy,
    pub downlink_policy: SharedDownlinkPolicy,
    pub reconnect_controller: ReconnectController,
    pub turn_credentials_provider: Arc<dyn TurnCredentialsProvider>,
}

pub struct SessionContext {
    pub configuration: MeetingSessionConfiguration,
    pub signaling: SignalingClient,
    pub transceiver_controller: TransceiverController,
    pub media_stream_broker: Arc<dyn MediaStreamBroker>,
    pub peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    pub turn_credentials_provider: Arc<dyn TurnCredentialsProvider>,
    pub uplink_policy: SharedUplinkPolicy,
    pub downlink_policy: SharedDownlinkPolicy,
    pub realtime: RealtimeController,
    pub reconnect_controller: Mutex<ReconnectController>,
    pub observers: Arc<ObserverSet>,
    pub event_controller: EventController,
    pub state: Mutex<SessionState>,
    pub connection_health: Mutex<ConnectionHealthData>,
    /// Held across every multi-step update and while an index is ingested.
    pub update_lock: tokio::sync::Mutex<()>,
    controller: Weak<dyn SessionController>,
    ingestion: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    monitor_observer: Mutex<Option<ObserverId>>,
}

impl SessionContext {
    pub fn new(
        configuration: MeetingSessionConfiguration,
        collaborators: SessionCollaborators,
        observers: Arc<ObserverSet>,
        controller: Weak<dyn SessionController>,
    ) -> Self {
        let state = SessionState::new(&configuration);
        let (ingestion, _) = watch::channel(false);
        Self {
            configuration,
            signaling: collaborators.signaling,
            transceiver_controller: TransceiverController::new(),
            media_stream_broker: collaborators.media_stream_broker,
            peer_connection_factory: collaborators.peer_connection_factory,
            turn_credentials_provider: collaborators.turn_credentials_provider,
            uplink_policy: collaborators.uplink_policy,
            downlink_policy: collaborators.downlink_policy,
            realtime: RealtimeController::new(),
            reconnect_controller: Mutex::new(collaborators.reconnect_controller),
            event_controller: EventController::new(observers.clone()),
            observers,
            state: Mutex::new(state),
            connection_health: Mutex::new(ConnectionHealthData::new()),
            update_lock: tokio::sync::Mutex::new(()),
            controller,
            ingestion,
            background: Mutex::new(Vec::new()),
            monitor_observer: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> Option<Arc<dyn SessionController>> {
        self.controller.upgrade()
    }

    pub fn self_attendee_id(&self) -> &str {
        &self.configuration.attendee_id
    }

    pub fn publish_event(&self, name: AudioVideoEventName, attributes: AudioVideoEventAttributes) {
        self.event_controller.publish_event(name, attributes);
    }

    /// Let index frames and resubscribe checks through.
    pub fn resume_ingestion(&self) {
        self.ingestion.send_replace(true);
    }

    pub fn pause_ingestion(&self) {
        self.ingestion.send_replace(false);
    }

    pub fn is_ingesting(&self) -> bool {
        *self.ingestion.borrow()
    }

    pub async fn wait_for_ingestion(&self) {
        let mut gate = self.ingestion.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    /// Run a listener for the rest of the session. Aborted by
    /// [`abort_background`](Self::abort_background).
    pub fn spawn_background<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    pub fn abort_background(&self) {
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        debug!("aborting {} session listeners", handles.len());
        for handle in handles {
            handle.abort();
        }
    }

    pub fn set_monitor_observer(&self, id: ObserverId) {
        if let Some(previous) = self.monitor_observer.lock().replace(id) {
            self.observers.remove(previous);
        }
    }

    pub fn remove_monitor_observer(&self) {
        if let Some(id) = self.monitor_observer.lock().take() {
            self.observers.remove(id);
        }
    }

    pub fn reset_connection_health(&self) {
        *self.connection_health.lock() = ConnectionHealthData::new();
    }

    /// Apply `change` to the health data and hand the result to observers.
    pub fn update_connection_health(&self, change: impl FnOnce(&mut ConnectionHealthData)) {
        let data = {
            let mut health = self.connection_health.lock();
            change(&mut health);
            health.clone()
        };
        self.observers
            .for_each(|o| o.connection_health_did_change(&data));
    }
}
