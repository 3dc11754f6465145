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

//! The orchestrator.
//!
//! [`AudioVideoController`] owns one [`SessionContext`] and drives it
//! through the connect, update, reconnect and disconnect pipelines. Every
//! pipeline runs behind the [`SessionStateController`], so a disconnect
//! can never race a reconnect and two connects never overlap.
//!
//! The controller must be used from within a Tokio runtime: pipelines and
//! scheduled retries run as spawned tasks.

use crate::config::MeetingSessionConfiguration;
use crate::connection_health::ConnectionHealthData;
use crate::errors::{MediaError, SessionError, TaskError};
use crate::event_controller::MeetingHistoryEntry;
use crate::events::{AudioVideoEventAttributes, AudioVideoEventName, SessionEvent};
use crate::media::{MediaKind, MediaStreamBroker};
use crate::observer::{AudioVideoObserver, ObserverId, ObserverSet, VideoSource};
use crate::peer::PeerConnectionFactory;
use crate::policy::{
    AllHighestVideoBandwidthPolicy, DefaultSimulcastUplinkPolicy, EncodingParameters,
    NScaleVideoUplinkBandwidthPolicy, SharedDownlinkPolicy, SharedUplinkPolicy,
    VideoAdaptiveSubscribePolicy, VideoPreferences, VideoPriorityBasedPolicy,
    VideoUplinkBandwidthPolicy,
};
use crate::realtime::RealtimeController;
use crate::reconnect_controller::{FullJitterBackoff, ReconnectController};
use crate::sdp::{has_video_header_extension, VIDEO_LAYERS_ALLOCATION_EXTENSION};
use crate::session_state::{
    SessionCollaborators, SessionContext, SessionController, SessionState,
};
use crate::session_state_controller::{
    SessionStateController, SessionStateControllerAction as Action,
    SessionStateControllerState, SessionStateControllerTransitionResult as Transition,
};
use crate::signaling_client::SignalingClient;
use crate::status::{MeetingSessionStatus, MeetingSessionStatusCode};
use crate::turn_credentials::HttpTurnCredentialsProvider;
use crate::subscription_diff::{
    decide_update, detect_changes_in_videos_to_receive, remote_video_update_frame,
    video_subscription_configuration, EncodingChange, UpdateDecision, UpdateInputs,
};
use crate::task::{
    run_task, AttachMediaInputTask, CleanRestartedSessionTask, CleanStoppedSessionTask,
    CreatePeerConnectionTask, CreateSdpTask, FinishGatheringIceCandidatesTask,
    JoinAndReceiveIndexTask, LeaveAndReceiveLeaveAckTask, ListenForVolumeIndicatorsTask,
    MonitorTask, OnceTask, OpenSignalingConnectionTask, ParallelGroupTask,
    ReceiveAudioInputTask, ReceiveRemoteVideoPauseResumeTask, ReceiveTurnCredentialsTask,
    ReceiveVideoInputTask, ReceiveVideoStreamIndexTask, SendAndReceiveDataMessagesTask, SerialGroupTask,
    SetLocalDescriptionTask, SetRemoteDescriptionTask, SubscribeAndReceiveSubscribeAckTask,
    Task, TaskRef, TimeoutTask, WaitForAttendeePresenceTask,
};
use async_broadcast::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use videocall_transport::SignalingTransport;
use videocall_types::DataMessage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Only open the signaling connection. A later [`AudioVideoController::start`]
    /// reuses it.
    pub signaling_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Re-apply the send bitrate once the update completes.
    pub need_notify: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { need_notify: true }
    }
}

fn task(task: impl Task + 'static) -> TaskRef {
    Arc::new(task)
}

pub struct AudioVideoController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    this: Weak<ControllerInner>,
    context: Arc<SessionContext>,
    session_state: SessionStateController,
    /// Retries across every reconnect episode since the last fresh start.
    total_retry_count: AtomicU32,
    pre_started_signaling: Mutex<Option<TaskRef>>,
    running: Mutex<Option<TaskRef>>,
}

impl AudioVideoController {
    pub fn new(
        configuration: MeetingSessionConfiguration,
        collaborators: SessionCollaborators,
    ) -> Result<Self, SessionError> {
        configuration
            .validate()
            .map_err(|e| SessionError::InvalidArgument(e.to_string()))?;
        let observers = Arc::new(ObserverSet::new());
        let inner = Arc::new_cyclic(|this: &Weak<ControllerInner>| {
            let controller: Weak<dyn SessionController> = this.clone();
            ControllerInner {
                this: this.clone(),
                context: Arc::new(SessionContext::new(
                    configuration,
                    collaborators,
                    observers,
                    controller,
                )),
                session_state: SessionStateController::new(),
                total_retry_count: AtomicU32::new(0),
                pre_started_signaling: Mutex::new(None),
                running: Mutex::new(None),
            }
        });
        Ok(Self { inner })
    }

    /// Build the controller with the default collaborators for
    /// `configuration`.
    pub fn with_transport(
        configuration: MeetingSessionConfiguration,
        transport: Arc<dyn SignalingTransport>,
        media_stream_broker: Arc<dyn MediaStreamBroker>,
        peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self, SessionError> {
        let collaborators = Self::default_collaborators(
            &configuration,
            transport,
            media_stream_broker,
            peer_connection_factory,
        );
        Self::new(configuration, collaborators)
    }

    /// Simulcast pairs the simulcast uplink with the bandwidth adaptive
    /// downlink, otherwise NScale and all-highest are used. The priority
    /// downlink replaces either downlink when enabled. TURN credentials are
    /// fetched over HTTP.
    pub fn default_collaborators(
        configuration: &MeetingSessionConfiguration,
        transport: Arc<dyn SignalingTransport>,
        media_stream_broker: Arc<dyn MediaStreamBroker>,
        peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    ) -> SessionCollaborators {
        let attendee_id = configuration.attendee_id.clone();
        let uplink_policy: SharedUplinkPolicy = if configuration.enable_simulcast {
            Arc::new(Mutex::new(DefaultSimulcastUplinkPolicy::new(&attendee_id)))
        } else {
            let mut uplink =
                NScaleVideoUplinkBandwidthPolicy::new(&attendee_id).with_svc(configuration.enable_svc);
            uplink.set_ideal_max_bandwidth_kbps(configuration.ideal_max_bandwidth_kbps);
            Arc::new(Mutex::new(uplink))
        };
        let downlink_policy: SharedDownlinkPolicy = if configuration.enable_priority_downlink {
            Arc::new(Mutex::new(VideoPriorityBasedPolicy::new(&attendee_id)))
        } else if configuration.enable_simulcast {
            Arc::new(Mutex::new(VideoAdaptiveSubscribePolicy::with_bandwidth(
                &attendee_id,
                configuration.downlink_bandwidth_kbps,
            )))
        } else {
            Arc::new(Mutex::new(AllHighestVideoBandwidthPolicy::new(&attendee_id)))
        };
        downlink_policy
            .lock()
            .set_subscription_limit(configuration.video_subscription_limit);

        let reconnect_controller = ReconnectController::new(
            Duration::from_millis(configuration.reconnect_timeout_ms),
            Box::new(FullJitterBackoff::new(
                configuration.reconnect_fixed_wait_ms,
                configuration.reconnect_short_backoff_ms,
                configuration.reconnect_long_backoff_ms,
            )),
        );
        SessionCollaborators {
            signaling: SignalingClient::new(transport),
            media_stream_broker,
            peer_connection_factory,
            uplink_policy,
            downlink_policy,
            reconnect_controller,
            turn_credentials_provider: Arc::new(HttpTurnCredentialsProvider::default()),
        }
    }

    pub fn configuration(&self) -> &MeetingSessionConfiguration {
        &self.inner.context.configuration
    }

    pub fn state(&self) -> SessionStateControllerState {
        self.inner.session_state.state()
    }

    pub fn realtime(&self) -> &RealtimeController {
        &self.inner.context.realtime
    }

    pub fn add_observer(&self, observer: Arc<dyn AudioVideoObserver>) -> ObserverId {
        self.inner.context.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.context.observers.remove(id)
    }

    pub fn subscribe_session_events(&self) -> Receiver<SessionEvent> {
        self.inner.context.event_controller.subscribe_session_events()
    }

    pub fn meeting_history(&self) -> Vec<MeetingHistoryEntry> {
        self.inner.context.event_controller.meeting_history()
    }

    pub fn start(&self) -> Result<(), SessionError> {
        self.start_with(StartOptions::default())
    }

    pub fn start_with(&self, options: StartOptions) -> Result<(), SessionError> {
        if options.signaling_only {
            self.inner.pre_start_signaling();
            return Ok(());
        }
        let result = self
            .inner
            .perform_async(Action::Connect, |this| this.action_connect(false));
        match result {
            Transition::Transitioned => Ok(()),
            _ => Err(SessionError::NoTransitionAvailable {
                state: self.state().to_string(),
                action: Action::Connect.to_string(),
            }),
        }
    }

    /// Leave the meeting. Observers see `audio_video_did_stop(Left)`.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Returns whether an update was started or queued.
    pub fn update(&self, options: UpdateOptions) -> bool {
        self.inner.request_update(options.need_notify)
    }

    pub fn start_local_video(&self) -> bool {
        self.inner.context.state.lock().local_video_requested = true;
        self.inner.request_update(true)
    }

    pub fn stop_local_video(&self) -> bool {
        self.inner.context.state.lock().local_video_requested = false;
        self.inner.request_update(true)
    }

    /// Renegotiate without local video and then with it again.
    pub fn restart_local_video(&self) -> bool {
        self.inner.restart_local_video()
    }

    /// Exclude the codec currently used to send video and renegotiate.
    pub fn degrade_video_send_codec(&self) -> bool {
        {
            let mut state = self.inner.context.state.lock();
            let Some(codec) = state.current_video_send_codec.clone() else {
                return false;
            };
            if !state.degraded_video_send_codecs.contains(&codec) {
                warn!("degrading video send codec {codec}");
                state.degraded_video_send_codecs.push(codec);
            }
        }
        self.inner.restart_local_video()
    }

    /// Acquire a new microphone stream and swap it in without renegotiating.
    pub async fn restart_local_audio(&self) -> Result<(), SessionError> {
        self.inner.restart_local_audio().await
    }

    pub fn reconnect(&self, status: MeetingSessionStatus, error: Option<TaskError>) -> bool {
        self.inner.reconnect(status, error)
    }

    pub fn handle_meeting_session_status(
        &self,
        status: MeetingSessionStatus,
        error: Option<TaskError>,
    ) -> bool {
        self.inner.handle_meeting_session_status(status, error)
    }

    pub async fn handle_has_bandwidth_priority(&self, has_bandwidth_priority: bool) {
        let context = &self.inner.context;
        let change = {
            let mut uplink = context.uplink_policy.lock();
            if uplink.is_simulcast() {
                return;
            }
            let old = uplink.max_bandwidth_kbps();
            uplink.set_has_bandwidth_priority(has_bandwidth_priority);
            let new = uplink.max_bandwidth_kbps();
            (old != new).then_some((old, new))
        };
        if let Some((old, new)) = change {
            info!(
                "video send bandwidth priority {has_bandwidth_priority} max has changed from {old} kbps to {new} kbps"
            );
            self.inner.set_video_sending_bitrate(new).await;
        }
    }

    pub async fn set_video_max_bandwidth_kbps(&self, max_bandwidth_kbps: u32) -> Result<(), SessionError> {
        if max_bandwidth_kbps == 0 {
            return Err(SessionError::InvalidArgument(
                "max bandwidth kbps has to be greater than 0".into(),
            ));
        }
        info!("video send has ideal max bandwidth {max_bandwidth_kbps} kbps");
        let applied = {
            let mut uplink = self.inner.context.uplink_policy.lock();
            uplink.set_ideal_max_bandwidth_kbps(max_bandwidth_kbps);
            (!uplink.is_simulcast()).then(|| uplink.max_bandwidth_kbps())
        };
        if let Some(kbps) = applied {
            self.inner.set_video_sending_bitrate(kbps).await;
        }
        Ok(())
    }

    pub async fn pause_receiving_stream(&self, stream_id: u32) -> Result<(), SessionError> {
        Ok(self.inner.context.signaling.pause(vec![stream_id]).await?)
    }

    pub async fn resume_receiving_stream(&self, stream_id: u32) -> Result<(), SessionError> {
        Ok(self.inner.context.signaling.resume(vec![stream_id]).await?)
    }

    pub async fn send_data_message(
        &self,
        topic: impl Into<String>,
        data: Vec<u8>,
        lifetime_ms: u32,
    ) -> Result<(), SessionError> {
        let message = DataMessage {
            topic: topic.into(),
            data,
            lifetime_ms,
            ..Default::default()
        };
        Ok(self
            .inner
            .context
            .signaling
            .send_data_message(vec![message])
            .await?)
    }

    /// Attendees currently sending video, excluding ourselves.
    pub fn get_remote_video_sources(&self) -> Vec<VideoSource> {
        let context = &self.inner.context;
        context
            .state
            .lock()
            .video_stream_index
            .video_sources_excluding_self(context.self_attendee_id())
    }

    /// Feed ping and stats results. The connection start time is kept by
    /// the controller and ignored in `data`.
    pub fn connection_health_did_change(&self, data: &ConnectionHealthData) {
        self.inner.context.update_connection_health(|health| {
            health.consecutive_missed_pongs = data.consecutive_missed_pongs;
            health.consecutive_stats_with_no_packets = data.consecutive_stats_with_no_packets;
            health.audio_speaker_delay_ms = data.audio_speaker_delay_ms;
        });
    }

    /// Rank remote attendees for the downlink policy. Resubscribes when the
    /// policy's choice changes.
    pub fn choose_remote_video_sources(&self, preferences: VideoPreferences) -> bool {
        let wants_resubscribe = {
            let mut downlink = self.inner.context.downlink_policy.lock();
            downlink.choose_remote_video_sources(preferences);
            downlink.wants_resubscribe()
        };
        wants_resubscribe && self.inner.request_update(true)
    }

    /// Feed the estimated uplink bandwidth to the uplink policy.
    pub fn connection_metrics_did_change(&self, uplink_kbps: u32) {
        let wants_resubscribe = {
            let mut uplink = self.inner.context.uplink_policy.lock();
            uplink.update_connection_metric(uplink_kbps);
            uplink.wants_resubscribe()
        };
        if wants_resubscribe {
            self.inner.request_update(true);
        }
    }

    /// Stop the session, wait for it to wind down and release everything.
    pub async fn destroy(self) {
        let inner = &self.inner;
        let context = &inner.context;
        context.reconnect_controller.lock().cancel();
        if let Some(running) = inner.running.lock().take() {
            running.cancel();
        }
        inner.stop();

        let wait = Duration::from_millis(context.configuration.connection_timeout_ms * 2);
        let stopped = tokio::time::timeout(wait, async {
            while inner.session_state.state() != SessionStateControllerState::NotConnected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if stopped.is_err() {
            warn!("session did not stop within {wait:?}, releasing anyway");
        }

        context.abort_background();
        context.remove_monitor_observer();
        context.transceiver_controller.stop_all();
        context.realtime.clear();
        if context.signaling.ready() {
            if let Err(e) = context.signaling.close_connection().await {
                warn!("could not close signaling: {e}");
            }
        }
        info!("audio-video controller destroyed");
    }
}

impl SessionController for ControllerInner {
    fn update(&self, need_notify: bool) -> bool {
        self.request_update(need_notify)
    }

    fn handle_meeting_session_status(
        &self,
        status: MeetingSessionStatus,
        error: Option<TaskError>,
    ) -> bool {
        ControllerInner::handle_meeting_session_status(self, status, error)
    }
}

impl ControllerInner {
    fn wrap_task_name(&self, name: &str) -> String {
        let configuration = &self.context.configuration;
        format!(
            "{name}/{}/{}",
            configuration.meeting_id, configuration.attendee_id
        )
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.context.configuration.connection_timeout_ms)
    }

    /// Perform `action` and run `work` as a spawned task once the
    /// transition is taken.
    fn perform_async<F, Fut>(&self, action: Action, work: F) -> Transition
    where
        F: FnOnce(Arc<ControllerInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = self.this.clone();
        self.session_state.perform(action, move || {
            let this = this.upgrade().ok_or(SessionError::ControllerDropped)?;
            tokio::spawn(work(this));
            Ok(())
        })
    }

    async fn run_pipeline(&self, pipeline: TaskRef) -> Result<(), TaskError> {
        *self.running.lock() = Some(pipeline.clone());
        let result = run_task(pipeline.as_ref()).await;
        self.running.lock().take();
        result
    }

    fn pre_start_signaling(&self) {
        let open = self
            .pre_started_signaling
            .lock()
            .get_or_insert_with(|| {
                task(OnceTask::new(task(OpenSignalingConnectionTask::new(
                    self.context.clone(),
                ))))
            })
            .clone();
        tokio::spawn(async move {
            if let Err(e) = run_task(open.as_ref()).await {
                warn!("could not pre-open signaling: {e}");
            }
        });
    }

    fn stop(&self) {
        self.context.reconnect_controller.lock().cancel();
        let status = MeetingSessionStatus::new(MeetingSessionStatusCode::Left);
        self.perform_async(Action::Disconnect, move |this| async move {
            this.action_disconnect(status, false, None).await
        });
    }

    fn request_update(&self, need_notify: bool) -> bool {
        let result = self.perform_async(Action::Update, move |this| async move {
            let result = this.run_update().await;
            this.finish_update(result, need_notify).await;
        });
        matches!(result, Transition::Transitioned | Transition::DeferredTransition)
    }

    fn restart_local_video(&self) -> bool {
        let result = self.perform_async(Action::Update, |this| async move {
            let result = this.restart_video().await;
            this.finish_update(result, true).await;
        });
        matches!(result, Transition::Transitioned | Transition::DeferredTransition)
    }

    /// A fresh state for a new connection. The local video request and
    /// degraded codecs carry over.
    fn renew_session_state(&self) {
        let mut state = self.context.state.lock();
        let mut fresh = SessionState::new(&self.context.configuration);
        fresh.local_video_requested = state.local_video_requested;
        fresh.degraded_video_send_codecs = std::mem::take(&mut state.degraded_video_send_codecs);
        fresh.audio_input = state.audio_input.take();
        fresh.video_input = state.video_input.take();
        fresh.connect_requested_at = Some(Instant::now());
        *state = fresh;
    }

    fn connect_pipeline(&self) -> TaskRef {
        let context = &self.context;
        let configuration = &context.configuration;
        let open_signaling = self
            .pre_started_signaling
            .lock()
            .take()
            .unwrap_or_else(|| task(OpenSignalingConnectionTask::new(context.clone())));

        let finalize = if configuration.attendee_presence_timeout_ms > 0 {
            task(TimeoutTask::new(
                task(ParallelGroupTask::new(
                    "FinalizeConnection",
                    vec![
                        task(WaitForAttendeePresenceTask::new(context.clone())),
                        task(SetRemoteDescriptionTask::new(context.clone())),
                    ],
                )),
                Duration::from_millis(configuration.attendee_presence_timeout_ms),
            ))
        } else {
            task(SetRemoteDescriptionTask::new(context.clone()))
        };

        let signaling = task(SerialGroupTask::new(
            "Signaling",
            vec![
                open_signaling,
                task(ListenForVolumeIndicatorsTask::new(context.clone())),
                task(SendAndReceiveDataMessagesTask::new(context.clone())),
                task(JoinAndReceiveIndexTask::new(context.clone())),
                task(ReceiveTurnCredentialsTask::new(context.clone())),
                task(ReceiveVideoStreamIndexTask::new(context.clone())),
            ],
        ));
        let peer = task(SerialGroupTask::new(
            "Peer",
            vec![
                task(CreatePeerConnectionTask::new(context.clone())),
                task(ReceiveVideoInputTask::new(context.clone())),
                task(AttachMediaInputTask::new(context.clone())),
                task(CreateSdpTask::new(context.clone())),
                task(SetLocalDescriptionTask::new(context.clone())),
                task(FinishGatheringIceCandidatesTask::new(context.clone())),
                task(SubscribeAndReceiveSubscribeAckTask::new(context.clone())),
                task(ReceiveRemoteVideoPauseResumeTask::new(context.clone())),
                finalize,
            ],
        ));

        task(SerialGroupTask::new(
            self.wrap_task_name("AudioVideoStart"),
            vec![
                task(MonitorTask::new(context.clone())),
                task(ReceiveAudioInputTask::new(context.clone())),
                task(TimeoutTask::new(
                    task(SerialGroupTask::new("Media", vec![signaling, peer])),
                    self.connection_timeout(),
                )),
            ],
        ))
    }

    fn reconnect_pipeline(&self) -> TaskRef {
        let context = &self.context;
        let peer_only = context
            .reconnect_controller
            .lock()
            .should_only_restart_peer_connection();
        let mut steps = Vec::new();
        if peer_only {
            info!("signaling is healthy, only restarting the peer connection");
            steps.push(task(
                CleanRestartedSessionTask::new(context.clone()).keeping_signaling(),
            ));
        } else {
            steps.push(task(CleanRestartedSessionTask::new(context.clone())));
            steps.push(task(SerialGroupTask::new(
                "Signaling",
                vec![
                    task(OpenSignalingConnectionTask::new(context.clone())),
                    task(JoinAndReceiveIndexTask::new(context.clone())),
                    task(ReceiveTurnCredentialsTask::new(context.clone())),
                ],
            )));
        }
        steps.push(task(CreatePeerConnectionTask::new(context.clone())));
        let media = task(SerialGroupTask::new("Media", steps));
        task(SerialGroupTask::new(
            self.wrap_task_name("AudioVideoReconnect"),
            vec![
                task(TimeoutTask::new(media, self.connection_timeout())),
                task(ReceiveVideoInputTask::new(context.clone())),
                task(TimeoutTask::new(
                    self.negotiation(SetRemoteDescriptionTask::new(context.clone())),
                    self.connection_timeout(),
                )),
            ],
        ))
    }

    fn negotiation(&self, set_remote: SetRemoteDescriptionTask) -> TaskRef {
        let context = &self.context;
        task(SerialGroupTask::new(
            "UpdateSession",
            vec![
                task(AttachMediaInputTask::new(context.clone())),
                task(CreateSdpTask::new(context.clone())),
                task(SetLocalDescriptionTask::new(context.clone())),
                task(FinishGatheringIceCandidatesTask::new(context.clone())),
                task(SubscribeAndReceiveSubscribeAckTask::new(context.clone())),
                task(set_remote),
            ],
        ))
    }

    async fn action_connect(self: Arc<Self>, reconnecting: bool) {
        let context = &self.context;
        context.reset_connection_health();
        context.pause_ingestion();
        self.renew_session_state();

        if !reconnecting {
            self.total_retry_count.store(0, Ordering::SeqCst);
            context.reconnect_controller.lock().reset();
            context
                .observers
                .for_each(|o| o.audio_video_did_start_connecting(false));
            context.publish_event(
                AudioVideoEventName::MeetingStartRequested,
                AudioVideoEventAttributes::default(),
            );
        }
        context
            .reconnect_controller
            .lock()
            .started_connection_attempt();

        let result = self.run_pipeline(self.connect_pipeline()).await;
        match result {
            Ok(()) => {
                self.apply_initial_send_parameters().await;
                let this = self.clone();
                self.session_state.perform(Action::FinishConnecting, move || {
                    this.finish_connecting(false);
                    Ok(())
                });
            }
            Err(error) => {
                self.perform_async(Action::Fail, move |this| async move {
                    let status = MeetingSessionStatus::from_task_error(&error);
                    this.action_disconnect(status, true, Some(error.clone()))
                        .await;
                    if !this.handle_meeting_session_status(status, Some(error.clone())) {
                        this.notify_stop(status, Some(&error));
                    }
                });
            }
        }
        context.reset_connection_health();
    }

    async fn action_reconnect(self: Arc<Self>) {
        let context = &self.context;
        let first_attempt = {
            let mut reconnect_controller = context.reconnect_controller.lock();
            let first = !reconnect_controller.has_started_connection_attempt();
            if first {
                reconnect_controller.started_connection_attempt();
            }
            first
        };
        if first_attempt {
            context
                .observers
                .for_each(|o| o.audio_video_did_start_connecting(true));
        }
        context.reset_connection_health();
        context.pause_ingestion();

        let result = self.run_pipeline(self.reconnect_pipeline()).await;
        match result {
            Ok(()) => {
                self.apply_initial_send_parameters().await;
                let this = self.clone();
                self.session_state.perform(Action::FinishConnecting, move || {
                    this.finish_connecting(true);
                    Ok(())
                });
            }
            Err(error) => {
                // Back to Connected so the next retry can perform Reconnect.
                let this = self.clone();
                self.session_state.perform(Action::FinishConnecting, move || {
                    info!("failed to reconnect audio-video session");
                    let status = MeetingSessionStatus::from_task_error(&error);
                    this.handle_meeting_session_status(status, Some(error));
                    Ok(())
                });
            }
        }
        context.reset_connection_health();
    }

    fn finish_connecting(&self, reconnected: bool) {
        let context = &self.context;
        context.resume_ingestion();
        let attributes = {
            let mut state = context.state.lock();
            if !reconnected {
                state.meeting_start_duration_ms = state
                    .connect_requested_at
                    .map(|at| at.elapsed().as_millis() as u64);
            }
            if state.started_at.is_none() {
                state.started_at = Some(Instant::now());
            }
            AudioVideoEventAttributes {
                max_video_tile_count: Some(state.max_video_tile_count),
                poor_connection_count: Some(state.poor_connection_count),
                retry_count: Some(self.total_retry_count.load(Ordering::SeqCst)),
                signaling_open_duration_ms: state.signaling_open_duration_ms,
                ice_gathering_duration_ms: state.ice_gathering_duration_ms,
                attendee_presence_duration_ms: state.attendee_presence_duration_ms,
                meeting_start_duration_ms: state.meeting_start_duration_ms,
                ..Default::default()
            }
        };
        let name = if reconnected {
            AudioVideoEventName::MeetingReconnected
        } else {
            AudioVideoEventName::MeetingStartSucceeded
        };
        context.publish_event(name, attributes);
        context.observers.for_each(|o| o.audio_video_did_start());
        context.reconnect_controller.lock().reset();
    }

    async fn apply_initial_send_parameters(&self) {
        let parameters = self
            .context
            .uplink_policy
            .lock()
            .choose_encoding_parameters();
        self.apply_encoding_parameters(parameters).await;
        self.enforce_send_bandwidth().await;
    }

    async fn action_disconnect(
        self: &Arc<Self>,
        status: MeetingSessionStatus,
        reconnecting: bool,
        error: Option<TaskError>,
    ) {
        let context = &self.context;
        let timeout = self.connection_timeout();
        let leave = SerialGroupTask::new(
            self.wrap_task_name("AudioVideoStop"),
            vec![task(TimeoutTask::new(
                task(LeaveAndReceiveLeaveAckTask::new(context.clone())),
                timeout,
            ))],
        );
        if run_task(&leave).await.is_err() {
            info!("fail to stop");
        }
        let clean = SerialGroupTask::new(
            self.wrap_task_name("AudioVideoClean"),
            vec![task(TimeoutTask::new(
                task(CleanStoppedSessionTask::new(context.clone())),
                timeout,
            ))],
        );
        if run_task(&clean).await.is_err() {
            info!("fail to clean");
        }

        let this = self.clone();
        self.session_state
            .perform(Action::FinishDisconnecting, move || {
                if !reconnecting {
                    this.notify_stop(status, error.as_ref());
                }
                Ok(())
            });
    }

    /// The single exit notification for a session: `audio_video_did_stop`
    /// plus one of meetingStartFailed, meetingFailed or meetingEnded.
    fn notify_stop(&self, status: MeetingSessionStatus, error: Option<&TaskError>) {
        let context = &self.context;
        context
            .observers
            .for_each(|o| o.audio_video_did_stop(status));

        let (started, mut attributes) = {
            let state = context.state.lock();
            (
                state.started_at.is_some(),
                AudioVideoEventAttributes {
                    max_video_tile_count: Some(state.max_video_tile_count),
                    meeting_duration_ms: Some(state.meeting_duration_ms()),
                    meeting_status: Some(status.status_code().to_string()),
                    signaling_open_duration_ms: state.signaling_open_duration_ms,
                    poor_connection_count: Some(state.poor_connection_count),
                    retry_count: Some(self.total_retry_count.load(Ordering::SeqCst)),
                    ..Default::default()
                },
            )
        };
        let error_message = error.map(|e| e.to_string()).unwrap_or_default();

        let name = if !started {
            attributes.meeting_duration_ms = None;
            attributes.meeting_error_message = Some(error_message);
            AudioVideoEventName::MeetingStartFailed
        } else if status.is_failure() || status.is_audio_connection_failure() {
            attributes.meeting_error_message = Some(error_message);
            AudioVideoEventName::MeetingFailed
        } else {
            AudioVideoEventName::MeetingEnded
        };
        context.publish_event(name, attributes);
    }

    fn handle_meeting_session_status(
        &self,
        status: MeetingSessionStatus,
        error: Option<TaskError>,
    ) -> bool {
        info!("handling status: {}", status.status_code());
        match status.status_code() {
            MeetingSessionStatusCode::IncompatibleSDP => {
                self.restart_local_video();
                info!("handled incompatible SDP by attempting to restart video");
                return true;
            }
            MeetingSessionStatusCode::VideoCallSwitchToViewOnly => {
                self.context.state.lock().local_video_requested = false;
                self.context
                    .observers
                    .for_each(|o| o.video_send_did_become_unavailable());
                self.request_update(true);
                return false;
            }
            _ => {}
        }
        if status.status_code() == MeetingSessionStatusCode::ICEGatheringTimeoutWorkaround
            && self.context.signaling.ready()
        {
            self.context
                .reconnect_controller
                .lock()
                .enable_restart_peer_connection();
        }
        if status.is_terminal() {
            error!("session will not be reconnected");
            self.context.reconnect_controller.lock().disable_reconnect();
        }
        if !(status.is_failure() || status.is_terminal()) {
            return false;
        }

        let suffix = error
            .as_ref()
            .map(|e| format!(" and error: {e}"))
            .unwrap_or_default();
        let will_retry = self.reconnect(status, error);
        if will_retry {
            warn!("will retry due to status code {}{suffix}", status.status_code());
        } else {
            error!("failed with status code {}{suffix}", status.status_code());
        }
        will_retry
    }

    fn reconnect(&self, status: MeetingSessionStatus, error: Option<TaskError>) -> bool {
        let this = self.this.clone();
        let will_retry = self
            .context
            .reconnect_controller
            .lock()
            .retry_with_backoff(async move {
                if let Some(this) = this.upgrade() {
                    this.retry();
                }
            });
        if !will_retry {
            self.perform_async(Action::Fail, move |this| async move {
                this.action_disconnect(status, false, error).await
            });
        }
        will_retry
    }

    fn retry(&self) {
        self.total_retry_count.fetch_add(1, Ordering::SeqCst);
        if self.session_state.state() == SessionStateControllerState::NotConnected {
            self.perform_async(Action::Connect, |this| this.action_connect(true));
        } else {
            self.perform_async(Action::Reconnect, |this| this.action_reconnect());
        }
    }

    async fn restart_video(&self) -> Result<(), TaskError> {
        let sending = {
            let state = self.context.state.lock();
            state.local_video_requested && state.video_input.is_some()
        };
        if sending {
            info!("stopping local video prior to local video restart");
            self.context.state.lock().local_video_requested = false;
            let without_video = self.run_update().await;
            self.context.state.lock().local_video_requested = true;
            without_video?;
            info!("starting local video for local video restart");
        }
        info!("finalizing local video restart update");
        self.run_update().await
    }

    async fn restart_local_audio(&self) -> Result<(), SessionError> {
        let context = &self.context;
        let stream = context
            .media_stream_broker
            .acquire_audio_input_stream()
            .await?;
        let track = stream
            .first_track(MediaKind::Audio)
            .cloned()
            .ok_or_else(|| MediaError::Acquire {
                kind: "audio",
                reason: "no audio track in the new stream".into(),
            })?;
        context.reset_connection_health();
        if context.state.lock().peer.is_none() {
            context.media_stream_broker.release_media_stream(&stream).await;
            return Err(SessionError::NoActiveSession);
        }

        let replaced = context.transceiver_controller.replace_audio_track(track).await?;
        let previous = context.state.lock().audio_input.replace(stream);
        if let Some(previous) = previous {
            context.media_stream_broker.release_media_stream(&previous).await;
        }
        if !replaced {
            return Err(MediaError::PeerConnection("could not replace the audio track".into()).into());
        }
        Ok(())
    }

    async fn finish_update(self: &Arc<Self>, result: Result<(), TaskError>, need_notify: bool) {
        match result {
            Ok(()) => {
                if need_notify {
                    self.enforce_send_bandwidth().await;
                }
                self.session_state.perform(Action::FinishUpdating, || {
                    info!("updated audio-video session");
                    Ok(())
                });
            }
            Err(error) => {
                let this = self.clone();
                self.session_state.perform(Action::FinishUpdating, move || {
                    let status = MeetingSessionStatus::from_task_error(&error);
                    if status.status_code() != MeetingSessionStatusCode::IncompatibleSDP {
                        info!("failed to update audio-video session");
                    }
                    this.handle_meeting_session_status(status, Some(error));
                    Ok(())
                });
            }
        }
    }

    /// One update pass: bring the camera in line with the request, then
    /// carry out the cheapest change that reaches the wanted subscriptions
    /// and encodings.
    async fn run_update(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let _update = context.update_lock.lock().await;

        let previous_video = context
            .state
            .lock()
            .video_input
            .as_ref()
            .map(|s| s.id.clone());
        run_task(&ReceiveVideoInputTask::new(context.clone())).await?;

        let requested = self.refresh_videos_to_receive();
        let encoding_parameters = context.uplink_policy.lock().choose_encoding_parameters();
        let inputs = self.update_inputs(previous_video, &encoding_parameters);
        let decision = decide_update(&inputs);
        debug!("update decision {decision:?}");

        match decision {
            UpdateDecision::Renegotiate => {
                let pipeline = task(TimeoutTask::new(
                    task(SerialGroupTask::new(
                        self.wrap_task_name("AudioVideoUpdate"),
                        vec![self.negotiation(
                            SetRemoteDescriptionTask::new(context.clone()).for_update(),
                        )],
                    )),
                    self.connection_timeout(),
                ));
                self.run_pipeline(pipeline).await?;
            }
            UpdateDecision::SubscribeOnly(switched) => {
                self.remap_switched_streams(&switched);
                let pipeline = task(TimeoutTask::new(
                    task(
                        SubscribeAndReceiveSubscribeAckTask::new(context.clone())
                            .without_renegotiation(),
                    ),
                    self.connection_timeout(),
                ));
                self.run_pipeline(pipeline).await?;
            }
            UpdateDecision::RemoteVideoUpdate(switched) => {
                self.remap_switched_streams(&switched);
                self.send_remote_video_update().await?;
            }
            UpdateDecision::EncodingOnly | UpdateDecision::None => {}
        }

        self.apply_encoding_parameters(encoding_parameters).await;
        context.state.lock().last_videos_to_receive = Some(requested);
        Ok(())
    }

    /// Takes the downlink policy's latest choice if it wants one and
    /// returns the receive set this pass works towards. Callers hold
    /// `update_lock`.
    fn refresh_videos_to_receive(&self) -> BTreeSet<u32> {
        let context = &self.context;
        let mut state = context.state.lock();
        let mut downlink = context.downlink_policy.lock();
        if downlink.wants_resubscribe() {
            state.videos_to_receive = downlink.choose_subscriptions();
            debug!("videos to receive {:?}", state.videos_to_receive);
        }
        state.videos_to_receive.clone()
    }

    fn update_inputs(
        &self,
        previous_video: Option<String>,
        encoding_parameters: &EncodingParameters,
    ) -> UpdateInputs {
        let state = self.context.state.lock();
        let current_video = state.video_input.as_ref().map(|s| s.id.clone());
        let last_videos_to_receive = state.last_videos_to_receive.clone().unwrap_or_default();
        UpdateInputs {
            has_peer_connection: state.peer.is_some() && state.last_videos_to_receive.is_some(),
            local_video_changed: previous_video != current_video,
            server_adapts_remote_video: state.server_side_network_adaption.adapts_remote_video(),
            video_changes: detect_changes_in_videos_to_receive(
                &state.video_stream_index,
                &state.videos_to_receive,
                &last_videos_to_receive,
            ),
            encoding: EncodingChange::between(
                state.last_encoding_parameters.as_ref(),
                encoding_parameters,
            ),
            answer_has_layers_allocation: state.sdp_answer.as_deref().is_some_and(|sdp| {
                has_video_header_extension(sdp, VIDEO_LAYERS_ALLOCATION_EXTENSION)
            }),
        }
    }

    fn remap_switched_streams(&self, switched: &BTreeMap<u32, u32>) {
        let transceivers = &self.context.transceiver_controller;
        for (&old, &new) in switched {
            match transceivers.get_mid_for_stream_id(old) {
                Some(mid) => {
                    debug!("switching mid {mid} from stream {old} to {new}");
                    transceivers.set_stream_id_for_mid(&mid, new);
                }
                None => warn!("no transceiver carries stream {old}"),
            }
        }
        self.context.state.lock().video_subscriptions = transceivers.video_subscriptions();
    }

    async fn send_remote_video_update(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let (frame, next) = {
            let state = context.state.lock();
            let next = video_subscription_configuration(
                &state.video_stream_index,
                &state.videos_to_receive,
                context.downlink_policy.lock().video_preferences(),
                |stream_id| context.transceiver_controller.get_mid_for_stream_id(stream_id),
            );
            (
                remote_video_update_frame(&state.last_video_subscription_configuration, &next),
                next,
            )
        };
        debug!(
            "remote video update: {} added or updated, {} removed",
            frame.added_or_updated_video_subscriptions.len(),
            frame.removed_video_subscription_mids.len()
        );
        context
            .signaling
            .remote_video_update(frame)
            .await
            .map_err(|e| TaskError::failed("RemoteVideoUpdate", e.to_string()))?;
        context.state.lock().last_video_subscription_configuration = next;
        Ok(())
    }

    async fn apply_encoding_parameters(&self, parameters: EncodingParameters) {
        let context = &self.context;
        if !context.transceiver_controller.has_video_input() {
            return;
        }
        if context.state.lock().last_encoding_parameters.as_ref() == Some(&parameters) {
            return;
        }
        match context
            .transceiver_controller
            .set_encoding_parameters(&parameters)
            .await
        {
            Ok(()) => context.state.lock().last_encoding_parameters = Some(parameters),
            Err(e) => warn!("could not apply encoding parameters: {e}"),
        }
        let layers = context
            .uplink_policy
            .lock()
            .take_encoding_simulcast_layers_change();
        if let Some(layers) = layers {
            context
                .observers
                .for_each(|o| o.encoding_simulcast_layers_did_change(layers));
        }
    }

    /// Simulcast encodings carry their own bitrates.
    async fn enforce_send_bandwidth(&self) {
        if self.context.uplink_policy.lock().is_simulcast() {
            return;
        }
        let kbps = self
            .context
            .state
            .lock()
            .video_capture_and_encode_parameters
            .max_encode_bitrate_kbps;
        self.set_video_sending_bitrate(kbps).await;
    }

    async fn set_video_sending_bitrate(&self, kbps: u32) {
        if let Err(e) = self
            .context
            .transceiver_controller
            .set_video_sending_bitrate_kbps(kbps)
            .await
        {
            warn!("could not set the video send bitrate: {e}");
        }
    }
}
