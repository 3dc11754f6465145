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

//! Tasks that talk to the signaling server.

use super::{cancellable, Task};
use crate::errors::TaskError;
use crate::session_state::SessionContext;
use crate::signaling_client::{wait_for_frame, SignalingClientEvent, SignalingConnectionRequest};
use crate::status::{MeetingSessionStatus, MeetingSessionStatusCode};
use async_broadcast::RecvError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use videocall_types::{
    JoinFrame, ServerSideNetworkAdaption, SignalFrame, SignalMessage, SIGNALING_PROTOCOL_VERSION,
};

const MAX_NUM_OF_VIDEOS: u32 = 16;

/// Run `handler` for every received frame until the session's listeners are
/// aborted. The listener holds the context weakly.
pub(crate) fn spawn_frame_listener<H>(context: &Arc<SessionContext>, handler: H)
where
    H: Fn(&SessionContext, &SignalFrame) + Send + 'static,
{
    let mut events = context.signaling.subscribe_events();
    let weak = Arc::downgrade(context);
    context.spawn_background(async move {
        loop {
            match events.recv().await {
                Ok(SignalingClientEvent::ReceivedSignalFrame(frame)) => {
                    let Some(context) = weak.upgrade() else {
                        break;
                    };
                    handler(&context, &frame);
                }
                Ok(_) => {}
                Err(RecvError::Overflowed(skipped)) => {
                    warn!("frame listener fell behind, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Opens the signaling connection. Usually wrapped in a
/// [`OnceTask`](super::OnceTask) so it can be started ahead of the connect
/// pipeline.
pub struct OpenSignalingConnectionTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl OpenSignalingConnectionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for OpenSignalingConnectionTask {
    fn name(&self) -> String {
        "OpenSignalingConnectionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let request =
            SignalingConnectionRequest::new(context.configuration.signaling_url_with_token());
        let started = Instant::now();
        cancellable(
            &self.cancel,
            &self.name(),
            context.signaling.open_connection(&request),
        )
        .await?
        .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;

        let elapsed = started.elapsed().as_millis() as u64;
        info!("signaling connection took {elapsed}ms");
        context.state.lock().signaling_open_duration_ms = Some(elapsed);
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Feeds attendee presence and volume frames to the realtime controller.
pub struct ListenForVolumeIndicatorsTask {
    context: Arc<SessionContext>,
}

impl ListenForVolumeIndicatorsTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for ListenForVolumeIndicatorsTask {
    fn name(&self) -> String {
        "ListenForVolumeIndicatorsTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        spawn_frame_listener(&self.context, |context, frame| match &frame.message {
            SignalMessage::AudioStreamIdInfo(info) => {
                context.realtime.handle_audio_stream_id_info(info)
            }
            SignalMessage::AudioMetadata(metadata) => {
                context.realtime.handle_audio_metadata(metadata)
            }
            _ => {}
        });
        Ok(())
    }
}

pub struct SendAndReceiveDataMessagesTask {
    context: Arc<SessionContext>,
}

impl SendAndReceiveDataMessagesTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for SendAndReceiveDataMessagesTask {
    fn name(&self) -> String {
        "SendAndReceiveDataMessagesTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        spawn_frame_listener(&self.context, |context, frame| {
            if let SignalMessage::DataMessage(data) = &frame.message {
                context.realtime.handle_data_messages(&data.messages);
            }
        });
        Ok(())
    }
}

/// Sends JOIN, records what the server offers in JOIN_ACK and waits for
/// the first INDEX.
pub struct JoinAndReceiveIndexTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl JoinAndReceiveIndexTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }

    fn join_frame(&self) -> JoinFrame {
        JoinFrame {
            protocol_version: SIGNALING_PROTOCOL_VERSION,
            max_num_of_videos: MAX_NUM_OF_VIDEOS,
            attendee_id: self.context.configuration.attendee_id.clone(),
            server_side_network_adaption: self.context.configuration.server_side_network_adaption,
            supported_server_side_network_adaptions: vec![
                ServerSideNetworkAdaption::BandwidthProbing,
                ServerSideNetworkAdaption::BandwidthProbingAndRemoteVideoQualityAdaption,
            ],
            wants_all_temporal_layers_in_index: false,
        }
    }

    async fn receive_index(
        &self,
        events: &mut async_broadcast::Receiver<SignalingClientEvent>,
    ) -> Result<(), TaskError> {
        let context = &self.context;
        loop {
            let frame = match events.recv().await {
                Ok(SignalingClientEvent::ReceivedSignalFrame(frame)) => frame,
                Ok(SignalingClientEvent::WebSocketClosed { code, reason }) => {
                    return Err(TaskError::failed(
                        self.name(),
                        format!("signaling closed before the index arrived: {code} {reason}"),
                    ))
                }
                Ok(SignalingClientEvent::WebSocketFailed(message)) => {
                    return Err(TaskError::failed(self.name(), message))
                }
                Ok(_) => continue,
                Err(RecvError::Overflowed(skipped)) => {
                    warn!("join listener skipped {skipped} events");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return Err(TaskError::failed(self.name(), "signaling client is gone"))
                }
            };

            if frame.error.is_some() {
                let status = MeetingSessionStatus::from_signal_frame(&frame);
                if status.status_code() != MeetingSessionStatusCode::OK {
                    return Err(TaskError::with_status(
                        self.name(),
                        status.status_code(),
                        format!("server rejected join: {}", status.description()),
                    ));
                }
            }

            match frame.message {
                SignalMessage::JoinAck(ack) => {
                    let mut state = context.state.lock();
                    if let Some(limit) = ack.video_subscription_limit {
                        state.video_subscription_limit = limit as usize;
                        context
                            .downlink_policy
                            .lock()
                            .set_subscription_limit(limit as usize);
                    }
                    if let Some(adaption) = ack.default_server_side_network_adaption {
                        if context.configuration.server_side_network_adaption
                            == ServerSideNetworkAdaption::Default
                        {
                            debug!("server chose network adaption {adaption:?}");
                            state.server_side_network_adaption = adaption;
                        }
                    }
                    context
                        .downlink_policy
                        .lock()
                        .set_server_side_network_adaption(state.server_side_network_adaption);
                    state.turn_credentials = ack.turn_credentials;
                }
                SignalMessage::Index(index) => {
                    debug!("received first index with {} sources", index.sources.len());
                    context.state.lock().index_frame = Some(index);
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Task for JoinAndReceiveIndexTask {
    fn name(&self) -> String {
        "JoinAndReceiveIndexTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let mut events = self.context.signaling.subscribe_events();
        self.context
            .signaling
            .join(self.join_frame())
            .await
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        cancellable(&self.cancel, &self.name(), self.receive_index(&mut events)).await?
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct LeaveAndReceiveLeaveAckTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl LeaveAndReceiveLeaveAckTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for LeaveAndReceiveLeaveAckTask {
    fn name(&self) -> String {
        "LeaveAndReceiveLeaveAckTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let signaling = &self.context.signaling;
        if !signaling.ready() {
            info!("signaling is not open, skipping leave");
            return Ok(());
        }
        let mut events = signaling.subscribe_events();
        signaling
            .leave()
            .await
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        match cancellable(
            &self.cancel,
            &self.name(),
            wait_for_frame(&mut events, videocall_types::FrameType::LeaveAck),
        )
        .await?
        {
            Ok(_) => info!("leave acknowledged"),
            Err(e) => info!("signaling ended before the leave ack: {e}"),
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Tracks which of our received streams the server paused.
pub struct ReceiveRemoteVideoPauseResumeTask {
    context: Arc<SessionContext>,
}

impl ReceiveRemoteVideoPauseResumeTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for ReceiveRemoteVideoPauseResumeTask {
    fn name(&self) -> String {
        "ReceiveRemoteVideoPauseResumeTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        spawn_frame_listener(&self.context, |context, frame| match &frame.message {
            SignalMessage::Pause(pause) => {
                debug!("server paused {:?}", pause.stream_ids);
                context
                    .state
                    .lock()
                    .videos_paused
                    .extend(pause.stream_ids.iter().copied());
            }
            SignalMessage::Resume(resume) => {
                debug!("server resumed {:?}", resume.stream_ids);
                let mut state = context.state.lock();
                for stream_id in &resume.stream_ids {
                    state.videos_paused.remove(stream_id);
                }
            }
            _ => {}
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{harness, ScriptedTransport};
    use crate::task::run_task;
    use videocall_types::{ErrorFrame, FrameType, JoinAckFrame};

    #[tokio::test]
    async fn join_records_server_capabilities_and_first_index() {
        let transport = Arc::new(ScriptedTransport::default());
        let context = harness(transport.clone());
        run_task(&OpenSignalingConnectionTask::new(context.clone()))
            .await
            .unwrap();
        run_task(&JoinAndReceiveIndexTask::new(context.clone()))
            .await
            .unwrap();

        let state = context.state.lock();
        assert!(state.signaling_open_duration_ms.is_some());
        assert_eq!(state.video_subscription_limit, 25);
        assert!(state.index_frame.is_some());
        assert_eq!(transport.sent_types(), vec![FrameType::Join]);
    }

    #[tokio::test]
    async fn join_error_frames_carry_a_status() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.unanswered.lock().insert(FrameType::Join);
        let context = harness(transport.clone());
        run_task(&OpenSignalingConnectionTask::new(context.clone()))
            .await
            .unwrap();

        let join = Arc::new(JoinAndReceiveIndexTask::new(context.clone()));
        let running = tokio::spawn({
            let join = join.clone();
            async move { join.run().await }
        });
        tokio::task::yield_now().await;
        while transport.sent_types().is_empty() {
            tokio::task::yield_now().await;
        }
        transport
            .push(
                SignalFrame::new(SignalMessage::JoinAck(JoinAckFrame::default())).with_error(
                    ErrorFrame {
                        status: 403,
                        description: "forbidden".into(),
                    },
                ),
            )
            .await;

        let err = running.await.unwrap().unwrap_err();
        assert_eq!(
            err.status_code(),
            Some(MeetingSessionStatusCode::AudioAuthenticationRejected)
        );
        assert!(context.state.lock().index_frame.is_none());
    }

    #[tokio::test]
    async fn leave_is_skipped_when_signaling_is_closed() {
        let transport = Arc::new(ScriptedTransport::default());
        let context = harness(transport.clone());
        run_task(&LeaveAndReceiveLeaveAckTask::new(context))
            .await
            .unwrap();
        assert!(transport.sent_types().is_empty());
    }
}
