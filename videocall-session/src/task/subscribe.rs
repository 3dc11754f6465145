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

use super::{cancellable, Task};
use crate::errors::TaskError;
use crate::session_state::SessionContext;
use crate::signaling_client::wait_for_frame;
use crate::status::{MeetingSessionStatus, MeetingSessionStatusCode};
use crate::subscription_diff::video_subscription_configuration;
use async_trait::async_trait;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use videocall_types::{
    FrameType, MediaType, SignalMessage, StreamDescriptor, SubscribeFrame,
    VideoSubscriptionConfiguration,
};

/// Sends SUBSCRIBE with the local offer and what we want to receive, then
/// waits for SUBSCRIBE_ACK.
pub struct SubscribeAndReceiveSubscribeAckTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
    record_answer: bool,
}

impl SubscribeAndReceiveSubscribeAckTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
            record_answer: true,
        }
    }

    /// Resubscribe over the current negotiation. The answer in the ack is
    /// not recorded since it will never be applied.
    pub fn without_renegotiation(mut self) -> Self {
        self.record_answer = false;
        self
    }

    fn build_frame(&self) -> Result<PendingSubscribe, TaskError> {
        let context = &self.context;
        let state = context.state.lock();
        let sdp_offer = state
            .sdp_offer
            .clone()
            .ok_or_else(|| TaskError::failed(self.name(), "no local offer to subscribe with"))?;

        let mut send_streams = Vec::new();
        if let Some(track) = state.audio_track() {
            send_streams.push(StreamDescriptor {
                attendee_id: context.self_attendee_id().to_string(),
                media_type: MediaType::Audio,
                track_label: track.id,
                ..Default::default()
            });
        }
        if let Some(track) = state.video_track() {
            let parameters = state.video_capture_and_encode_parameters;
            send_streams.push(StreamDescriptor {
                attendee_id: context.self_attendee_id().to_string(),
                media_type: MediaType::Video,
                track_label: track.id,
                max_bitrate_kbps: parameters.max_encode_bitrate_kbps,
                width: parameters.capture_width,
                height: parameters.capture_height,
                framerate: parameters.capture_frame_rate,
                ..Default::default()
            });
        }

        let configuration = if state.server_side_network_adaption.adapts_remote_video() {
            video_subscription_configuration(
                &state.video_stream_index,
                &state.videos_to_receive,
                context.downlink_policy.lock().video_preferences(),
                |stream_id| context.transceiver_controller.get_mid_for_stream_id(stream_id),
            )
        } else {
            BTreeMap::new()
        };

        let frame = SubscribeFrame {
            duplex: state.video_duplex_mode,
            sdp_offer,
            receive_stream_ids: state.video_subscriptions.clone(),
            send_streams,
            audio_muted: context.realtime.is_local_audio_muted(),
            audio_checkin: false,
            video_subscription_configuration: configuration.values().cloned().collect(),
        };
        Ok(PendingSubscribe {
            frame,
            configuration,
            videos_to_receive: state.videos_to_receive.clone(),
        })
    }
}

/// A SUBSCRIBE about to be sent, with the receive set it was built from.
struct PendingSubscribe {
    frame: SubscribeFrame,
    configuration: BTreeMap<u32, VideoSubscriptionConfiguration>,
    videos_to_receive: BTreeSet<u32>,
}

#[async_trait]
impl Task for SubscribeAndReceiveSubscribeAckTask {
    fn name(&self) -> String {
        "SubscribeAndReceiveSubscribeAckTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let PendingSubscribe {
            frame,
            configuration,
            videos_to_receive,
        } = self.build_frame()?;
        debug!("subscribing to {:?}", frame.receive_stream_ids);

        let mut events = context.signaling.subscribe_events();
        context
            .signaling
            .subscribe(frame)
            .await
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        let reply = cancellable(
            &self.cancel,
            &self.name(),
            wait_for_frame(&mut events, FrameType::SubscribeAck),
        )
        .await?
        .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;

        let status = MeetingSessionStatus::from_signal_frame(&reply);
        if status.status_code() != MeetingSessionStatusCode::OK {
            return Err(TaskError::with_status(
                self.name(),
                status.status_code(),
                format!("server rejected subscribe: {}", status.description()),
            ));
        }
        let SignalMessage::SubscribeAck(ack) = reply.message else {
            return Err(TaskError::failed(self.name(), "unexpected reply to subscribe"));
        };

        let mut state = context.state.lock();
        if self.record_answer {
            state.sdp_answer = Some(ack.sdp_answer.clone());
        }
        state.video_stream_index.integrate_subscribe_ack_frame(ack);
        state.last_videos_to_receive = Some(videos_to_receive);
        if !configuration.is_empty() {
            state.last_video_subscription_configuration = configuration;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{harness, ScriptedTransport, ANSWER_SDP};
    use crate::task::{run_task, OpenSignalingConnectionTask};

    #[tokio::test]
    async fn ack_records_the_answer_and_the_diff_base() {
        let transport = Arc::new(ScriptedTransport::default());
        let context = harness(transport.clone());
        run_task(&OpenSignalingConnectionTask::new(context.clone()))
            .await
            .unwrap();
        {
            let mut state = context.state.lock();
            state.sdp_offer = Some("v=0\r\n".into());
            state.videos_to_receive = [4, 9].into();
            state.video_subscriptions = vec![0, 4, 9];
        }

        run_task(&SubscribeAndReceiveSubscribeAckTask::new(context.clone()))
            .await
            .unwrap();

        let state = context.state.lock();
        assert_eq!(state.sdp_answer.as_deref(), Some(ANSWER_SDP));
        assert_eq!(state.last_videos_to_receive, Some([4, 9].into()));
        let sent = transport.sent.lock();
        let SignalMessage::Subscribe(subscribe) = &sent[0].message else {
            panic!("expected a subscribe");
        };
        assert_eq!(subscribe.receive_stream_ids, vec![0, 4, 9]);
        assert!(subscribe.video_subscription_configuration.is_empty());
    }

    #[tokio::test]
    async fn diff_base_is_the_set_that_was_sent() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.unanswered.lock().insert(FrameType::Subscribe);
        let context = harness(transport.clone());
        run_task(&OpenSignalingConnectionTask::new(context.clone()))
            .await
            .unwrap();
        {
            let mut state = context.state.lock();
            state.sdp_offer = Some("v=0\r\n".into());
            state.videos_to_receive = [4, 9].into();
            state.video_subscriptions = vec![0, 4, 9];
        }

        let running = tokio::spawn({
            let context = context.clone();
            async move { run_task(&SubscribeAndReceiveSubscribeAckTask::new(context)).await }
        });
        while !transport.sent_types().contains(&FrameType::Subscribe) {
            tokio::task::yield_now().await;
        }
        context.state.lock().videos_to_receive = [4, 10].into();
        transport
            .push(videocall_types::SignalFrame::new(SignalMessage::SubscribeAck(
                videocall_types::SubscribeAckFrame {
                    sdp_answer: ANSWER_SDP.into(),
                    tracks: Vec::new(),
                },
            )))
            .await;
        running.await.unwrap().unwrap();

        let state = context.state.lock();
        assert_eq!(state.last_videos_to_receive, Some([4, 9].into()));
        assert_eq!(state.videos_to_receive, [4, 10].into());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_subscribe_can_be_canceled() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.unanswered.lock().insert(FrameType::Subscribe);
        let context = harness(transport.clone());
        run_task(&OpenSignalingConnectionTask::new(context.clone()))
            .await
            .unwrap();
        context.state.lock().sdp_offer = Some("v=0\r\n".into());

        let task = crate::task::TimeoutTask::new(
            Arc::new(SubscribeAndReceiveSubscribeAckTask::new(context.clone())),
            std::time::Duration::from_secs(2),
        );
        let err = run_task(&task).await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
        assert!(context.state.lock().sdp_answer.is_none());
    }
}
