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

//! Peer connection and offer/answer tasks.

use super::{cancellable, Task};
use crate::errors::TaskError;
use crate::peer::{PeerConnection, RtcConfiguration, SessionDescription};
use crate::sdp;
use crate::session_state::SessionContext;
use crate::status::MeetingSessionStatusCode;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn current_peer(context: &SessionContext, task: &str) -> Result<Arc<dyn PeerConnection>, TaskError> {
    context
        .state
        .lock()
        .peer
        .clone()
        .ok_or_else(|| TaskError::failed(task, "no peer connection"))
}

/// Replaces the peer connection, closing the previous one.
pub struct CreatePeerConnectionTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl CreatePeerConnectionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for CreatePeerConnectionTask {
    fn name(&self) -> String {
        "CreatePeerConnectionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let (previous, turn) = {
            let mut state = context.state.lock();
            (state.peer.take(), state.turn_credentials.clone())
        };
        if let Some(previous) = previous {
            info!("closing the previous peer connection");
            previous.close();
            context.transceiver_controller.reset();
        }

        let configuration = RtcConfiguration::from_turn_credentials(
            turn.as_ref(),
            context.configuration.enable_unified_plan,
        );
        let peer = cancellable(
            &self.cancel,
            &self.name(),
            context.peer_connection_factory.create(&configuration),
        )
        .await?
        .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;

        context.transceiver_controller.set_peer(peer.clone());
        context.state.lock().peer = Some(peer);
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct CreateSdpTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl CreateSdpTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for CreateSdpTask {
    fn name(&self) -> String {
        "CreateSDPTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let peer = current_peer(&self.context, &self.name())?;
        let offer = cancellable(&self.cancel, &self.name(), peer.create_offer())
            .await?
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        debug!("created offer with video codecs {:?}", sdp::video_codec_names(&offer.sdp));
        self.context.state.lock().sdp_offer = Some(offer.sdp);
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct SetLocalDescriptionTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl SetLocalDescriptionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for SetLocalDescriptionTask {
    fn name(&self) -> String {
        "SetLocalDescriptionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let peer = current_peer(&self.context, &self.name())?;
        let offer = self
            .context
            .state
            .lock()
            .sdp_offer
            .clone()
            .ok_or_else(|| TaskError::failed(self.name(), "no offer was created"))?;
        cancellable(
            &self.cancel,
            &self.name(),
            peer.set_local_description(SessionDescription::offer(offer)),
        )
        .await?
        .map_err(|e| TaskError::failed(self.name(), e.to_string()))
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Waits until ICE gathering completes and refreshes the offer with the
/// gathered candidates.
pub struct FinishGatheringIceCandidatesTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl FinishGatheringIceCandidatesTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for FinishGatheringIceCandidatesTask {
    fn name(&self) -> String {
        "FinishGatheringICECandidatesTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let peer = current_peer(context, &self.name())?;
        if let Some(local) = peer.local_description() {
            if sdp::count_candidates(&local.sdp) > 0 {
                info!("local description already has candidates, skipping gathering");
                context.state.lock().sdp_offer = Some(local.sdp);
                return Ok(());
            }
        }

        let started = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if context.state.lock().ice_candidates.is_empty() {
                        return Err(TaskError::with_status(
                            self.name(),
                            MeetingSessionStatusCode::ICEGatheringTimeoutWorkaround,
                            "canceled before any ICE candidate was gathered",
                        ));
                    }
                    return Err(TaskError::canceled(self.name()));
                }
                candidate = peer.next_ice_candidate() => match candidate {
                    Some(candidate) => {
                        debug!("gathered candidate {candidate}");
                        context.state.lock().ice_candidates.push(candidate);
                    }
                    None => break,
                }
            }
        }

        let mut state = context.state.lock();
        if state.ice_candidates.is_empty() {
            return Err(TaskError::failed(
                self.name(),
                "ICE gathering completed without candidates",
            ));
        }
        state.ice_gathering_duration_ms = Some(started.elapsed().as_millis() as u64);
        if let Some(local) = peer.local_description() {
            state.sdp_offer = Some(local.sdp);
        }
        info!(
            "gathered {} ICE candidates in {}ms",
            state.ice_candidates.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Applies the subscribe answer and records the negotiated codec order.
pub struct SetRemoteDescriptionTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
    during_update: bool,
}

impl SetRemoteDescriptionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
            during_update: false,
        }
    }

    /// Failures are reported as `IncompatibleSDP`, which restarts local
    /// video instead of reconnecting.
    pub fn for_update(mut self) -> Self {
        self.during_update = true;
        self
    }
}

#[async_trait]
impl Task for SetRemoteDescriptionTask {
    fn name(&self) -> String {
        "SetRemoteDescriptionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let peer = current_peer(&self.context, &self.name())?;
        let answer = self
            .context
            .state
            .lock()
            .sdp_answer
            .clone()
            .ok_or_else(|| TaskError::failed(self.name(), "no answer was received"))?;

        let result = cancellable(
            &self.cancel,
            &self.name(),
            peer.set_remote_description(SessionDescription::answer(answer.clone())),
        )
        .await?;
        if let Err(e) = result {
            return Err(if self.during_update {
                TaskError::with_status(
                    self.name(),
                    MeetingSessionStatusCode::IncompatibleSDP,
                    e.to_string(),
                )
            } else {
                TaskError::failed(self.name(), e.to_string())
            });
        }

        let codecs = sdp::video_codec_names(&answer);
        let mut state = self.context.state.lock();
        let sending = codecs
            .iter()
            .find(|c| !state.degraded_video_send_codecs.contains(c))
            .cloned();
        state.current_video_send_codec = sending;
        debug!(
            "negotiated video codecs {codecs:?}, sending {:?}",
            state.current_video_send_codec
        );
        state.prioritized_send_codecs = codecs;
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
