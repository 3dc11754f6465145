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

//! Teardown after a stop and between reconnect attempts.

use super::{cancellable, Task};
use crate::errors::TaskError;
use crate::session_state::SessionContext;
use crate::signaling_client::SignalingClientEvent;
use async_broadcast::{Receiver, RecvError};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use videocall_types::StreamServiceType;

async fn wait_for_close(events: &mut Receiver<SignalingClientEvent>) {
    loop {
        match events.recv().await {
            Ok(SignalingClientEvent::WebSocketClosed { .. }) | Err(RecvError::Closed) => return,
            Ok(_) | Err(RecvError::Overflowed(_)) => {}
        }
    }
}

/// Closes signaling and releases everything the session holds. The
/// teardown runs even when waiting for the close is canceled.
pub struct CleanStoppedSessionTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl CleanStoppedSessionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }

    async fn close_signaling(&self) -> Result<(), TaskError> {
        let signaling = &self.context.signaling;
        if !signaling.ready() {
            return Ok(());
        }
        let mut events = signaling.subscribe_events();
        if let Err(e) = signaling.close_connection().await {
            warn!("could not close signaling: {e}");
            return Ok(());
        }
        cancellable(&self.cancel, &self.name(), wait_for_close(&mut events)).await
    }

    async fn release_session(&self) {
        let context = &self.context;
        context.abort_background();
        context.remove_monitor_observer();
        context.pause_ingestion();

        let (peer, audio, video) = {
            let mut state = context.state.lock();
            let peer = state.peer.take();
            let audio = state.audio_input.take();
            let video = state.video_input.take();
            state.sdp_offer = None;
            state.sdp_answer = None;
            state.ice_candidates.clear();
            state.turn_credentials = None;
            state.index_frame = None;
            state.video_stream_index.clear();
            state.last_videos_to_receive = None;
            state.video_subscriptions.clear();
            state.last_video_subscription_configuration.clear();
            state.videos_paused.clear();
            state.last_known_video_availability = None;
            state.last_remote_video_sources.clear();
            state.last_encoding_parameters = None;
            state.video_duplex_mode = StreamServiceType::Rx;
            (peer, audio, video)
        };
        if let Some(peer) = peer {
            peer.close();
        }
        context.transceiver_controller.reset();
        context.downlink_policy.lock().reset();
        context.realtime.clear();

        for stream in audio.iter().chain(video.iter()) {
            context.media_stream_broker.release_media_stream(stream).await;
        }
        info!("session resources released");
    }
}

#[async_trait]
impl Task for CleanStoppedSessionTask {
    fn name(&self) -> String {
        "CleanStoppedSessionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let closed = self.close_signaling().await;
        self.release_session().await;
        closed
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Drops the artifacts of the failed connection before a reconnect. Media
/// inputs and session listeners survive.
pub struct CleanRestartedSessionTask {
    context: Arc<SessionContext>,
    keep_signaling: bool,
}

impl CleanRestartedSessionTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            keep_signaling: false,
        }
    }

    /// Leave the signaling connection open for a peer-only restart.
    pub fn keeping_signaling(mut self) -> Self {
        self.keep_signaling = true;
        self
    }
}

#[async_trait]
impl Task for CleanRestartedSessionTask {
    fn name(&self) -> String {
        "CleanRestartedSessionTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let peer = {
            let mut state = context.state.lock();
            let peer = state.peer.take();
            let kept = (state.turn_credentials.take(), state.index_frame.take());
            state.reset_for_reconnect();
            if self.keep_signaling {
                (state.turn_credentials, state.index_frame) = kept;
            }
            peer
        };
        if let Some(peer) = peer {
            peer.close();
        }
        context.transceiver_controller.reset();

        if !self.keep_signaling && context.signaling.ready() {
            if let Err(e) = context.signaling.close_connection().await {
                warn!("could not close the previous signaling connection: {e}");
            }
        }
        Ok(())
    }
}
