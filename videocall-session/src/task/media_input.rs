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

use super::Task;
use crate::errors::TaskError;
use crate::session_state::SessionContext;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use videocall_types::StreamServiceType;

/// Acquires the microphone. A missing device is not fatal.
pub struct ReceiveAudioInputTask {
    context: Arc<SessionContext>,
}

impl ReceiveAudioInputTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for ReceiveAudioInputTask {
    fn name(&self) -> String {
        "ReceiveAudioInputTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        if self.context.state.lock().audio_input.is_some() {
            return Ok(());
        }
        match self
            .context
            .media_stream_broker
            .acquire_audio_input_stream()
            .await
        {
            Ok(stream) => {
                info!("acquired audio input {}", stream.id);
                self.context.state.lock().audio_input = Some(stream);
            }
            Err(e) => warn!("an audio input is not available, joining without it: {e}"),
        }
        Ok(())
    }
}

/// Brings the camera in line with the local video request and picks the
/// capture parameters.
pub struct ReceiveVideoInputTask {
    context: Arc<SessionContext>,
}

impl ReceiveVideoInputTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for ReceiveVideoInputTask {
    fn name(&self) -> String {
        "ReceiveVideoInputTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let (requested, current) = {
            let state = context.state.lock();
            (state.local_video_requested, state.video_input.clone())
        };

        match (requested, current) {
            (true, None) => match context.media_stream_broker.acquire_video_input_stream().await {
                Ok(stream) => {
                    info!("acquired video input {}", stream.id);
                    context.state.lock().video_input = Some(stream);
                }
                Err(e) => warn!("could not acquire video input: {e}"),
            },
            (false, Some(stream)) => {
                info!("releasing video input {}", stream.id);
                context.media_stream_broker.release_media_stream(&stream).await;
                context.state.lock().video_input = None;
            }
            _ => {}
        }

        let parameters = context
            .uplink_policy
            .lock()
            .choose_capture_and_encode_parameters();
        let mut state = context.state.lock();
        state.video_capture_and_encode_parameters = parameters;
        state.video_duplex_mode = if state.video_input.is_some() {
            StreamServiceType::Duplex
        } else {
            StreamServiceType::Rx
        };
        Ok(())
    }
}

/// Binds local tracks to the peer's transceivers and lays out the remote
/// video transceivers for `videos_to_receive`.
pub struct AttachMediaInputTask {
    context: Arc<SessionContext>,
}

impl AttachMediaInputTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for AttachMediaInputTask {
    fn name(&self) -> String {
        "AttachMediaInputTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let transceivers = &context.transceiver_controller;
        let (peer, audio_track, video_track, degraded) = {
            let state = context.state.lock();
            (
                state.peer.clone(),
                state.audio_track(),
                state.video_track(),
                state.degraded_video_send_codecs.clone(),
            )
        };
        let peer = peer.ok_or_else(|| TaskError::failed(self.name(), "no peer connection"))?;
        transceivers.set_peer(peer);

        let simulcast = context.uplink_policy.lock().is_simulcast();
        if simulcast {
            let mut encodings: Vec<_> = context
                .uplink_policy
                .lock()
                .choose_encoding_parameters()
                .into_values()
                .collect();
            encodings.sort_by(|a, b| {
                b.scale_resolution_down_by
                    .total_cmp(&a.scale_resolution_down_by)
            });
            transceivers.setup_local_camera_with_encodings(encodings);
        } else {
            transceivers.setup_local_transceivers();
        }

        transceivers
            .set_audio_input(audio_track)
            .await
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        if context.configuration.audio_red_enabled {
            if let Err(e) =
                transceivers.set_audio_codec_preferences(&["red".to_string(), "opus".to_string()])
            {
                warn!("could not prefer redundant audio: {e}");
            }
        }

        transceivers
            .set_video_input(video_track)
            .await
            .map_err(|e| TaskError::failed(self.name(), e.to_string()))?;
        let codecs: Vec<String> = context
            .configuration
            .video_codec_preferences
            .iter()
            .map(|c| c.rtpmap_name().to_string())
            .filter(|name| !degraded.contains(name))
            .collect();
        if let Err(e) = transceivers.set_video_codec_preferences(&codecs) {
            warn!("could not apply video codec preferences: {e}");
        }

        let mut state = context.state.lock();
        let subscriptions =
            transceivers.update_video_transceivers(&state.video_stream_index, &state.videos_to_receive);
        let tiles = subscriptions.iter().filter(|&&id| id != 0).count() as u32;
        state.max_video_tile_count = state.max_video_tile_count.max(tiles);
        state.video_subscriptions = subscriptions;
        Ok(())
    }
}
