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

//! Owns the local send transceivers and the pool of remote video
//! transceivers, and maps subscription decisions onto them.

use crate::errors::MediaError;
use crate::media::{MediaKind, MediaStreamTrack};
use crate::peer::{
    same_transceiver, PeerConnection, RtpEncodingParameters, RtpTransceiver,
    TransceiverDirection,
};
use crate::policy::EncodingParameters;
use crate::video_stream_index::VideoStreamIndex;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    peer: Option<Arc<dyn PeerConnection>>,
    local_audio: Option<Arc<dyn RtpTransceiver>>,
    local_camera: Option<Arc<dyn RtpTransceiver>>,
    // Remote video transceivers in peer order, each with the stream it
    // carries (0 when inactive).
    slots: Vec<(Arc<dyn RtpTransceiver>, u32)>,
    video_subscriptions: Vec<u32>,
}

impl Inner {
    fn is_remote_video(&self, transceiver: &Arc<dyn RtpTransceiver>) -> bool {
        if transceiver.kind() != MediaKind::Video {
            return false;
        }
        match &self.local_camera {
            Some(camera) => !same_transceiver(camera, transceiver),
            None => true,
        }
    }

    fn slot_stream(&self, transceiver: &Arc<dyn RtpTransceiver>) -> Option<u32> {
        self.slots
            .iter()
            .find(|(t, stream_id)| *stream_id != 0 && same_transceiver(t, transceiver))
            .map(|(_, stream_id)| *stream_id)
    }
}

#[derive(Default)]
pub struct TransceiverController {
    inner: Mutex<Inner>,
}

impl TransceiverController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peer(&self, peer: Arc<dyn PeerConnection>) {
        self.inner.lock().peer = Some(peer);
    }

    pub fn has_peer(&self) -> bool {
        self.inner.lock().peer.is_some()
    }

    /// Drop every transceiver handle and the peer.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Adds the inactive audio and camera transceivers if missing.
    pub fn setup_local_transceivers(&self) {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peer.clone() else {
            return;
        };
        if inner.local_audio.is_none() {
            inner.local_audio =
                Some(peer.add_transceiver(MediaKind::Audio, TransceiverDirection::Inactive, vec![]));
        }
        if inner.local_camera.is_none() {
            inner.local_camera =
                Some(peer.add_transceiver(MediaKind::Video, TransceiverDirection::Inactive, vec![]));
        }
    }

    /// Set up the camera transceiver with explicit send encodings. Used for
    /// simulcast, where the layers must exist before the first offer.
    pub fn setup_local_camera_with_encodings(&self, encodings: Vec<RtpEncodingParameters>) {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peer.clone() else {
            return;
        };
        if inner.local_audio.is_none() {
            inner.local_audio =
                Some(peer.add_transceiver(MediaKind::Audio, TransceiverDirection::Inactive, vec![]));
        }
        if inner.local_camera.is_none() {
            inner.local_camera = Some(peer.add_transceiver(
                MediaKind::Video,
                TransceiverDirection::Inactive,
                encodings,
            ));
        }
    }

    pub async fn set_audio_input(&self, track: Option<MediaStreamTrack>) -> Result<(), MediaError> {
        let transceiver = self.inner.lock().local_audio.clone();
        set_transceiver_input(transceiver, track).await
    }

    pub async fn set_video_input(&self, track: Option<MediaStreamTrack>) -> Result<(), MediaError> {
        let transceiver = self.inner.lock().local_camera.clone();
        set_transceiver_input(transceiver, track).await
    }

    /// Swap the microphone track without renegotiating. Returns `false`
    /// when the audio transceiver is not sending.
    pub async fn replace_audio_track(&self, track: MediaStreamTrack) -> Result<bool, MediaError> {
        let transceiver = self.inner.lock().local_audio.clone();
        let Some(transceiver) = transceiver else {
            info!("audio transceiver is not set up");
            return Ok(false);
        };
        if transceiver.direction() != TransceiverDirection::SendRecv {
            info!("audio transceiver is not activated");
            return Ok(false);
        }
        transceiver.replace_track(Some(track)).await?;
        Ok(true)
    }

    pub fn has_audio_input(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .local_audio
            .as_ref()
            .is_some_and(|t| t.sender_track().is_some())
    }

    pub fn has_video_input(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .local_camera
            .as_ref()
            .is_some_and(|t| t.sender_track().is_some())
    }

    pub fn set_audio_codec_preferences(&self, codecs: &[String]) -> Result<(), MediaError> {
        let transceiver = self.inner.lock().local_audio.clone();
        match transceiver {
            Some(transceiver) => transceiver.set_codec_preferences(codecs),
            None => Ok(()),
        }
    }

    pub fn set_video_codec_preferences(&self, codecs: &[String]) -> Result<(), MediaError> {
        let transceiver = self.inner.lock().local_camera.clone();
        match transceiver {
            Some(transceiver) => transceiver.set_codec_preferences(codecs),
            None => Ok(()),
        }
    }

    /// Cap every camera encoding at `bitrate_kbps`. Ignored while the
    /// camera is not sending.
    pub async fn set_video_sending_bitrate_kbps(&self, bitrate_kbps: u32) -> Result<(), MediaError> {
        let camera = self.inner.lock().local_camera.clone();
        let Some(camera) = camera else {
            return Ok(());
        };
        if bitrate_kbps == 0 || camera.direction() != TransceiverDirection::SendRecv {
            return Ok(());
        }
        let mut encodings = camera.encodings();
        if encodings.is_empty() {
            encodings.push(RtpEncodingParameters::default());
        }
        for encoding in &mut encodings {
            encoding.max_bitrate_kbps = bitrate_kbps;
        }
        camera.set_encodings(encodings).await?;
        info!("set video send bandwidth to {bitrate_kbps}kbps");
        Ok(())
    }

    /// Apply per-rid encoding parameters to the camera sender. Encodings
    /// without a rid match the `""` key.
    pub async fn set_encoding_parameters(
        &self,
        parameters: &EncodingParameters,
    ) -> Result<(), MediaError> {
        let camera = self.inner.lock().local_camera.clone();
        let Some(camera) = camera else {
            return Ok(());
        };
        let current = camera.encodings();
        let encodings: Vec<RtpEncodingParameters> = if current.is_empty() {
            let mut fresh: Vec<_> = parameters.values().cloned().collect();
            fresh.sort_by(|a, b| {
                b.scale_resolution_down_by
                    .total_cmp(&a.scale_resolution_down_by)
            });
            fresh
        } else {
            current
                .into_iter()
                .map(|encoding| {
                    let key = encoding.rid.clone().unwrap_or_default();
                    match parameters.get(&key) {
                        Some(wanted) => RtpEncodingParameters {
                            rid: encoding.rid,
                            ..wanted.clone()
                        },
                        None => encoding,
                    }
                })
                .collect()
        };
        debug!("camera encodings {encodings:?}");
        camera.set_encodings(encodings).await
    }

    pub fn local_camera_encodings(&self) -> Vec<RtpEncodingParameters> {
        self.inner
            .lock()
            .local_camera
            .as_ref()
            .map(|t| t.encodings())
            .unwrap_or_default()
    }

    /// Point remote video transceivers at `videos_to_receive`.
    ///
    /// Transceivers already carrying a wanted stream keep it; the rest go
    /// inactive and are reused for new streams before any transceiver is
    /// added. The returned list is positional: entry 0 is the camera slot,
    /// entry `n` is the stream on the `n`th remote video transceiver.
    pub fn update_video_transceivers(
        &self,
        index: &VideoStreamIndex,
        videos_to_receive: &BTreeSet<u32>,
    ) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peer.clone() else {
            return videos_to_receive.iter().copied().collect();
        };

        let remote: Vec<Arc<dyn RtpTransceiver>> = peer
            .transceivers()
            .into_iter()
            .filter(|t| inner.is_remote_video(t))
            .collect();

        let mut subscriptions = vec![0];
        let mut remaining = videos_to_receive.clone();
        for transceiver in &remote {
            let stream_id = inner.slot_stream(transceiver).or_else(|| {
                transceiver
                    .mid()
                    .and_then(|mid| index.stream_id_for_track(&format!("v_{mid}")))
            });
            match stream_id {
                Some(stream_id) if remaining.remove(&stream_id) => {
                    transceiver.set_direction(TransceiverDirection::RecvOnly);
                    subscriptions.push(stream_id);
                }
                _ => {
                    transceiver.set_direction(TransceiverDirection::Inactive);
                    subscriptions.push(0);
                }
            }
        }

        let mut remaining: Vec<u32> = remaining.into_iter().collect();
        let mut slots: Vec<Arc<dyn RtpTransceiver>> = remote;
        if !remaining.is_empty() {
            let mut n = 1;
            for transceiver in &slots {
                if transceiver.direction() == TransceiverDirection::Inactive {
                    transceiver.set_direction(TransceiverDirection::RecvOnly);
                    subscriptions[n] = remaining.remove(0);
                    if remaining.is_empty() {
                        break;
                    }
                }
                n += 1;
            }
            for stream_id in remaining {
                let transceiver =
                    peer.add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly, vec![]);
                info!(
                    "adding transceiver mid: {:?} subscription: {stream_id} direction: recvonly",
                    transceiver.mid()
                );
                slots.push(transceiver);
                subscriptions.push(stream_id);
            }
        }

        inner.slots = slots
            .into_iter()
            .zip(subscriptions.iter().skip(1).copied())
            .collect();
        for (n, (transceiver, stream_id)) in inner.slots.iter().enumerate() {
            debug!(
                "transceiver index={} mid={:?} subscription={stream_id} direction={:?}",
                n + 1,
                transceiver.mid(),
                transceiver.direction()
            );
        }
        inner.video_subscriptions = subscriptions.clone();
        subscriptions
    }

    pub fn video_subscriptions(&self) -> Vec<u32> {
        self.inner.lock().video_subscriptions.clone()
    }

    pub fn get_mid_for_stream_id(&self, stream_id: u32) -> Option<String> {
        if stream_id == 0 {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .find(|(_, id)| *id == stream_id)
            .and_then(|(t, _)| t.mid())
    }

    /// Retarget the transceiver negotiated as `mid` to `stream_id`. Used
    /// for simulcast layer switches that need no renegotiation.
    pub fn set_stream_id_for_mid(&self, mid: &str, stream_id: u32) {
        let mut inner = self.inner.lock();
        let position = inner
            .slots
            .iter()
            .position(|(t, _)| t.mid().as_deref() == Some(mid));
        let Some(position) = position else {
            warn!("no remote video transceiver with mid {mid}");
            return;
        };
        inner.slots[position].1 = stream_id;
        if let Some(entry) = inner.video_subscriptions.get_mut(position + 1) {
            *entry = stream_id;
        }
    }

    /// Stop every transceiver and forget them.
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        if let Some(peer) = &inner.peer {
            for transceiver in peer.transceivers() {
                transceiver.stop();
            }
        }
        *inner = Inner::default();
    }
}

async fn set_transceiver_input(
    transceiver: Option<Arc<dyn RtpTransceiver>>,
    track: Option<MediaStreamTrack>,
) -> Result<(), MediaError> {
    let Some(transceiver) = transceiver else {
        return Ok(());
    };
    let direction = if track.is_some() {
        TransceiverDirection::SendRecv
    } else {
        TransceiverDirection::Inactive
    };
    transceiver.set_direction(direction);
    transceiver.replace_track(track).await
}
