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

//! Peer connection contracts consumed by the orchestrator.
//!
//! These mirror the parts of a WebRTC peer connection the session drives.
//! Bindings to a concrete WebRTC stack implement them.

use crate::errors::MediaError;
use crate::media::{MediaKind, MediaStreamTrack};
use async_trait::async_trait;
use std::sync::Arc;
use videocall_types::TurnCredentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtpEncodingParameters {
    /// Simulcast layer name; `None` for a single unnamed encoding.
    pub rid: Option<String>,
    pub active: bool,
    pub max_bitrate_kbps: u32,
    pub scale_resolution_down_by: f64,
    pub max_framerate: Option<u32>,
    /// Scalable video coding mode such as `L3T3`; `None` leaves it to the
    /// encoder.
    pub scalability_mode: Option<String>,
}

impl Default for RtpEncodingParameters {
    fn default() -> Self {
        Self {
            rid: None,
            active: true,
            max_bitrate_kbps: 0,
            scale_resolution_down_by: 1.0,
            max_framerate: None,
            scalability_mode: None,
        }
    }
}

#[async_trait]
pub trait RtpTransceiver: Send + Sync {
    /// Media section id, assigned once the transceiver is negotiated.
    fn mid(&self) -> Option<String>;
    fn kind(&self) -> MediaKind;
    fn direction(&self) -> TransceiverDirection;
    fn set_direction(&self, direction: TransceiverDirection);
    fn sender_track(&self) -> Option<MediaStreamTrack>;
    async fn replace_track(&self, track: Option<MediaStreamTrack>) -> Result<(), MediaError>;
    fn encodings(&self) -> Vec<RtpEncodingParameters>;
    async fn set_encodings(&self, encodings: Vec<RtpEncodingParameters>)
        -> Result<(), MediaError>;
    fn set_codec_preferences(&self, codecs: &[String]) -> Result<(), MediaError>;
    fn stop(&self);
}

/// Identity comparison for transceiver handles.
pub fn same_transceiver(a: &Arc<dyn RtpTransceiver>, b: &Arc<dyn RtpTransceiver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub unified_plan: bool,
}

impl RtcConfiguration {
    pub fn from_turn_credentials(credentials: Option<&TurnCredentials>, unified_plan: bool) -> Self {
        let ice_servers = credentials
            .map(|c| {
                vec![IceServer {
                    urls: c.uris.clone(),
                    username: Some(c.username.clone()),
                    credential: Some(c.password.clone()),
                }]
            })
            .unwrap_or_default();
        Self {
            ice_servers,
            unified_plan,
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
        send_encodings: Vec<RtpEncodingParameters>,
    ) -> Arc<dyn RtpTransceiver>;
    fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;
    fn local_description(&self) -> Option<SessionDescription>;
    /// The next gathered ICE candidate; `None` once gathering is complete.
    async fn next_ice_candidate(&self) -> Option<String>;
    fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        configuration: &RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
