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

//! Signaling frames exchanged with the media host.
//!
//! Every frame travelling over the control-plane connection is a
//! [`SignalFrame`]: a timestamp, a typed [`SignalMessage`] body and an
//! optional [`ErrorFrame`] the server attaches when a request could not be
//! honored. The session orchestrator only ever matches on the message
//! variant, so the wire layout here is deliberately plain JSON.

use serde::{Deserialize, Serialize};

/// The envelope for every signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    /// Milliseconds since the unix epoch at which the frame was produced.
    #[serde(default)]
    pub timestamp_ms: u64,
    pub message: SignalMessage,
    /// Present when the server rejected the request this frame answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

impl SignalFrame {
    pub fn new(message: SignalMessage) -> Self {
        Self {
            timestamp_ms: 0,
            message,
            error: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_error(mut self, error: ErrorFrame) -> Self {
        self.error = Some(error);
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.message.frame_type()
    }
}

/// Frame discriminant, handy for waiting on a specific reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Join,
    JoinAck,
    Index,
    Subscribe,
    SubscribeAck,
    Leave,
    LeaveAck,
    AudioStatus,
    AudioMetadata,
    AudioStreamIdInfo,
    Pause,
    Resume,
    RemoteVideoUpdate,
    Bitrates,
    DataMessage,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    Join(JoinFrame),
    JoinAck(JoinAckFrame),
    Index(IndexFrame),
    Subscribe(SubscribeFrame),
    SubscribeAck(SubscribeAckFrame),
    Leave,
    LeaveAck,
    AudioStatus(AudioStatusFrame),
    AudioMetadata(AudioMetadataFrame),
    AudioStreamIdInfo(AudioStreamIdInfoFrame),
    Pause(PauseResumeFrame),
    Resume(PauseResumeFrame),
    RemoteVideoUpdate(RemoteVideoUpdateFrame),
    Bitrates(BitratesFrame),
    DataMessage(DataMessageFrame),
    Ping(PingPongFrame),
    Pong(PingPongFrame),
}

impl SignalMessage {
    pub fn frame_type(&self) -> FrameType {
        match self {
            SignalMessage::Join(_) => FrameType::Join,
            SignalMessage::JoinAck(_) => FrameType::JoinAck,
            SignalMessage::Index(_) => FrameType::Index,
            SignalMessage::Subscribe(_) => FrameType::Subscribe,
            SignalMessage::SubscribeAck(_) => FrameType::SubscribeAck,
            SignalMessage::Leave => FrameType::Leave,
            SignalMessage::LeaveAck => FrameType::LeaveAck,
            SignalMessage::AudioStatus(_) => FrameType::AudioStatus,
            SignalMessage::AudioMetadata(_) => FrameType::AudioMetadata,
            SignalMessage::AudioStreamIdInfo(_) => FrameType::AudioStreamIdInfo,
            SignalMessage::Pause(_) => FrameType::Pause,
            SignalMessage::Resume(_) => FrameType::Resume,
            SignalMessage::RemoteVideoUpdate(_) => FrameType::RemoteVideoUpdate,
            SignalMessage::Bitrates(_) => FrameType::Bitrates,
            SignalMessage::DataMessage(_) => FrameType::DataMessage,
            SignalMessage::Ping(_) => FrameType::Ping,
            SignalMessage::Pong(_) => FrameType::Pong,
        }
    }
}

/// Error details attached by the server. `status` follows HTTP conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub status: u32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Audio,
    Video,
}

/// How the server adapts remote video to the receiver's network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerSideNetworkAdaption {
    #[default]
    Default,
    None,
    BandwidthProbing,
    BandwidthProbingAndRemoteVideoQualityAdaption,
}

impl ServerSideNetworkAdaption {
    /// Whether the server picks simulcast layers on our behalf, which lets
    /// layer switches travel as remote video updates instead of a subscribe.
    pub fn adapts_remote_video(&self) -> bool {
        matches!(
            self,
            ServerSideNetworkAdaption::BandwidthProbingAndRemoteVideoQualityAdaption
        )
    }
}

/// Direction of the video service requested in a subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamServiceType {
    #[default]
    Rx,
    Tx,
    Duplex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinFrame {
    pub protocol_version: u32,
    pub max_num_of_videos: u32,
    pub attendee_id: String,
    #[serde(default)]
    pub server_side_network_adaption: ServerSideNetworkAdaption,
    #[serde(default)]
    pub supported_server_side_network_adaptions: Vec<ServerSideNetworkAdaption>,
    #[serde(default)]
    pub wants_all_temporal_layers_in_index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl_seconds: u32,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JoinAckFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_credentials: Option<TurnCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_subscription_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_server_side_network_adaption: Option<ServerSideNetworkAdaption>,
}

/// One published stream as enumerated by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamDescriptor {
    pub stream_id: u32,
    /// Shared by every simulcast layer of the same source.
    pub group_id: u32,
    pub attendee_id: String,
    #[serde(default)]
    pub external_user_id: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub track_label: String,
    #[serde(default)]
    pub max_bitrate_kbps: u32,
    #[serde(default)]
    pub avg_bitrate_bps: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub framerate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexFrame {
    #[serde(default)]
    pub at_capacity: bool,
    #[serde(default)]
    pub sources: Vec<StreamDescriptor>,
    #[serde(default)]
    pub paused_at_source_ids: Vec<u32>,
    /// Total attendees in the meeting, senders or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_participants: Option<u32>,
}

/// Per-source subscription entry used by server side network adaption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VideoSubscriptionConfiguration {
    pub mid: String,
    pub attendee_id: String,
    pub stream_id: u32,
    pub group_id: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub target_bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscribeFrame {
    pub duplex: StreamServiceType,
    pub sdp_offer: String,
    /// Positionally aligned with the video transceivers; slot 0 is the local camera.
    pub receive_stream_ids: Vec<u32>,
    #[serde(default)]
    pub send_streams: Vec<StreamDescriptor>,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub audio_checkin: bool,
    #[serde(default)]
    pub video_subscription_configuration: Vec<VideoSubscriptionConfiguration>,
}

/// Mapping from a receive track label to the stream it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackMapping {
    pub stream_id: u32,
    #[serde(default)]
    pub ssrc: u32,
    pub track_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscribeAckFrame {
    #[serde(default)]
    pub sdp_answer: String,
    #[serde(default)]
    pub tracks: Vec<TrackMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStatusFrame {
    pub audio_status: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttendeeAudioState {
    pub audio_stream_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioMetadataFrame {
    #[serde(default)]
    pub attendee_states: Vec<AttendeeAudioState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioStreamIdInfo {
    pub audio_stream_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub dropped: bool,
}

/// Presence information: an entry with an attendee id announces it, one
/// without only updates the stream it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioStreamIdInfoFrame {
    #[serde(default)]
    pub streams: Vec<AudioStreamIdInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PauseResumeFrame {
    #[serde(default)]
    pub stream_ids: Vec<u32>,
    #[serde(default)]
    pub group_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteVideoUpdateFrame {
    #[serde(default)]
    pub added_or_updated_video_subscriptions: Vec<VideoSubscriptionConfiguration>,
    #[serde(default)]
    pub removed_video_subscription_mids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Bitrate {
    pub source_stream_id: u32,
    pub avg_bitrate_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BitratesFrame {
    #[serde(default)]
    pub bitrates: Vec<Bitrate>,
    #[serde(default)]
    pub server_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataMessage {
    pub topic: String,
    pub data: Vec<u8>,
    #[serde(default)]
    pub lifetime_ms: u32,
    #[serde(default)]
    pub sender_attendee_id: String,
    #[serde(default)]
    pub sender_external_user_id: String,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub throttled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataMessageFrame {
    #[serde(default)]
    pub messages: Vec<DataMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PingPongFrame {
    pub ping_id: u32,
}
