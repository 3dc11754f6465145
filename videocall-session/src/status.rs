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

//! Meeting session status codes and their classification.

use crate::errors::TaskError;
use serde::{Deserialize, Serialize};
use std::fmt;
use videocall_types::{SignalFrame, SignalMessage};

const STATUS_CODE_MARKER: &str = "the meeting status code: ";

/// Why a session is in its current condition. Values follow declaration
/// order and are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MeetingSessionStatusCode {
    OK = 0,
    Left,
    AudioJoinedFromAnotherDevice,
    AudioAuthenticationRejected,
    AudioCallAtCapacity,
    MeetingEnded,
    AudioInternalServerError,
    AudioServiceUnavailable,
    AudioDisconnected,
    VideoCallSwitchToViewOnly,
    VideoCallAtSourceCapacity,
    SignalingBadRequest,
    SignalingInternalServerError,
    SignalingRequestFailed,
    ICEGatheringTimeoutWorkaround,
    ConnectionHealthReconnect,
    RealtimeApiFailed,
    TaskFailed,
    IncompatibleSDP,
    TURNCredentialsForbidden,
    NoAttendeePresent,
    AudioAttendeeRemoved,
    AudioVideoWasRemovedFromPrimaryMeeting,
    AudioDisconnectAudio,
    SignalChannelClosedUnexpectedly,
}

impl MeetingSessionStatusCode {
    const ALL: [MeetingSessionStatusCode; 25] = [
        Self::OK,
        Self::Left,
        Self::AudioJoinedFromAnotherDevice,
        Self::AudioAuthenticationRejected,
        Self::AudioCallAtCapacity,
        Self::MeetingEnded,
        Self::AudioInternalServerError,
        Self::AudioServiceUnavailable,
        Self::AudioDisconnected,
        Self::VideoCallSwitchToViewOnly,
        Self::VideoCallAtSourceCapacity,
        Self::SignalingBadRequest,
        Self::SignalingInternalServerError,
        Self::SignalingRequestFailed,
        Self::ICEGatheringTimeoutWorkaround,
        Self::ConnectionHealthReconnect,
        Self::RealtimeApiFailed,
        Self::TaskFailed,
        Self::IncompatibleSDP,
        Self::TURNCredentialsForbidden,
        Self::NoAttendeePresent,
        Self::AudioAttendeeRemoved,
        Self::AudioVideoWasRemovedFromPrimaryMeeting,
        Self::AudioDisconnectAudio,
        Self::SignalChannelClosedUnexpectedly,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for MeetingSessionStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingSessionStatus {
    code: MeetingSessionStatusCode,
}

impl MeetingSessionStatus {
    pub fn new(code: MeetingSessionStatusCode) -> Self {
        Self { code }
    }

    pub fn status_code(&self) -> MeetingSessionStatusCode {
        self.code
    }

    pub fn is_failure(&self) -> bool {
        use MeetingSessionStatusCode::*;
        matches!(
            self.code,
            AudioAuthenticationRejected
                | AudioCallAtCapacity
                | AudioInternalServerError
                | AudioServiceUnavailable
                | AudioDisconnected
                | VideoCallAtSourceCapacity
                | SignalingBadRequest
                | SignalingInternalServerError
                | SignalingRequestFailed
                | ICEGatheringTimeoutWorkaround
                | ConnectionHealthReconnect
                | RealtimeApiFailed
                | TaskFailed
                | NoAttendeePresent
        )
    }

    /// Terminal statuses disable reconnection.
    pub fn is_terminal(&self) -> bool {
        use MeetingSessionStatusCode::*;
        matches!(
            self.code,
            Left | AudioJoinedFromAnotherDevice
                | AudioAuthenticationRejected
                | AudioCallAtCapacity
                | MeetingEnded
                | AudioDisconnected
                | TURNCredentialsForbidden
                | SignalingBadRequest
                | SignalingRequestFailed
                | VideoCallAtSourceCapacity
                | RealtimeApiFailed
                | AudioAttendeeRemoved
        )
    }

    pub fn is_audio_connection_failure(&self) -> bool {
        use MeetingSessionStatusCode::*;
        matches!(
            self.code,
            AudioAuthenticationRejected
                | AudioInternalServerError
                | AudioServiceUnavailable
                | ICEGatheringTimeoutWorkaround
                | SignalingBadRequest
                | SignalingInternalServerError
                | SignalingRequestFailed
                | RealtimeApiFailed
                | NoAttendeePresent
        )
    }

    pub fn description(&self) -> &'static str {
        use MeetingSessionStatusCode::*;
        match self.code {
            OK => "Everything is OK so far.",
            Left => "The attendee left the meeting.",
            AudioJoinedFromAnotherDevice => "The attendee joined from another device.",
            AudioAuthenticationRejected => "The meeting rejected the attendee.",
            AudioCallAtCapacity => "The attendee couldn't join because the meeting was at capacity.",
            MeetingEnded => "The meeting ended.",
            AudioInternalServerError | AudioServiceUnavailable | AudioDisconnected
            | AudioDisconnectAudio => "The audio connection failed.",
            VideoCallSwitchToViewOnly => {
                "The attendee couldn't start the local video because the maximum video capacity was reached."
            }
            VideoCallAtSourceCapacity => "The connection failed due to an internal server error.",
            SignalingBadRequest | SignalingInternalServerError | SignalingRequestFailed => {
                "The signaling connection failed."
            }
            ICEGatheringTimeoutWorkaround => "Gathering ICE candidates timed out.",
            ConnectionHealthReconnect => "The meeting was reconnected.",
            RealtimeApiFailed => "The real-time API failed.",
            TaskFailed => "The connection failed. See the error message for more details.",
            IncompatibleSDP => "The connection failed due to incompatible SDP.",
            TURNCredentialsForbidden => "The meeting ended, or the attendee was removed.",
            NoAttendeePresent => "The attendee was not present.",
            AudioAttendeeRemoved => "The meeting ended because attendee removed.",
            AudioVideoWasRemovedFromPrimaryMeeting => {
                "The primary meeting credentials are no longer valid."
            }
            SignalChannelClosedUnexpectedly => "The signaling connection was closed unexpectedly.",
        }
    }

    /// Status carried by a signal frame. An attached error wins over the
    /// frame body.
    pub fn from_signal_frame(frame: &SignalFrame) -> Self {
        if let Some(error) = frame.error.as_ref().filter(|e| e.status != 0) {
            return Self::from_signaling_status(error.status);
        }
        match &frame.message {
            SignalMessage::AudioStatus(audio) => Self::from_audio_status(audio.audio_status),
            _ => Self::new(MeetingSessionStatusCode::OK),
        }
    }

    fn from_audio_status(status: u32) -> Self {
        use MeetingSessionStatusCode::*;
        let code = match status {
            200 => OK,
            301 => AudioJoinedFromAnotherDevice,
            302 => AudioDisconnectAudio,
            403 => AudioAuthenticationRejected,
            409 => AudioCallAtCapacity,
            410 => MeetingEnded,
            411 => AudioAttendeeRemoved,
            500 => AudioInternalServerError,
            503 => AudioServiceUnavailable,
            200..=299 => OK,
            _ => AudioDisconnected,
        };
        Self::new(code)
    }

    fn from_signaling_status(status: u32) -> Self {
        use MeetingSessionStatusCode::*;
        let code = match status {
            206 => VideoCallSwitchToViewOnly,
            509 => VideoCallAtSourceCapacity,
            403 => AudioAuthenticationRejected,
            409 => AudioCallAtCapacity,
            200..=299 => OK,
            400..=499 => SignalingBadRequest,
            500..=599 => SignalingInternalServerError,
            _ => SignalingRequestFailed,
        };
        Self::new(code)
    }

    /// Recovers a status from the `the meeting status code: N` convention
    /// used in error messages. Kept for callers that only see rendered
    /// errors.
    pub fn from_error_message(message: &str) -> Option<Self> {
        let start = message.find(STATUS_CODE_MARKER)? + STATUS_CODE_MARKER.len();
        let digits: String = message[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let value = digits.parse::<u32>().ok()?;
        MeetingSessionStatusCode::from_u32(value).map(Self::new)
    }

    /// Status for a failed task, defaulting to `TaskFailed`.
    pub fn from_task_error(error: &TaskError) -> Self {
        error
            .status_code()
            .map(Self::new)
            .or_else(|| Self::from_error_message(&error.to_string()))
            .unwrap_or(Self::new(MeetingSessionStatusCode::TaskFailed))
    }
}

impl From<MeetingSessionStatusCode> for MeetingSessionStatus {
    fn from(code: MeetingSessionStatusCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for MeetingSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.description())
    }
}
