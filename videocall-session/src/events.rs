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

//! Telemetry event names and attributes published by the orchestrator.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioVideoEventName {
    MeetingStartRequested,
    MeetingStartSucceeded,
    MeetingStartFailed,
    MeetingReconnected,
    MeetingFailed,
    MeetingEnded,
    SignalingDropped,
    AttendeePresenceReceived,
}

impl AudioVideoEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioVideoEventName::MeetingStartRequested => "meetingStartRequested",
            AudioVideoEventName::MeetingStartSucceeded => "meetingStartSucceeded",
            AudioVideoEventName::MeetingStartFailed => "meetingStartFailed",
            AudioVideoEventName::MeetingReconnected => "meetingReconnected",
            AudioVideoEventName::MeetingFailed => "meetingFailed",
            AudioVideoEventName::MeetingEnded => "meetingEnded",
            AudioVideoEventName::SignalingDropped => "signalingDropped",
            AudioVideoEventName::AttendeePresenceReceived => "attendeePresenceReceived",
        }
    }
}

impl fmt::Display for AudioVideoEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes attached to a lifecycle event. Which fields are set depends
/// on the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioVideoEventAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_video_tile_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signaling_open_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_gathering_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendee_presence_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_start_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poor_connection_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_error_message: Option<String>,
}

/// A published event as seen by bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub name: AudioVideoEventName,
    pub attributes: AudioVideoEventAttributes,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_serialize_sparse_camel_case() {
        let attributes = AudioVideoEventAttributes {
            retry_count: Some(1),
            meeting_status: Some("OK".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&attributes).unwrap();
        assert_eq!(json, r#"{"meetingStatus":"OK","retryCount":1}"#);
        assert_eq!(
            serde_json::to_string(&AudioVideoEventName::SignalingDropped).unwrap(),
            format!("\"{}\"", AudioVideoEventName::SignalingDropped)
        );
    }
}
