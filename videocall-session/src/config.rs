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

//! Session configuration.
//!
//! Loaded from YAML with [`MeetingSessionConfiguration::from_file`] or
//! assembled from the environment with
//! [`MeetingSessionConfiguration::from_env_or_default`].

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use videocall_types::ServerSideNetworkAdaption;

const ENV_PREFIX: &str = "FEATURE_";

/// Video codecs the sender may prefer, in SDP `rtpmap` spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264ConstrainedBaseline,
    H264Baseline,
    #[serde(rename = "vp8")]
    VP8,
    #[serde(rename = "vp9")]
    VP9,
    #[serde(rename = "av1")]
    AV1,
}

impl VideoCodec {
    /// Encoding name as it appears in an `a=rtpmap` line.
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            VideoCodec::H264ConstrainedBaseline | VideoCodec::H264Baseline => "H264",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::AV1 => "AV1",
        }
    }
}

/// Thresholds for [`ReconnectionHealthPolicy`](crate::connection_health::ReconnectionHealthPolicy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionHealthPolicyConfiguration {
    pub consecutive_stats_with_no_packets_threshold: u32,
    pub connection_wait_after_start_ms: u64,
    pub missed_pongs_upper_threshold: u32,
    pub maximum_audio_delay_ms: u64,
    pub maximum_audio_delay_data_points: usize,
}

impl Default for ConnectionHealthPolicyConfiguration {
    fn default() -> Self {
        Self {
            consecutive_stats_with_no_packets_threshold: 25,
            connection_wait_after_start_ms: 10_000,
            missed_pongs_upper_threshold: 4,
            maximum_audio_delay_ms: 60_000,
            maximum_audio_delay_data_points: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingSessionConfiguration {
    pub meeting_id: String,
    pub attendee_id: String,
    pub external_user_id: String,
    pub join_token: String,
    /// Control plane endpoint, e.g. `wss://host/control/<meeting>`.
    pub signaling_url: String,
    /// TURN credentials endpoint. Empty keeps whatever JOIN_ACK provided.
    pub turn_control_url: String,

    /// Deadline for the whole connect pipeline.
    pub connection_timeout_ms: u64,
    /// 0 disables waiting for our own attendee presence.
    pub attendee_presence_timeout_ms: u64,
    /// Reconnection gives up after this long without success.
    pub reconnect_timeout_ms: u64,
    pub reconnect_fixed_wait_ms: u64,
    pub reconnect_short_backoff_ms: u64,
    pub reconnect_long_backoff_ms: u64,

    pub enable_simulcast: bool,
    pub enable_svc: bool,
    /// Receive video by attendee priority instead of the default downlink.
    pub enable_priority_downlink: bool,
    pub enable_unified_plan: bool,
    pub video_subscription_limit: usize,
    pub ideal_max_bandwidth_kbps: u32,
    pub downlink_bandwidth_kbps: u32,
    pub server_side_network_adaption: ServerSideNetworkAdaption,
    pub video_codec_preferences: Vec<VideoCodec>,
    pub audio_red_enabled: bool,

    pub connection_health: ConnectionHealthPolicyConfiguration,
}

impl Default for MeetingSessionConfiguration {
    fn default() -> Self {
        Self {
            meeting_id: String::new(),
            attendee_id: String::new(),
            external_user_id: String::new(),
            join_token: String::new(),
            signaling_url: String::new(),
            turn_control_url: String::new(),
            connection_timeout_ms: 15_000,
            attendee_presence_timeout_ms: 0,
            reconnect_timeout_ms: 120_000,
            reconnect_fixed_wait_ms: 0,
            reconnect_short_backoff_ms: 1_000,
            reconnect_long_backoff_ms: 5_000,
            enable_simulcast: false,
            enable_svc: false,
            enable_priority_downlink: false,
            enable_unified_plan: true,
            video_subscription_limit: 25,
            ideal_max_bandwidth_kbps: 1_400,
            downlink_bandwidth_kbps: 2_000,
            server_side_network_adaption: ServerSideNetworkAdaption::Default,
            video_codec_preferences: vec![VideoCodec::H264ConstrainedBaseline, VideoCodec::VP8],
            audio_red_enabled: false,
            connection_health: ConnectionHealthPolicyConfiguration::default(),
        }
    }
}

impl MeetingSessionConfiguration {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: MeetingSessionConfiguration = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_default() -> Result<Self, ConfigError> {
        if let Ok(config_path) = std::env::var("VIDEOCALL_SESSION_CONFIG") {
            return Self::from_file(config_path);
        }

        let defaults = Self::default();
        let config = Self {
            meeting_id: std::env::var("MEETING_ID").unwrap_or_default(),
            attendee_id: std::env::var("ATTENDEE_ID").unwrap_or_default(),
            join_token: std::env::var("JOIN_TOKEN").unwrap_or_default(),
            signaling_url: std::env::var("SIGNALING_URL").unwrap_or_default(),
            turn_control_url: std::env::var("TURN_CONTROL_URL").unwrap_or_default(),
            enable_simulcast: read_bool_env("SIMULCAST"),
            enable_svc: read_bool_env("SVC"),
            enable_priority_downlink: read_bool_env("PRIORITY_DOWNLINK"),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_timeout_ms must be positive".into(),
            ));
        }
        if self.video_subscription_limit == 0 {
            return Err(ConfigError::Invalid(
                "video_subscription_limit must be positive".into(),
            ));
        }
        if self.reconnect_short_backoff_ms > self.reconnect_long_backoff_ms {
            return Err(ConfigError::Invalid(
                "reconnect_short_backoff_ms exceeds reconnect_long_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// The URL used to open signaling, carrying the join token.
    pub fn signaling_url_with_token(&self) -> String {
        if self.join_token.is_empty() {
            return self.signaling_url.clone();
        }
        let separator = if self.signaling_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{separator}X-Join-Token={}", self.signaling_url, self.join_token)
    }
}

fn read_bool_env(name: &str) -> bool {
    let full_name = format!("{ENV_PREFIX}{name}");
    std::env::var(&full_name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}
