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

use super::{EncodingParameters, VideoCaptureAndEncodeParameters, VideoUplinkBandwidthPolicy};
use crate::observer::SimulcastLayers;
use crate::peer::RtpEncodingParameters;
use crate::video_stream_index::VideoStreamIndex;
use log::{debug, info};
use std::time::Duration;
use tokio::time::Instant;

/// Simulcast rids from lowest to highest resolution.
pub const SIMULCAST_RIDS_ASCENDING: [&str; 3] = ["low", "mid", "hi"];

const DEFAULT_UPLINK_BANDWIDTH_KBPS: u32 = 1200;
const STARTUP_DURATION: Duration = Duration::from_millis(6000);
const HOLD_DOWN_DURATION: Duration = Duration::from_millis(4000);
const MAX_FRAME_RATE: u32 = 15;
const HI_DISABLED_RATE_KBPS: u32 = 700;
const MID_DISABLED_RATE_KBPS: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveStreams {
    Hi,
    HiAndLow,
    MidAndLow,
    Low,
}

impl ActiveStreams {
    fn layers(self) -> SimulcastLayers {
        match self {
            ActiveStreams::Hi => SimulcastLayers::High,
            ActiveStreams::HiAndLow => SimulcastLayers::LowAndHigh,
            ActiveStreams::MidAndLow => SimulcastLayers::LowAndMedium,
            ActiveStreams::Low => SimulcastLayers::Low,
        }
    }
}

/// Chooses which of three simulcast layers to publish from the estimated
/// uplink bandwidth and the number of senders.
#[derive(Debug, Clone)]
pub struct DefaultSimulcastUplinkPolicy {
    self_attendee_id: String,
    num_senders: usize,
    num_participants: i64,
    optimal_parameters: VideoCaptureAndEncodeParameters,
    parameters_in_effect: VideoCaptureAndEncodeParameters,
    new_quality_map: EncodingParameters,
    current_quality_map: EncodingParameters,
    new_active_streams: ActiveStreams,
    current_active_streams: ActiveStreams,
    active_streams_to_publish: Option<ActiveStreams>,
    pending_layer_change: Option<SimulcastLayers>,
    last_uplink_bandwidth_kbps: u32,
    started_at: Option<Instant>,
    last_updated: Instant,
}

impl DefaultSimulcastUplinkPolicy {
    pub fn new(self_attendee_id: impl Into<String>) -> Self {
        Self {
            self_attendee_id: self_attendee_id.into(),
            num_senders: 0,
            num_participants: -1,
            optimal_parameters: VideoCaptureAndEncodeParameters::default(),
            parameters_in_effect: VideoCaptureAndEncodeParameters::default(),
            new_quality_map: fill_encoding_params_with_bitrates([300, 0, 1200]),
            current_quality_map: fill_encoding_params_with_bitrates([300, 0, 1200]),
            new_active_streams: ActiveStreams::HiAndLow,
            current_active_streams: ActiveStreams::HiAndLow,
            active_streams_to_publish: None,
            pending_layer_change: None,
            last_uplink_bandwidth_kbps: DEFAULT_UPLINK_BANDWIDTH_KBPS,
            started_at: None,
            last_updated: Instant::now(),
        }
    }

    fn calculate_encoding_parameters(&mut self, num_senders_changed: bool) {
        let bandwidth = self.last_uplink_bandwidth_kbps;
        let (hysteresis_increase, hysteresis_decrease) = match self.current_active_streams {
            ActiveStreams::Hi => (bandwidth + 1, 0),
            ActiveStreams::HiAndLow => (2400, HI_DISABLED_RATE_KBPS),
            ActiveStreams::MidAndLow => (1000, MID_DISABLED_RATE_KBPS),
            ActiveStreams::Low => (300, 0),
        };

        if !(num_senders_changed
            || bandwidth >= hysteresis_increase
            || bandwidth <= hysteresis_decrease)
        {
            return;
        }

        let bitrates = if (0..=2).contains(&self.num_participants) {
            self.new_active_streams = ActiveStreams::Hi;
            [0, 0, 1200]
        } else if self.num_senders <= 4 && bandwidth >= HI_DISABLED_RATE_KBPS {
            self.new_active_streams = ActiveStreams::HiAndLow;
            [300, 0, 1200]
        } else if bandwidth >= MID_DISABLED_RATE_KBPS {
            self.new_active_streams = ActiveStreams::MidAndLow;
            let low = if bandwidth >= 350 { 200 } else { 150 };
            let mid = if self.num_senders <= 6 { 600 } else { 350 };
            [low, mid, 0]
        } else {
            self.new_active_streams = ActiveStreams::Low;
            [300, 0, 0]
        };

        self.new_quality_map = fill_encoding_params_with_bitrates(bitrates);
        if !self.encoding_parameters_equal() {
            info!(
                "simulcast: policy calculated bw:{bandwidth} numSources:{} numClients:{} bitrates:{bitrates:?}",
                self.num_senders, self.num_participants
            );
        }
    }

    fn encoding_parameters_equal(&self) -> bool {
        SIMULCAST_RIDS_ASCENDING
            .iter()
            .all(|rid| self.new_quality_map.get(*rid) == self.current_quality_map.get(*rid))
    }
}

fn fill_encoding_params_with_bitrates(bitrates_kbps: [u32; 3]) -> EncodingParameters {
    let mut scale = 4.0;
    let mut map = EncodingParameters::new();
    for (rid, bitrate) in SIMULCAST_RIDS_ASCENDING.iter().zip(bitrates_kbps) {
        map.insert(
            rid.to_string(),
            RtpEncodingParameters {
                rid: Some(rid.to_string()),
                active: bitrate > 0,
                max_bitrate_kbps: bitrate,
                scale_resolution_down_by: scale,
                max_framerate: Some(MAX_FRAME_RATE),
                scalability_mode: None,
            },
        );
        scale /= 2.0;
    }
    map
}

impl VideoUplinkBandwidthPolicy for DefaultSimulcastUplinkPolicy {
    fn update_index(&mut self, index: &VideoStreamIndex) {
        let num_senders = index
            .number_of_video_publishing_participants_excluding_self(&self.self_attendee_id)
            + 1;
        let num_participants = index
            .number_of_participants()
            .map(i64::from)
            .unwrap_or(-1);
        let num_senders_changed = num_senders != self.num_senders;
        let num_participants_changed = (num_participants > 2 && self.num_participants <= 2)
            || (num_participants <= 2 && self.num_participants > 2);
        self.num_senders = num_senders;
        self.num_participants = num_participants;
        self.optimal_parameters = VideoCaptureAndEncodeParameters {
            capture_width: 1280,
            capture_height: 768,
            capture_frame_rate: MAX_FRAME_RATE,
            max_encode_bitrate_kbps: self.max_bandwidth_kbps(),
        };
        self.calculate_encoding_parameters(num_senders_changed || num_participants_changed);
    }

    fn wants_resubscribe(&mut self) -> bool {
        let changed = !self.encoding_parameters_equal();
        if changed {
            self.last_updated = Instant::now();
        }
        changed
    }

    fn choose_capture_and_encode_parameters(&mut self) -> VideoCaptureAndEncodeParameters {
        self.parameters_in_effect = self.optimal_parameters;
        self.parameters_in_effect
    }

    fn choose_encoding_parameters(&mut self) -> EncodingParameters {
        self.current_quality_map = self.new_quality_map.clone();
        self.current_active_streams = self.new_active_streams;
        if self.active_streams_to_publish != Some(self.new_active_streams) {
            self.active_streams_to_publish = Some(self.new_active_streams);
            self.pending_layer_change = Some(self.new_active_streams.layers());
        }
        self.current_quality_map.clone()
    }

    fn max_bandwidth_kbps(&self) -> u32 {
        1400
    }

    fn set_ideal_max_bandwidth_kbps(&mut self, _ideal_max_bandwidth_kbps: u32) {}

    fn set_has_bandwidth_priority(&mut self, _has_bandwidth_priority: bool) {}

    fn update_connection_metric(&mut self, uplink_kbps: u32) {
        let now = Instant::now();
        let started_at = *self.started_at.get_or_insert(now);
        self.last_uplink_bandwidth_kbps = if now.duration_since(started_at) < STARTUP_DURATION {
            DEFAULT_UPLINK_BANDWIDTH_KBPS
        } else {
            uplink_kbps
        };
        debug!(
            "simulcast: uplink policy update metrics {}",
            self.last_uplink_bandwidth_kbps
        );

        let hold_time = match self.current_active_streams {
            ActiveStreams::Low => HOLD_DOWN_DURATION * 2,
            ActiveStreams::MidAndLow if uplink_kbps <= MID_DISABLED_RATE_KBPS => {
                HOLD_DOWN_DURATION / 2
            }
            ActiveStreams::HiAndLow if uplink_kbps <= HI_DISABLED_RATE_KBPS => {
                HOLD_DOWN_DURATION / 2
            }
            _ => HOLD_DOWN_DURATION,
        };
        if now < self.last_updated + hold_time {
            return;
        }
        self.calculate_encoding_parameters(false);
    }

    fn take_encoding_simulcast_layers_change(&mut self) -> Option<SimulcastLayers> {
        self.pending_layer_change.take()
    }

    fn is_simulcast(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::video;
    use videocall_types::IndexFrame;

    fn index_with_participants(senders: u32, participants: u32) -> VideoStreamIndex {
        let mut index = VideoStreamIndex::new();
        index.integrate_index_frame(IndexFrame {
            sources: (1..=senders)
                .map(|i| video(i, i, &format!("a{i}"), 600))
                .collect(),
            num_participants: Some(participants),
            ..Default::default()
        });
        index
    }

    #[tokio::test(start_paused = true)]
    async fn two_participants_publish_only_high() {
        let mut policy = DefaultSimulcastUplinkPolicy::new("me");
        policy.update_index(&index_with_participants(1, 2));
        assert!(policy.wants_resubscribe());
        let encodings = policy.choose_encoding_parameters();
        assert!(!encodings["low"].active);
        assert!(!encodings["mid"].active);
        assert!(encodings["hi"].active);
        assert_eq!(encodings["hi"].scale_resolution_down_by, 1.0);
        assert_eq!(encodings["low"].scale_resolution_down_by, 4.0);
        assert_eq!(
            policy.take_encoding_simulcast_layers_change(),
            Some(SimulcastLayers::High)
        );
        assert_eq!(policy.take_encoding_simulcast_layers_change(), None);
        assert!(!policy.wants_resubscribe());
    }

    #[tokio::test(start_paused = true)]
    async fn congested_uplink_after_startup_falls_back_to_low_only() {
        let mut policy = DefaultSimulcastUplinkPolicy::new("me");
        policy.update_index(&index_with_participants(5, 6));
        let encodings = policy.choose_encoding_parameters();
        assert_eq!(encodings["low"].max_bitrate_kbps, 200);
        assert_eq!(encodings["mid"].max_bitrate_kbps, 600);
        assert!(!encodings["hi"].active);
        assert_eq!(
            policy.take_encoding_simulcast_layers_change(),
            Some(SimulcastLayers::LowAndMedium)
        );

        // Inside the startup window the estimate is ignored.
        policy.update_connection_metric(200);
        assert!(!policy.wants_resubscribe());

        tokio::time::advance(Duration::from_secs(7)).await;
        policy.update_connection_metric(200);
        assert!(policy.wants_resubscribe());
        let encodings = policy.choose_encoding_parameters();
        assert!(encodings["low"].active);
        assert!(!encodings["mid"].active);
        assert!(!encodings["hi"].active);
        assert_eq!(
            policy.take_encoding_simulcast_layers_change(),
            Some(SimulcastLayers::Low)
        );
    }
}
