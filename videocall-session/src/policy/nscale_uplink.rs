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
use crate::peer::RtpEncodingParameters;
use crate::video_stream_index::VideoStreamIndex;

const DEFAULT_IDEAL_MAX_BANDWIDTH_KBPS: u32 = 1400;
const CAPTURE_FRAME_RATE: u32 = 15;
const SVC_MODE: &str = "L3T3";
const SINGLE_LAYER_MODE: &str = "L1T1";

/// Scales the single camera encoding down as more attendees send video.
#[derive(Debug, Clone)]
pub struct NScaleVideoUplinkBandwidthPolicy {
    self_attendee_id: String,
    num_participants: usize,
    optimal_parameters: VideoCaptureAndEncodeParameters,
    parameters_in_effect: VideoCaptureAndEncodeParameters,
    ideal_max_bandwidth_kbps: u32,
    has_bandwidth_priority: bool,
    svc_enabled: bool,
}

impl NScaleVideoUplinkBandwidthPolicy {
    pub fn new(self_attendee_id: impl Into<String>) -> Self {
        Self {
            self_attendee_id: self_attendee_id.into(),
            num_participants: 0,
            optimal_parameters: VideoCaptureAndEncodeParameters::default(),
            parameters_in_effect: VideoCaptureAndEncodeParameters::default(),
            ideal_max_bandwidth_kbps: DEFAULT_IDEAL_MAX_BANDWIDTH_KBPS,
            has_bandwidth_priority: false,
            svc_enabled: false,
        }
    }

    /// Encode with spatial and temporal layers once more than two
    /// attendees send video.
    pub fn with_svc(mut self, svc_enabled: bool) -> Self {
        self.svc_enabled = svc_enabled;
        self
    }

    fn scalability_mode(&self) -> Option<String> {
        if !self.svc_enabled {
            return None;
        }
        let mode = if self.num_participants > 2 {
            SVC_MODE
        } else {
            SINGLE_LAYER_MODE
        };
        Some(mode.to_string())
    }

    fn capture_width(&self) -> u32 {
        if self.num_participants > 4 {
            320
        } else {
            640
        }
    }

    fn capture_height(&self) -> u32 {
        if self.num_participants > 4 {
            192
        } else {
            384
        }
    }

    fn compute_optimal(&self) -> VideoCaptureAndEncodeParameters {
        VideoCaptureAndEncodeParameters {
            capture_width: self.capture_width(),
            capture_height: self.capture_height(),
            capture_frame_rate: CAPTURE_FRAME_RATE,
            max_encode_bitrate_kbps: self.max_bandwidth_kbps(),
        }
    }
}

impl VideoUplinkBandwidthPolicy for NScaleVideoUplinkBandwidthPolicy {
    fn update_index(&mut self, index: &VideoStreamIndex) {
        self.num_participants = index
            .number_of_video_publishing_participants_excluding_self(&self.self_attendee_id)
            + 1;
        self.optimal_parameters = self.compute_optimal();
    }

    fn wants_resubscribe(&mut self) -> bool {
        self.parameters_in_effect != self.optimal_parameters
    }

    fn choose_capture_and_encode_parameters(&mut self) -> VideoCaptureAndEncodeParameters {
        self.parameters_in_effect = self.optimal_parameters;
        self.parameters_in_effect
    }

    fn choose_encoding_parameters(&mut self) -> EncodingParameters {
        let encoding = RtpEncodingParameters {
            max_bitrate_kbps: self.max_bandwidth_kbps(),
            max_framerate: Some(CAPTURE_FRAME_RATE),
            scalability_mode: self.scalability_mode(),
            ..Default::default()
        };
        EncodingParameters::from([(String::new(), encoding)])
    }

    fn max_bandwidth_kbps(&self) -> u32 {
        let ideal = self.ideal_max_bandwidth_kbps as f64;
        if self.has_bandwidth_priority {
            return self.ideal_max_bandwidth_kbps;
        }
        let n = self.num_participants as f64;
        let rate = if self.num_participants <= 2 {
            ideal
        } else if self.num_participants <= 4 {
            ideal * 2.0 / 3.0
        } else {
            ((544.0 / 11.0 + 14880.0 / (11.0 * n)) / 600.0) * ideal
        };
        rate.trunc() as u32
    }

    fn set_ideal_max_bandwidth_kbps(&mut self, ideal_max_bandwidth_kbps: u32) {
        self.ideal_max_bandwidth_kbps = ideal_max_bandwidth_kbps;
        self.optimal_parameters = self.compute_optimal();
    }

    fn set_has_bandwidth_priority(&mut self, has_bandwidth_priority: bool) {
        self.has_bandwidth_priority = has_bandwidth_priority;
        self.optimal_parameters = self.compute_optimal();
    }
}
