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

//! Bandwidth policies.
//!
//! Uplink policies decide how the local camera is captured and encoded.
//! Downlink policies decide which remote streams to receive. Both are
//! plain state machines fed with the latest [`VideoStreamIndex`]; the
//! orchestrator asks them whether a resubscribe is wanted and applies
//! their choices.

mod adaptive_downlink;
mod all_highest_downlink;
mod nscale_uplink;
mod priority_downlink;
mod simulcast_uplink;
mod video_preferences;

pub use adaptive_downlink::VideoAdaptiveSubscribePolicy;
pub use all_highest_downlink::AllHighestVideoBandwidthPolicy;
pub use nscale_uplink::NScaleVideoUplinkBandwidthPolicy;
pub use priority_downlink::VideoPriorityBasedPolicy;
pub use simulcast_uplink::DefaultSimulcastUplinkPolicy;
pub use video_preferences::{
    TargetDisplaySize, VideoPreference, VideoPreferences, VideoQualityAdaptationPreference,
};

use crate::observer::SimulcastLayers;
use crate::peer::RtpEncodingParameters;
use crate::video_stream_index::VideoStreamIndex;
use log::warn;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use videocall_types::ServerSideNetworkAdaption;

/// Default cap on simultaneously received videos until the server says
/// otherwise.
pub const DEFAULT_VIDEO_SUBSCRIPTION_LIMIT: usize = 25;

/// Encoding parameters keyed by simulcast rid; `""` for a single encoding.
pub type EncodingParameters = HashMap<String, RtpEncodingParameters>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoCaptureAndEncodeParameters {
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_frame_rate: u32,
    pub max_encode_bitrate_kbps: u32,
}

pub trait VideoUplinkBandwidthPolicy: Send {
    fn update_index(&mut self, index: &VideoStreamIndex);
    fn wants_resubscribe(&mut self) -> bool;
    fn choose_capture_and_encode_parameters(&mut self) -> VideoCaptureAndEncodeParameters;
    fn choose_encoding_parameters(&mut self) -> EncodingParameters;
    fn max_bandwidth_kbps(&self) -> u32;
    fn set_ideal_max_bandwidth_kbps(&mut self, ideal_max_bandwidth_kbps: u32);
    fn set_has_bandwidth_priority(&mut self, has_bandwidth_priority: bool);

    /// Estimated uplink bandwidth from the stats collaborator.
    fn update_connection_metric(&mut self, _uplink_kbps: u32) {}

    /// A layer change produced by the last `choose_encoding_parameters`,
    /// returned once.
    fn take_encoding_simulcast_layers_change(&mut self) -> Option<SimulcastLayers> {
        None
    }

    fn is_simulcast(&self) -> bool {
        false
    }
}

pub trait VideoDownlinkBandwidthPolicy: Send {
    fn reset(&mut self);
    fn update_index(&mut self, index: &VideoStreamIndex);
    fn update_available_bandwidth(&mut self, _bandwidth_kbps: u32) {}
    fn wants_resubscribe(&self) -> bool;
    fn choose_subscriptions(&mut self) -> BTreeSet<u32>;
    fn set_subscription_limit(&mut self, limit: usize);
    /// How many `choose_subscriptions` calls had to drop sources.
    fn truncation_warning_count(&self) -> usize;

    /// Per-attendee receive preferences from the application.
    fn choose_remote_video_sources(&mut self, _preferences: VideoPreferences) {}

    /// Preferences in effect, carried into the subscription configuration.
    fn video_preferences(&self) -> Option<&VideoPreferences> {
        None
    }

    fn set_server_side_network_adaption(&mut self, _adaption: ServerSideNetworkAdaption) {}
}

pub type SharedUplinkPolicy = Arc<Mutex<dyn VideoUplinkBandwidthPolicy>>;
pub type SharedDownlinkPolicy = Arc<Mutex<dyn VideoDownlinkBandwidthPolicy>>;

/// Truncates a subscription set to the server limit, keeping the lowest
/// stream ids.
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionLimiter {
    limit: usize,
    warnings: usize,
}

impl Default for SubscriptionLimiter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_VIDEO_SUBSCRIPTION_LIMIT,
            warnings: 0,
        }
    }
}

impl SubscriptionLimiter {
    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub(crate) fn preview(&self, streams: &BTreeSet<u32>) -> BTreeSet<u32> {
        streams.iter().take(self.limit).copied().collect()
    }

    /// Like [`preview`](Self::preview) but records a warning when sources
    /// are dropped.
    pub(crate) fn apply(&mut self, streams: &BTreeSet<u32>) -> BTreeSet<u32> {
        if streams.len() > self.limit {
            self.warnings += 1;
            warn!(
                "subscription limit {} reached, dropping {} of {} video sources",
                self.limit,
                streams.len() - self.limit,
                streams.len()
            );
        }
        self.preview(streams)
    }

    pub(crate) fn warnings(&self) -> usize {
        self.warnings
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::video_stream_index::VideoStreamIndex;
    use videocall_types::{IndexFrame, MediaType, StreamDescriptor};

    pub fn video(stream_id: u32, group_id: u32, attendee: &str, kbps: u32) -> StreamDescriptor {
        StreamDescriptor {
            stream_id,
            group_id,
            attendee_id: attendee.into(),
            media_type: MediaType::Video,
            max_bitrate_kbps: kbps,
            ..Default::default()
        }
    }

    /// An index with one single-layer sender per attendee name.
    pub fn index_with_senders(attendees: &[&str]) -> VideoStreamIndex {
        let sources = attendees
            .iter()
            .enumerate()
            .map(|(i, a)| video(i as u32 + 1, i as u32 + 1, a, 600))
            .collect();
        index_with(sources)
    }

    pub fn index_with(sources: Vec<StreamDescriptor>) -> VideoStreamIndex {
        let mut index = VideoStreamIndex::new();
        index.integrate_index_frame(IndexFrame {
            sources,
            ..Default::default()
        });
        index
    }
}
