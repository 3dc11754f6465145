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

use super::{SubscriptionLimiter, VideoDownlinkBandwidthPolicy};
use crate::video_stream_index::VideoStreamIndex;
use log::debug;
use std::collections::BTreeSet;

const DEFAULT_DOWNLINK_BANDWIDTH_KBPS: u32 = 2000;

/// Fits one stream per remote attendee into the available downlink
/// bandwidth, starting everyone at their lowest layer and upgrading in
/// index order while the budget allows.
#[derive(Debug, Clone)]
pub struct VideoAdaptiveSubscribePolicy {
    self_attendee_id: String,
    available_bandwidth_kbps: u32,
    last_index: Option<VideoStreamIndex>,
    optimal_received: BTreeSet<u32>,
    subscribed: BTreeSet<u32>,
    limiter: SubscriptionLimiter,
}

impl VideoAdaptiveSubscribePolicy {
    pub fn new(self_attendee_id: impl Into<String>) -> Self {
        Self::with_bandwidth(self_attendee_id, DEFAULT_DOWNLINK_BANDWIDTH_KBPS)
    }

    pub fn with_bandwidth(self_attendee_id: impl Into<String>, bandwidth_kbps: u32) -> Self {
        Self {
            self_attendee_id: self_attendee_id.into(),
            available_bandwidth_kbps: bandwidth_kbps,
            last_index: None,
            optimal_received: BTreeSet::new(),
            subscribed: BTreeSet::new(),
            limiter: SubscriptionLimiter::default(),
        }
    }

    fn recompute(&mut self) {
        let Some(index) = &self.last_index else {
            return;
        };
        self.optimal_received = index.stream_selection_under_bandwidth_constraint(
            &self.self_attendee_id,
            &BTreeSet::new(),
            &BTreeSet::new(),
            self.available_bandwidth_kbps,
        );
        debug!(
            "adaptive downlink selected {:?} under {} kbps",
            self.optimal_received, self.available_bandwidth_kbps
        );
    }
}

impl VideoDownlinkBandwidthPolicy for VideoAdaptiveSubscribePolicy {
    fn reset(&mut self) {
        self.last_index = None;
        self.optimal_received.clear();
        self.subscribed.clear();
    }

    fn update_index(&mut self, index: &VideoStreamIndex) {
        self.last_index = Some(index.clone());
        self.recompute();
    }

    fn update_available_bandwidth(&mut self, bandwidth_kbps: u32) {
        if bandwidth_kbps == self.available_bandwidth_kbps {
            return;
        }
        self.available_bandwidth_kbps = bandwidth_kbps;
        self.recompute();
    }

    fn wants_resubscribe(&self) -> bool {
        self.limiter.preview(&self.optimal_received) != self.subscribed
    }

    fn choose_subscriptions(&mut self) -> BTreeSet<u32> {
        self.subscribed = self.limiter.apply(&self.optimal_received);
        self.subscribed.clone()
    }

    fn set_subscription_limit(&mut self, limit: usize) {
        self.limiter.set_limit(limit);
    }

    fn truncation_warning_count(&self) -> usize {
        self.limiter.warnings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::{index_with, video};

    fn two_layer_senders() -> VideoStreamIndex {
        index_with(vec![
            video(1, 1, "a", 200),
            video(2, 1, "a", 1200),
            video(3, 2, "b", 200),
            video(4, 2, "b", 1200),
        ])
    }

    #[test]
    fn upgrades_in_order_until_budget_runs_out() {
        let mut policy = VideoAdaptiveSubscribePolicy::new("me");
        policy.update_index(&two_layer_senders());
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 3]));
        assert!(!policy.wants_resubscribe());
    }

    #[test]
    fn more_bandwidth_upgrades_everyone() {
        let mut policy = VideoAdaptiveSubscribePolicy::new("me");
        policy.update_index(&two_layer_senders());
        policy.choose_subscriptions();

        policy.update_available_bandwidth(3000);
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 4]));

        policy.update_available_bandwidth(300);
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([1, 3]));
    }

    #[test]
    fn bandwidth_without_index_selects_nothing() {
        let mut policy = VideoAdaptiveSubscribePolicy::new("me");
        policy.update_available_bandwidth(5000);
        assert!(!policy.wants_resubscribe());
        assert!(policy.choose_subscriptions().is_empty());
    }
}
