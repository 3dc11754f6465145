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
use std::collections::BTreeSet;

/// Receives the highest bitrate layer of every remote source.
#[derive(Debug, Clone)]
pub struct AllHighestVideoBandwidthPolicy {
    self_attendee_id: String,
    optimal_received: BTreeSet<u32>,
    subscribed: BTreeSet<u32>,
    limiter: SubscriptionLimiter,
}

impl AllHighestVideoBandwidthPolicy {
    pub fn new(self_attendee_id: impl Into<String>) -> Self {
        Self {
            self_attendee_id: self_attendee_id.into(),
            optimal_received: BTreeSet::new(),
            subscribed: BTreeSet::new(),
            limiter: SubscriptionLimiter::default(),
        }
    }
}

impl VideoDownlinkBandwidthPolicy for AllHighestVideoBandwidthPolicy {
    fn reset(&mut self) {
        self.optimal_received.clear();
        self.subscribed.clear();
    }

    fn update_index(&mut self, index: &VideoStreamIndex) {
        self.optimal_received =
            index.highest_quality_stream_from_each_group_excluding_self(&self.self_attendee_id);
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
    use crate::policy::test_support::{index_with, index_with_senders, video};

    #[test]
    fn picks_highest_layer_per_group_and_skips_self() {
        let mut policy = AllHighestVideoBandwidthPolicy::new("me");
        policy.update_index(&index_with(vec![
            video(1, 1, "a", 300),
            video(2, 1, "a", 1200),
            video(3, 2, "b", 600),
            video(4, 3, "me", 1200),
        ]));
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 3]));
        assert!(!policy.wants_resubscribe());

        policy.reset();
        assert!(policy.choose_subscriptions().is_empty());
    }

    #[test]
    fn truncates_to_limit_and_warns_once_per_choice() {
        let mut policy = AllHighestVideoBandwidthPolicy::new("me");
        policy.set_subscription_limit(2);
        policy.update_index(&index_with_senders(&["a", "b", "c"]));

        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([1, 2]));
        assert_eq!(policy.truncation_warning_count(), 1);
        // The truncated set is what was subscribed, so nothing more is wanted.
        assert!(!policy.wants_resubscribe());
        assert_eq!(policy.truncation_warning_count(), 1);
    }
}
