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

//! Receives remote video in the order the application ranks attendees.
//!
//! Every preferred attendee first gets their lowest layer, highest priority
//! first, then layers are upgraded while the target downlink rate allows.
//! Lower priorities are only served once the top priority has reached the
//! best layer its target display size calls for.

use super::video_preferences::{
    TargetDisplaySize, VideoPreference, VideoPreferences, VideoQualityAdaptationPreference,
};
use super::{SubscriptionLimiter, VideoDownlinkBandwidthPolicy};
use crate::video_stream_index::VideoStreamIndex;
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use videocall_types::{ServerSideNetworkAdaption, StreamDescriptor};

const DEFAULT_BANDWIDTH_KBPS: u32 = 2800;
const MAX_TARGET_BANDWIDTH_KBPS: u32 = 15_000;
const STARTUP_PERIOD: Duration = Duration::from_secs(6);
const MIN_TIME_BETWEEN_SUBSCRIBES: Duration = Duration::from_secs(2);
const TARGET_RATE_CHANGE_TRIGGER_PERCENT: u32 = 15;
const LOW_BITRATE_THRESHOLD_KBPS: u32 = 300;
const CONTENT_ATTENDEE_SUFFIX: &str = "#content";

/// A remote stream as the policy weighs it.
#[derive(Debug, Clone)]
struct Candidate {
    stream_id: u32,
    group_id: u32,
    attendee_id: String,
    max_kbps: u32,
    avg_kbps: u32,
    pixels: u32,
    framerate: u32,
}

impl Candidate {
    fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        let mut max_kbps = descriptor.max_bitrate_kbps;
        let mut avg_kbps = descriptor.avg_bitrate_bps / 1000;
        if avg_kbps == 0 || avg_kbps > max_kbps {
            if is_content(&descriptor.attendee_id) && max_kbps < 100 {
                max_kbps = avg_kbps;
            } else {
                avg_kbps = max_kbps;
            }
        }
        Self {
            stream_id: descriptor.stream_id,
            group_id: descriptor.group_id,
            attendee_id: descriptor.attendee_id.clone(),
            max_kbps,
            avg_kbps,
            pixels: descriptor.width * descriptor.height,
            framerate: descriptor.framerate,
        }
    }
}

fn is_content(attendee_id: &str) -> bool {
    attendee_id.ends_with(CONTENT_ATTENDEE_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct VideoPriorityBasedPolicy {
    self_attendee_id: String,
    index: Option<VideoStreamIndex>,
    preferences: Option<VideoPreferences>,
    default_preferences: VideoPreferences,
    preferences_updated: bool,
    server_adapts_remote_video: bool,
    /// Preferences changed while the server adapts; the new ones must be sent
    /// even if the stream set is unchanged.
    preferences_pending: bool,
    estimate_kbps: Option<u32>,
    first_estimate_at: Option<Instant>,
    startup_period: bool,
    prev_target_kbps: u32,
    rate_baseline_kbps: Option<u32>,
    previous_stream_keys: Option<BTreeSet<(u32, u32, u32)>>,
    optimal: BTreeSet<u32>,
    subscribed: BTreeSet<u32>,
    last_subscribe_at: Option<Instant>,
    limiter: SubscriptionLimiter,
}

impl VideoPriorityBasedPolicy {
    pub fn new(self_attendee_id: impl Into<String>) -> Self {
        Self {
            self_attendee_id: self_attendee_id.into(),
            index: None,
            preferences: None,
            default_preferences: VideoPreferences::new(),
            preferences_updated: false,
            server_adapts_remote_video: false,
            preferences_pending: false,
            estimate_kbps: None,
            first_estimate_at: None,
            startup_period: true,
            prev_target_kbps: DEFAULT_BANDWIDTH_KBPS,
            rate_baseline_kbps: None,
            previous_stream_keys: None,
            optimal: BTreeSet::new(),
            subscribed: BTreeSet::new(),
            last_subscribe_at: None,
            limiter: SubscriptionLimiter::default(),
        }
    }

    fn current_preferences(&self) -> &VideoPreferences {
        self.preferences.as_ref().unwrap_or(&self.default_preferences)
    }

    /// Everyone at priority 1, with a display size that shrinks as the
    /// room grows.
    fn update_default_preferences(&mut self, index: &VideoStreamIndex) {
        let attendees = index.all_video_sending_attendees_excluding_self(&self.self_attendee_id);
        let target_size = match attendees.len() {
            n if n > 8 => TargetDisplaySize::Low,
            n if n > 4 => TargetDisplaySize::Medium,
            _ => TargetDisplaySize::Maximum,
        };
        self.default_preferences = attendees
            .into_iter()
            .map(|attendee| VideoPreference::new(attendee, 1).with_target_size(target_size))
            .collect();
    }

    fn target_rate_kbps(&self) -> u32 {
        let target = match self.estimate_kbps {
            _ if self.startup_period => DEFAULT_BANDWIDTH_KBPS,
            Some(kbps) if kbps > 0 => kbps,
            _ => self.prev_target_kbps,
        };
        if target > MAX_TARGET_BANDWIDTH_KBPS {
            warn!(
                "downlink target {target} kbps exceeds {MAX_TARGET_BANDWIDTH_KBPS}, \
                 lower the target display sizes to avoid this"
            );
        }
        target.min(MAX_TARGET_BANDWIDTH_KBPS)
    }

    fn recompute(&mut self, now: Instant) {
        let preferences = self.current_preferences().clone();
        let Some(index) = &self.index else {
            return;
        };
        let mut candidates: Vec<Candidate> = index
            .remote_video_streams(&self.self_attendee_id)
            .iter()
            .filter(|d| preferences.contains(&d.attendee_id))
            .map(Candidate::from_descriptor)
            .collect();
        if candidates.is_empty() || preferences.is_empty() {
            self.optimal.clear();
            return;
        }

        if self.server_adapts_remote_video {
            self.optimal = highest_stream_per_group(&candidates);
            return;
        }

        let keys: BTreeSet<(u32, u32, u32)> = candidates
            .iter()
            .map(|c| (c.group_id, c.stream_id, c.max_kbps))
            .collect();
        let same_choices =
            !self.preferences_updated && self.previous_stream_keys.as_ref() == Some(&keys);
        let no_major_change = !self.startup_period && same_choices;
        if no_major_change
            && self
                .last_subscribe_at
                .is_some_and(|at| now.duration_since(at) < MIN_TIME_BETWEEN_SUBSCRIBES)
        {
            return;
        }

        candidates.sort_by(|a, b| {
            a.max_kbps
                .cmp(&b.max_kbps)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        let candidates = drop_ladder_downgrades(candidates, &preferences);
        let target_kbps = self.target_rate_kbps();
        let selection = choose_by_priority(&preferences, &candidates, target_kbps);
        self.previous_stream_keys = Some(keys);
        self.preferences_updated = false;

        if no_major_change && selection.delta_to_next_upgrade_kbps != 0 {
            let trigger_percent = if target_kbps > LOW_BITRATE_THRESHOLD_KBPS {
                TARGET_RATE_CHANGE_TRIGGER_PERCENT
            } else {
                TARGET_RATE_CHANGE_TRIGGER_PERCENT * 2
            };
            let min_delta_kbps = target_kbps * trigger_percent / 100;
            let baseline = *self.rate_baseline_kbps.get_or_insert(self.prev_target_kbps);
            if selection.stream_ids != self.optimal
                && target_kbps.abs_diff(baseline) < min_delta_kbps
            {
                debug!("target {target_kbps} kbps is close to {baseline} kbps, keeping streams");
                self.prev_target_kbps = target_kbps;
                return;
            }
            self.rate_baseline_kbps = Some(target_kbps);
        }

        if selection.stream_ids != self.optimal {
            info!(
                "priority downlink selected {:?} under {target_kbps} kbps",
                selection.stream_ids
            );
        }
        self.prev_target_kbps = target_kbps;
        self.optimal = selection.stream_ids;
    }
}

fn highest_stream_per_group(candidates: &[Candidate]) -> BTreeSet<u32> {
    let mut highest: BTreeMap<u32, &Candidate> = BTreeMap::new();
    for candidate in candidates {
        let entry = highest.entry(candidate.group_id).or_insert(candidate);
        if candidate.max_kbps > entry.max_kbps {
            *entry = candidate;
        }
    }
    highest.values().map(|c| c.stream_id).collect()
}

/// Removes layers that would lower resolution, or noticeably lower frame
/// rate, on the way up an attendee's ladder.
fn drop_ladder_downgrades(
    candidates: Vec<Candidate>,
    preferences: &VideoPreferences,
) -> Vec<Candidate> {
    let mut removed = BTreeSet::new();
    for preference in preferences {
        let mut ladder: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.attendee_id == preference.attendee_id)
            .collect();
        if ladder.len() < 3 {
            continue;
        }
        let max_framerate = ladder.iter().map(|c| c.framerate).fold(15, u32::max);
        let max_pixels = ladder.iter().map(|c| c.pixels).fold(320 * 480, u32::max);
        ladder.sort_by(|a, b| {
            ladder_order(
                a,
                b,
                preference.degradation_preference,
                max_framerate,
                max_pixels,
            )
        });

        let mut last: Option<&Candidate> = None;
        for candidate in ladder {
            if let Some(previous) = last {
                let framerate_drop = candidate.framerate + 2 < previous.framerate;
                if framerate_drop || candidate.pixels < previous.pixels {
                    removed.insert(candidate.stream_id);
                    continue;
                }
            }
            last = Some(candidate);
        }
    }
    candidates
        .into_iter()
        .filter(|c| !removed.contains(&c.stream_id))
        .collect()
}

fn ladder_order(
    a: &Candidate,
    b: &Candidate,
    preference: VideoQualityAdaptationPreference,
    max_framerate: u32,
    max_pixels: u32,
) -> Ordering {
    match preference {
        // Frame rate ascends slowest, so every step up raises resolution.
        VideoQualityAdaptationPreference::MaintainResolution => {
            if a.framerate.abs_diff(b.framerate) < 2 {
                a.pixels.cmp(&b.pixels)
            } else {
                a.framerate.cmp(&b.framerate)
            }
        }
        VideoQualityAdaptationPreference::MaintainFramerate => a
            .pixels
            .cmp(&b.pixels)
            .then_with(|| a.framerate.cmp(&b.framerate)),
        VideoQualityAdaptationPreference::Balanced => {
            let weight = |c: &Candidate| balanced_weight(c, max_framerate, max_pixels);
            weight(a).total_cmp(&weight(b))
        }
    }
}

/// Bitrate scaled so low rungs lean towards resolution and high rungs
/// towards frame rate.
fn balanced_weight(candidate: &Candidate, max_framerate: u32, max_pixels: u32) -> f64 {
    const FRAMERATE_EXPONENT: f64 = 5.0;
    const RESOLUTION_BASE: f64 = 2.0;
    let framerate_share = f64::from(candidate.framerate) / f64::from(max_framerate);
    let pixel_share = f64::from(candidate.pixels) / f64::from(max_pixels);
    let exponent = FRAMERATE_EXPONENT * framerate_share * (RESOLUTION_BASE * 2.0).powf(pixel_share);
    f64::from(candidate.avg_kbps) * 2f64.powf(exponent)
}

struct Selection {
    stream_ids: BTreeSet<u32>,
    /// Cost of the first upgrade that did not fit, 0 when everything fit.
    delta_to_next_upgrade_kbps: u32,
}

/// `candidates` must be sorted by ascending bitrate.
fn choose_by_priority(
    preferences: &VideoPreferences,
    candidates: &[Candidate],
    target_kbps: u32,
) -> Selection {
    let mut chosen: Vec<&Candidate> = Vec::new();
    let mut total_kbps = 0;
    let mut delta_kbps = 0;
    let highest_priority = preferences.highest_priority();

    for level in preferences.priority_levels() {
        let at_level: Vec<&VideoPreference> =
            preferences.iter().filter(|p| p.priority == level).collect();

        for preference in &at_level {
            for candidate in candidates
                .iter()
                .filter(|c| c.attendee_id == preference.attendee_id)
            {
                if chosen.iter().any(|s| s.group_id == candidate.group_id) {
                    continue;
                }
                if total_kbps + candidate.avg_kbps <= target_kbps {
                    chosen.push(candidate);
                    total_kbps += candidate.avg_kbps;
                } else if delta_kbps == 0 {
                    delta_kbps = candidate.avg_kbps;
                }
            }
        }

        for preference in &at_level {
            for candidate in candidates
                .iter()
                .filter(|c| c.attendee_id == preference.attendee_id)
            {
                let Some(slot) = chosen.iter().position(|s| {
                    s.group_id == candidate.group_id
                        && s.max_kbps <= candidate.max_kbps
                        && s.avg_kbps < candidate.avg_kbps
                }) else {
                    continue;
                };
                if !has_simulcast_streams(candidates, candidate) {
                    continue;
                }
                if !can_upgrade(candidate, preference) {
                    debug!(
                        "not upgrading {} beyond its target size",
                        candidate.attendee_id
                    );
                    continue;
                }
                let increase_kbps = candidate.avg_kbps - chosen[slot].avg_kbps;
                if total_kbps + increase_kbps <= target_kbps {
                    total_kbps += increase_kbps;
                    chosen[slot] = candidate;
                } else if delta_kbps == 0 {
                    delta_kbps = increase_kbps;
                }
            }
        }

        if Some(level) == highest_priority && delta_kbps != 0 {
            break;
        }
    }

    Selection {
        stream_ids: chosen.iter().map(|c| c.stream_id).collect(),
        delta_to_next_upgrade_kbps: delta_kbps,
    }
}

fn has_simulcast_streams(candidates: &[Candidate], candidate: &Candidate) -> bool {
    candidates
        .iter()
        .filter(|c| c.attendee_id == candidate.attendee_id && c.group_id == candidate.group_id)
        .count()
        > 1
}

/// `High` asks for the best layer regardless of bitrate. Content is only
/// capped by its target when the target is `Medium`.
fn can_upgrade(candidate: &Candidate, preference: &VideoPreference) -> bool {
    let within_target = candidate.avg_kbps <= preference.target_bitrate_kbps();
    match preference.target_size {
        TargetDisplaySize::High => true,
        _ if !is_content(&candidate.attendee_id) => within_target,
        TargetDisplaySize::Medium => within_target,
        _ => false,
    }
}

impl VideoDownlinkBandwidthPolicy for VideoPriorityBasedPolicy {
    fn reset(&mut self) {
        let server_adapts_remote_video = self.server_adapts_remote_video;
        let limiter = self.limiter.clone();
        *self = Self::new(std::mem::take(&mut self.self_attendee_id));
        self.server_adapts_remote_video = server_adapts_remote_video;
        self.limiter = limiter;
    }

    fn update_index(&mut self, index: &VideoStreamIndex) {
        if self.preferences.is_none() {
            self.update_default_preferences(index);
        }
        self.index = Some(index.clone());
        self.recompute(Instant::now());
    }

    fn update_available_bandwidth(&mut self, bandwidth_kbps: u32) {
        let now = Instant::now();
        let previous = self.estimate_kbps.replace(bandwidth_kbps);
        if bandwidth_kbps > 0 && self.startup_period {
            let first = *self.first_estimate_at.get_or_insert(now);
            let settled = now.duration_since(first) > STARTUP_PERIOD
                && previous.is_some_and(|p| bandwidth_kbps <= p);
            if bandwidth_kbps > DEFAULT_BANDWIDTH_KBPS || settled {
                info!("downlink estimate settled at {bandwidth_kbps} kbps");
                self.startup_period = false;
            }
        }
        self.recompute(now);
    }

    fn wants_resubscribe(&self) -> bool {
        self.preferences_pending || self.limiter.preview(&self.optimal) != self.subscribed
    }

    fn choose_subscriptions(&mut self) -> BTreeSet<u32> {
        self.preferences_pending = false;
        let next = self.limiter.apply(&self.optimal);
        if next != self.subscribed {
            self.last_subscribe_at = Some(Instant::now());
        }
        self.subscribed = next;
        self.subscribed.clone()
    }

    fn set_subscription_limit(&mut self, limit: usize) {
        self.limiter.set_limit(limit);
    }

    fn truncation_warning_count(&self) -> usize {
        self.limiter.warnings()
    }

    fn choose_remote_video_sources(&mut self, preferences: VideoPreferences) {
        if self.preferences.as_ref() == Some(&preferences) {
            return;
        }
        info!("video preferences now cover {} attendees", preferences.len());
        self.preferences = Some(preferences);
        self.preferences_updated = true;
        if self.server_adapts_remote_video {
            self.preferences_pending = true;
        }
        self.recompute(Instant::now());
    }

    fn video_preferences(&self) -> Option<&VideoPreferences> {
        Some(self.current_preferences())
    }

    fn set_server_side_network_adaption(&mut self, adaption: ServerSideNetworkAdaption) {
        let adapts = adaption.adapts_remote_video();
        if adapts != self.server_adapts_remote_video {
            self.server_adapts_remote_video = adapts;
            self.recompute(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::{index_with, video};

    fn layer(stream_id: u32, group_id: u32, attendee: &str, kbps: u32) -> StreamDescriptor {
        StreamDescriptor {
            avg_bitrate_bps: kbps * 1000,
            ..video(stream_id, group_id, attendee, kbps)
        }
    }

    /// `attendees` senders named `attendee-<n>`, each with an optional low
    /// layer (odd ids) and high layer (even ids).
    fn ladder_index(attendees: u32, low_kbps: u32, high_kbps: u32) -> VideoStreamIndex {
        let mut sources = Vec::new();
        for i in 1..=attendees {
            let attendee = format!("attendee-{i}");
            if low_kbps > 0 {
                sources.push(layer(2 * i - 1, i, &attendee, low_kbps));
            }
            if high_kbps > 0 {
                sources.push(layer(2 * i, i, &attendee, high_kbps));
            }
        }
        index_with(sources)
    }

    fn preferences(items: &[(&str, u32)]) -> VideoPreferences {
        items
            .iter()
            .map(|(attendee, priority)| VideoPreference::new(*attendee, *priority))
            .collect()
    }

    async fn settle_estimate(policy: &mut VideoPriorityBasedPolicy, kbps: u32) {
        policy.update_available_bandwidth(kbps);
        tokio::time::advance(STARTUP_PERIOD + Duration::from_millis(100)).await;
        policy.update_available_bandwidth(kbps);
    }

    #[test]
    fn default_preferences_shrink_with_the_room() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.update_index(&ladder_index(1, 0, 1200));
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2]));

        policy.update_index(&ladder_index(2, 300, 1200));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 4]));

        policy.update_index(&ladder_index(6, 300, 1200));
        assert_eq!(
            policy.choose_subscriptions(),
            BTreeSet::from([1, 3, 5, 7, 9, 11])
        );
    }

    #[test]
    fn explicit_preferences_replace_the_defaults() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.update_index(&ladder_index(5, 0, 600));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 4, 6, 8]));

        policy.choose_remote_video_sources(preferences(&[("attendee-5", 1)]));
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([10]));

        policy.choose_remote_video_sources(preferences(&[("attendee-5", 1)]));
        assert!(!policy.wants_resubscribe());

        policy.choose_remote_video_sources(VideoPreferences::new());
        assert!(policy.wants_resubscribe());
        assert!(policy.choose_subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priorities_wait_for_the_top_priority() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.update_index(&ladder_index(2, 300, 1200));
        policy.choose_remote_video_sources(preferences(&[("attendee-2", 1), ("attendee-1", 2)]));

        settle_estimate(&mut policy, 1000).await;
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([3]));

        tokio::time::advance(MIN_TIME_BETWEEN_SUBSCRIBES * 2).await;
        policy.update_available_bandwidth(1500);
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([1, 4]));
    }

    #[tokio::test(start_paused = true)]
    async fn small_estimate_changes_keep_subscriptions() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.update_index(&ladder_index(4, 300, 1200));
        policy.choose_remote_video_sources(preferences(&[
            ("attendee-1", 1),
            ("attendee-2", 1),
            ("attendee-3", 1),
            ("attendee-4", 1),
        ]));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 3, 5, 7]));

        tokio::time::advance(STARTUP_PERIOD + Duration::from_millis(100)).await;
        policy.update_available_bandwidth(3000);
        assert!(!policy.wants_resubscribe());

        tokio::time::advance(MIN_TIME_BETWEEN_SUBSCRIBES + Duration::from_secs(1)).await;
        policy.update_available_bandwidth(6000);
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2, 4, 6, 8]));
    }

    #[test]
    fn target_rate_is_capped() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        assert_eq!(policy.target_rate_kbps(), DEFAULT_BANDWIDTH_KBPS);
        policy.update_available_bandwidth(20_000);
        assert_eq!(policy.target_rate_kbps(), MAX_TARGET_BANDWIDTH_KBPS);
    }

    #[test]
    fn content_is_upgraded_past_its_target_only_when_high() {
        let content = "attendee-1#content";
        let single = |size: TargetDisplaySize, low: u32, high: u32| {
            let mut policy = VideoPriorityBasedPolicy::new("me");
            policy.update_index(&index_with(vec![
                layer(1, 1, content, low),
                layer(2, 1, content, high),
            ]));
            policy.choose_remote_video_sources(
                [VideoPreference::new(content, 1).with_target_size(size)]
                    .into_iter()
                    .collect(),
            );
            policy.choose_subscriptions()
        };
        assert_eq!(single(TargetDisplaySize::High, 300, 2000), BTreeSet::from([2]));
        assert_eq!(single(TargetDisplaySize::Low, 5, 10), BTreeSet::from([1]));
        assert_eq!(single(TargetDisplaySize::Medium, 5, 10), BTreeSet::from([2]));
        assert_eq!(single(TargetDisplaySize::Medium, 300, 800), BTreeSet::from([1]));
    }

    #[test]
    fn degradation_preference_shapes_the_ladder() {
        let rung = |stream_id, width, height, framerate, kbps| StreamDescriptor {
            width,
            height,
            framerate,
            ..layer(stream_id, 1, "attendee-1", kbps)
        };
        let index = index_with(vec![
            rung(1, 320, 180, 15, 200),
            rung(2, 640, 360, 15, 400),
            rung(3, 320, 180, 30, 500),
        ]);
        let top_rung = |degradation| {
            let mut policy = VideoPriorityBasedPolicy::new("me");
            policy.update_index(&index);
            policy.choose_remote_video_sources(
                [VideoPreference::new("attendee-1", 1).with_degradation_preference(degradation)]
                    .into_iter()
                    .collect(),
            );
            policy.choose_subscriptions()
        };
        assert_eq!(
            top_rung(VideoQualityAdaptationPreference::MaintainResolution),
            BTreeSet::from([2])
        );
        assert_eq!(
            top_rung(VideoQualityAdaptationPreference::MaintainFramerate),
            BTreeSet::from([3])
        );
    }

    #[test]
    fn server_adaption_takes_the_top_layer_and_resends_preferences() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.set_server_side_network_adaption(
            ServerSideNetworkAdaption::BandwidthProbingAndRemoteVideoQualityAdaption,
        );
        policy.update_index(&ladder_index(2, 300, 1200));
        policy.choose_remote_video_sources(preferences(&[("attendee-1", 1)]));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2]));
        assert!(!policy.wants_resubscribe());

        policy.choose_remote_video_sources(
            [VideoPreference::new("attendee-1", 1).with_target_size(TargetDisplaySize::Low)]
                .into_iter()
                .collect(),
        );
        assert!(policy.wants_resubscribe());
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2]));
        assert_eq!(
            policy.video_preferences().and_then(|p| p.get("attendee-1")).map(|p| p.target_size),
            Some(TargetDisplaySize::Low)
        );
    }

    #[test]
    fn reset_forgets_preferences_but_keeps_the_limit() {
        let mut policy = VideoPriorityBasedPolicy::new("me");
        policy.set_subscription_limit(1);
        policy.update_index(&ladder_index(3, 0, 300));
        policy.choose_remote_video_sources(preferences(&[("attendee-1", 1), ("attendee-3", 1)]));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2]));
        assert_eq!(policy.truncation_warning_count(), 1);

        policy.reset();
        assert!(policy.choose_subscriptions().is_empty());
        policy.update_index(&ladder_index(3, 0, 300));
        assert_eq!(policy.choose_subscriptions(), BTreeSet::from([2]));
        assert_eq!(policy.truncation_warning_count(), 2);
    }
}
