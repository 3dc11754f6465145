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

use std::collections::HashSet;

/// How large a remote video is rendered, which bounds the bitrate worth
/// receiving for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetDisplaySize {
    Low,
    Medium,
    #[default]
    High,
    Maximum,
}

impl TargetDisplaySize {
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            TargetDisplaySize::Low => 300,
            TargetDisplaySize::Medium => 600,
            TargetDisplaySize::High => 1200,
            TargetDisplaySize::Maximum => 2400,
        }
    }
}

/// What to give up first when climbing a simulcast or SVC ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VideoQualityAdaptationPreference {
    #[default]
    Balanced,
    MaintainResolution,
    MaintainFramerate,
}

/// Receive preference for one remote attendee. Lower `priority` values are
/// served first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoPreference {
    pub attendee_id: String,
    pub priority: u32,
    pub target_size: TargetDisplaySize,
    pub degradation_preference: VideoQualityAdaptationPreference,
}

impl VideoPreference {
    pub fn new(attendee_id: impl Into<String>, priority: u32) -> Self {
        Self {
            attendee_id: attendee_id.into(),
            priority,
            target_size: TargetDisplaySize::default(),
            degradation_preference: VideoQualityAdaptationPreference::default(),
        }
    }

    pub fn with_target_size(mut self, target_size: TargetDisplaySize) -> Self {
        self.target_size = target_size;
        self
    }

    pub fn with_degradation_preference(
        mut self,
        degradation_preference: VideoQualityAdaptationPreference,
    ) -> Self {
        self.degradation_preference = degradation_preference;
        self
    }

    pub fn target_bitrate_kbps(&self) -> u32 {
        self.target_size.bitrate_kbps()
    }
}

/// At most one preference per attendee, kept in priority order.
///
/// Equality ignores the order preferences were added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoPreferences {
    items: Vec<VideoPreference>,
}

impl VideoPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `preference`, replacing any earlier one for the same attendee.
    pub fn add(&mut self, preference: VideoPreference) {
        self.items
            .retain(|existing| existing.attendee_id != preference.attendee_id);
        self.items.push(preference);
        self.items.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.attendee_id.cmp(&b.attendee_id))
        });
    }

    pub fn remove(&mut self, attendee_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|p| p.attendee_id != attendee_id);
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, attendee_id: &str) -> Option<&VideoPreference> {
        self.items.iter().find(|p| p.attendee_id == attendee_id)
    }

    pub fn contains(&self, attendee_id: &str) -> bool {
        self.get(attendee_id).is_some()
    }

    pub fn highest_priority(&self) -> Option<u32> {
        self.items.first().map(|p| p.priority)
    }

    /// Distinct priority values, most important first.
    pub(crate) fn priority_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.items.iter().map(|p| p.priority).collect();
        levels.dedup();
        levels
    }

    pub fn attendee_ids(&self) -> HashSet<&str> {
        self.items.iter().map(|p| p.attendee_id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VideoPreference> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<VideoPreference> for VideoPreferences {
    fn from_iter<I: IntoIterator<Item = VideoPreference>>(iter: I) -> Self {
        let mut preferences = Self::new();
        for preference in iter {
            preferences.add(preference);
        }
        preferences
    }
}

impl<'a> IntoIterator for &'a VideoPreferences {
    type Item = &'a VideoPreference;
    type IntoIter = std::slice::Iter<'a, VideoPreference>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_in_priority_order() {
        let preferences: VideoPreferences = [
            VideoPreference::new("carol", 3),
            VideoPreference::new("alice", 1),
            VideoPreference::new("bob", 1),
        ]
        .into_iter()
        .collect();
        let order: Vec<&str> = preferences.iter().map(|p| p.attendee_id.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob", "carol"]);
        assert_eq!(preferences.highest_priority(), Some(1));
        assert_eq!(preferences.priority_levels(), vec![1, 3]);
    }

    #[test]
    fn adding_an_attendee_again_replaces_it() {
        let mut preferences = VideoPreferences::new();
        preferences.add(VideoPreference::new("alice", 1));
        preferences.add(VideoPreference::new("alice", 4).with_target_size(TargetDisplaySize::Low));
        assert_eq!(preferences.len(), 1);
        let alice = preferences.get("alice").unwrap();
        assert_eq!(alice.priority, 4);
        assert_eq!(alice.target_bitrate_kbps(), 300);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a: VideoPreferences = [VideoPreference::new("x", 2), VideoPreference::new("y", 2)]
            .into_iter()
            .collect();
        let b: VideoPreferences = [VideoPreference::new("y", 2), VideoPreference::new("x", 2)]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        let mut c = b.clone();
        assert!(c.remove("x"));
        assert!(!c.remove("x"));
        assert_ne!(a, c);
    }
}
