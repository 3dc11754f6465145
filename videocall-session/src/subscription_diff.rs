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

//! Deciding how much work a subscription or encoding change needs.
//!
//! Full renegotiation costs an SDP round trip and interrupts media, so the
//! update path first classifies what changed and only renegotiates when a
//! source was structurally added or removed.

use crate::policy::{EncodingParameters, VideoPreferences};
use crate::video_stream_index::VideoStreamIndex;
use std::collections::{BTreeMap, BTreeSet};
use videocall_types::{RemoteVideoUpdateFrame, VideoSubscriptionConfiguration};

/// Difference between the streams we want and the streams we last
/// subscribed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoChanges {
    pub added: BTreeSet<u32>,
    pub removed: BTreeSet<u32>,
    /// Old stream id to the new stream id of the same group.
    pub switched: BTreeMap<u32, u32>,
}

impl VideoChanges {
    /// Switches alone are handled by remapping transceivers.
    pub fn requires_renegotiation(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.switched.is_empty()
    }
}

/// Classify `videos_to_receive` against `last_videos_to_receive`.
///
/// A new id that shares a group with an old id is a layer switch. An old
/// id can only be claimed by one switch.
pub fn detect_changes_in_videos_to_receive(
    index: &VideoStreamIndex,
    videos_to_receive: &BTreeSet<u32>,
    last_videos_to_receive: &BTreeSet<u32>,
) -> VideoChanges {
    let mut changes = VideoChanges::default();
    let mut claimed: BTreeSet<u32> = BTreeSet::new();

    for &new_id in videos_to_receive.difference(last_videos_to_receive) {
        let sibling = last_videos_to_receive
            .difference(videos_to_receive)
            .find(|&&old_id| {
                !claimed.contains(&old_id) && index.stream_ids_in_same_group(old_id, new_id)
            })
            .copied();
        match sibling {
            Some(old_id) => {
                claimed.insert(old_id);
                changes.switched.insert(old_id, new_id);
            }
            None => {
                changes.added.insert(new_id);
            }
        }
    }

    changes.removed = last_videos_to_receive
        .difference(videos_to_receive)
        .filter(|id| !claimed.contains(id))
        .copied()
        .collect();
    changes
}

/// How a requested update will be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Full offer/answer exchange and subscribe.
    Renegotiate,
    /// Remap transceivers and resend the subscribe without a new offer.
    SubscribeOnly(BTreeMap<u32, u32>),
    /// Remap transceivers and tell the server through a remote video update.
    RemoteVideoUpdate(BTreeMap<u32, u32>),
    /// Only the local encoding parameters changed.
    EncodingOnly,
    None,
}

/// What changed in the local encoding parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingChange {
    pub changed: bool,
    /// A simulcast layer turned on or off.
    pub layer_toggled: bool,
}

impl EncodingChange {
    /// Compare the parameters last applied to the camera with `next`.
    pub fn between(last: Option<&EncodingParameters>, next: &EncodingParameters) -> Self {
        let Some(last) = last else {
            return Self {
                changed: !next.is_empty(),
                layer_toggled: false,
            };
        };
        Self {
            changed: last != next,
            layer_toggled: next
                .iter()
                .any(|(rid, p)| last.get(rid).is_some_and(|l| l.active != p.active)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateInputs {
    pub has_peer_connection: bool,
    pub local_video_changed: bool,
    pub server_adapts_remote_video: bool,
    pub video_changes: VideoChanges,
    pub encoding: EncodingChange,
    /// The remote answer negotiated the layers allocation header extension.
    pub answer_has_layers_allocation: bool,
}

pub fn decide_update(inputs: &UpdateInputs) -> UpdateDecision {
    if !inputs.has_peer_connection || inputs.local_video_changed {
        return UpdateDecision::Renegotiate;
    }
    if inputs.video_changes.requires_renegotiation() {
        return UpdateDecision::Renegotiate;
    }
    if inputs.encoding.layer_toggled && !inputs.answer_has_layers_allocation {
        return UpdateDecision::Renegotiate;
    }
    let switched = &inputs.video_changes.switched;
    if !switched.is_empty() {
        return if inputs.server_adapts_remote_video {
            UpdateDecision::RemoteVideoUpdate(switched.clone())
        } else {
            UpdateDecision::SubscribeOnly(switched.clone())
        };
    }
    if inputs.encoding.changed {
        return UpdateDecision::EncodingOnly;
    }
    UpdateDecision::None
}

/// Per group subscription configuration for the streams we receive, keyed
/// by group id. Streams without a known mid or group are skipped.
/// Preferences, when given, set each source's priority and target bitrate.
/// The server treats larger priority values as more important.
pub fn video_subscription_configuration(
    index: &VideoStreamIndex,
    videos_to_receive: &BTreeSet<u32>,
    preferences: Option<&VideoPreferences>,
    mid_for_stream_id: impl Fn(u32) -> Option<String>,
) -> BTreeMap<u32, VideoSubscriptionConfiguration> {
    let mut configuration = BTreeMap::new();
    for &stream_id in videos_to_receive {
        let (Some(descriptor), Some(mid)) =
            (index.stream_descriptor(stream_id), mid_for_stream_id(stream_id))
        else {
            continue;
        };
        let preference = preferences.and_then(|p| p.get(&descriptor.attendee_id));
        configuration.insert(
            descriptor.group_id,
            VideoSubscriptionConfiguration {
                mid,
                attendee_id: descriptor.attendee_id.clone(),
                stream_id,
                group_id: descriptor.group_id,
                priority: preference.map_or(0, |p| u32::MAX - p.priority),
                target_bitrate_kbps: preference
                    .map_or(descriptor.max_bitrate_kbps, |p| p.target_bitrate_kbps()),
            },
        );
    }
    configuration
}

/// The differential frame that moves the server from `last` to `next`.
pub fn remote_video_update_frame(
    last: &BTreeMap<u32, VideoSubscriptionConfiguration>,
    next: &BTreeMap<u32, VideoSubscriptionConfiguration>,
) -> RemoteVideoUpdateFrame {
    let added_or_updated_video_subscriptions = next
        .iter()
        .filter(|(group_id, config)| last.get(group_id) != Some(config))
        .map(|(_, config)| config.clone())
        .collect();
    let removed_video_subscription_mids = last
        .iter()
        .filter(|(group_id, _)| !next.contains_key(group_id))
        .map(|(_, config)| config.mid.clone())
        .collect();
    RemoteVideoUpdateFrame {
        added_or_updated_video_subscriptions,
        removed_video_subscription_mids,
    }
}
