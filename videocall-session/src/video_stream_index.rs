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

//! Index of the streams published in the meeting.
//!
//! Built from INDEX frames (what is published) and SUBSCRIBE_ACK frames
//! (which receive track carries which stream).

use crate::observer::VideoSource;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use videocall_types::{IndexFrame, MediaType, StreamDescriptor, SubscribeAckFrame};

#[derive(Debug, Clone, Default)]
pub struct VideoStreamIndex {
    current_index: Option<IndexFrame>,
    current_subscribe_ack: Option<SubscribeAckFrame>,
    track_to_stream: HashMap<String, u32>,
    // Accumulates across index frames so a layer that disappears can still
    // be matched with its replacement.
    stream_to_group: HashMap<u32, u32>,
}

impl VideoStreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn integrate_index_frame(&mut self, frame: IndexFrame) {
        for source in &frame.sources {
            if let Some(previous) = self.stream_to_group.insert(source.stream_id, source.group_id)
            {
                if previous != source.group_id {
                    warn!(
                        "stream {} moved from group {previous} to {}",
                        source.stream_id, source.group_id
                    );
                }
            }
        }
        self.current_index = Some(frame);
    }

    pub fn integrate_subscribe_ack_frame(&mut self, frame: SubscribeAckFrame) {
        self.track_to_stream = frame
            .tracks
            .iter()
            .filter(|t| !t.track_label.is_empty() && t.stream_id > 0)
            .map(|t| (t.track_label.clone(), t.stream_id))
            .collect();
        debug!("track map {:?}", self.track_to_stream);
        self.current_subscribe_ack = Some(frame);
    }

    pub fn has_index(&self) -> bool {
        self.current_index.is_some()
    }

    /// Forget everything, including the accumulated group map.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn sources(&self) -> &[StreamDescriptor] {
        self.current_index
            .as_ref()
            .map(|index| index.sources.as_slice())
            .unwrap_or_default()
    }

    fn remote_video_sources<'a: 'b, 'b>(
        &'a self,
        self_attendee_id: &'b str,
    ) -> impl Iterator<Item = &'a StreamDescriptor> + 'b {
        self.sources()
            .iter()
            .filter(move |s| s.attendee_id != self_attendee_id && s.media_type == MediaType::Video)
    }

    /// Every remote video stream, simulcast layers included.
    pub fn remote_video_streams(&self, self_attendee_id: &str) -> Vec<StreamDescriptor> {
        self.remote_video_sources(self_attendee_id).cloned().collect()
    }

    pub fn all_streams(&self) -> BTreeSet<u32> {
        self.sources().iter().map(|s| s.stream_id).collect()
    }

    pub fn all_video_sending_attendees_excluding_self(
        &self,
        self_attendee_id: &str,
    ) -> BTreeSet<String> {
        self.remote_video_sources(self_attendee_id)
            .map(|s| s.attendee_id.clone())
            .collect()
    }

    /// Remote attendees sending video, with their external user ids.
    pub fn video_sources_excluding_self(&self, self_attendee_id: &str) -> Vec<VideoSource> {
        let sources: BTreeSet<VideoSource> = self
            .remote_video_sources(self_attendee_id)
            .map(|s| VideoSource {
                attendee_id: s.attendee_id.clone(),
                external_user_id: s.external_user_id.clone(),
            })
            .collect();
        sources.into_iter().collect()
    }

    /// Chooses one stream per remote attendee within `bandwidth_kbps`.
    ///
    /// Everyone starts on their lowest stream. Large-tile attendees are then
    /// upgraded first, followed by attendees not shown in any tile.
    pub fn stream_selection_under_bandwidth_constraint(
        &self,
        self_attendee_id: &str,
        large_tile_attendee_ids: &BTreeSet<String>,
        small_tile_attendee_ids: &BTreeSet<String>,
        bandwidth_kbps: u32,
    ) -> BTreeSet<u32> {
        let mut new_attendees: Vec<String> = Vec::new();
        for stream in self.remote_video_sources(self_attendee_id) {
            if !large_tile_attendee_ids.contains(&stream.attendee_id)
                && !small_tile_attendee_ids.contains(&stream.attendee_id)
                && !new_attendees.contains(&stream.attendee_id)
            {
                new_attendees.push(stream.attendee_id.clone());
            }
        }

        let attendee_streams = self.attendee_to_sorted_streams_excluding_self(self_attendee_id);
        let mut selection: HashMap<&str, &StreamDescriptor> = HashMap::new();
        let mut usage: u32 = 0;
        for (attendee_id, streams) in &attendee_streams {
            if let Some(&lowest) = streams.first() {
                selection.insert(attendee_id.as_str(), lowest);
                usage += lowest.max_bitrate_kbps;
            }
        }

        usage = try_select_high_bitrate(
            &attendee_streams,
            large_tile_attendee_ids.iter(),
            usage,
            bandwidth_kbps,
            &mut selection,
        );
        try_select_high_bitrate(
            &attendee_streams,
            new_attendees.iter(),
            usage,
            bandwidth_kbps,
            &mut selection,
        );

        selection.values().map(|s| s.stream_id).collect()
    }

    pub fn highest_quality_stream_from_each_group_excluding_self(
        &self,
        self_attendee_id: &str,
    ) -> BTreeSet<u32> {
        let mut maxes: BTreeMap<u32, &StreamDescriptor> = BTreeMap::new();
        for source in self.remote_video_sources(self_attendee_id) {
            let replace = maxes
                .get(&source.group_id)
                .map(|current| source.max_bitrate_kbps > current.max_bitrate_kbps)
                .unwrap_or(true);
            if replace {
                maxes.insert(source.group_id, source);
            }
        }
        maxes.values().map(|s| s.stream_id).collect()
    }

    pub fn number_of_video_publishing_participants_excluding_self(
        &self,
        self_attendee_id: &str,
    ) -> usize {
        self.highest_quality_stream_from_each_group_excluding_self(self_attendee_id)
            .len()
    }

    /// Total attendees, when the server reports it.
    pub fn number_of_participants(&self) -> Option<u32> {
        self.current_index.as_ref().and_then(|i| i.num_participants)
    }

    pub fn stream_descriptor(&self, stream_id: u32) -> Option<&StreamDescriptor> {
        self.sources().iter().find(|s| s.stream_id == stream_id)
    }

    pub fn attendee_id_for_stream_id(&self, stream_id: u32) -> Option<String> {
        self.stream_descriptor(stream_id)
            .map(|s| s.attendee_id.clone())
    }

    pub fn stream_id_for_track(&self, track_label: &str) -> Option<u32> {
        self.track_to_stream.get(track_label).copied()
    }

    pub fn attendee_id_for_track(&self, track_label: &str) -> Option<String> {
        let Some(stream_id) = self.stream_id_for_track(track_label) else {
            warn!("track {track_label} does not correspond to a known stream");
            return None;
        };
        self.attendee_id_for_stream_id(stream_id)
    }

    pub fn streams_paused_at_source(&self) -> BTreeSet<u32> {
        self.current_index
            .as_ref()
            .map(|i| i.paused_at_source_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn group_id_for_stream_id(&self, stream_id: u32) -> Option<u32> {
        self.stream_to_group.get(&stream_id).copied()
    }

    /// Whether two streams are layers of the same source.
    pub fn stream_ids_in_same_group(&self, a: u32, b: u32) -> bool {
        match (self.group_id_for_stream_id(a), self.group_id_for_stream_id(b)) {
            (Some(group_a), Some(group_b)) => group_a == group_b,
            _ => false,
        }
    }

    /// Attendees in first-seen order, each with streams sorted by ascending
    /// max bitrate.
    fn attendee_to_sorted_streams_excluding_self<'a>(
        &'a self,
        self_attendee_id: &str,
    ) -> Vec<(String, Vec<&'a StreamDescriptor>)> {
        let mut attendees: Vec<(String, Vec<&'a StreamDescriptor>)> = Vec::new();
        for source in self.remote_video_sources(self_attendee_id) {
            match attendees.iter_mut().find(|(id, _)| *id == source.attendee_id) {
                Some((_, streams)) => streams.push(source),
                None => attendees.push((source.attendee_id.clone(), vec![source])),
            }
        }
        for (_, streams) in attendees.iter_mut() {
            streams.sort_by_key(|s| s.max_bitrate_kbps);
        }
        attendees
    }
}

fn try_select_high_bitrate<'a, 'b>(
    attendee_streams: &'a [(String, Vec<&'a StreamDescriptor>)],
    high_attendees: impl Iterator<Item = &'b String>,
    mut usage: u32,
    bandwidth_kbps: u32,
    selection: &mut HashMap<&'a str, &'a StreamDescriptor>,
) -> u32 {
    for attendee_id in high_attendees {
        if usage >= bandwidth_kbps {
            break;
        }
        let Some((id, streams)) = attendee_streams.iter().find(|(id, _)| id == attendee_id) else {
            continue;
        };
        let Some(current) = selection.get(id.as_str()).map(|s| s.max_bitrate_kbps) else {
            continue;
        };
        for &candidate in streams.iter().rev() {
            let projected = usage - current + candidate.max_bitrate_kbps;
            if projected < bandwidth_kbps {
                usage = projected;
                selection.insert(id.as_str(), candidate);
                break;
            }
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use videocall_types::TrackMapping;

    fn video(stream_id: u32, group_id: u32, attendee: &str, kbps: u32) -> StreamDescriptor {
        StreamDescriptor {
            stream_id,
            group_id,
            attendee_id: attendee.into(),
            media_type: MediaType::Video,
            max_bitrate_kbps: kbps,
            ..Default::default()
        }
    }

    fn index_with(sources: Vec<StreamDescriptor>) -> VideoStreamIndex {
        let mut index = VideoStreamIndex::new();
        index.integrate_index_frame(IndexFrame {
            sources,
            ..Default::default()
        });
        index
    }

    #[test]
    fn highest_per_group_excludes_self_and_audio() {
        let mut audio = video(9, 9, "bob", 64);
        audio.media_type = MediaType::Audio;
        let index = index_with(vec![
            video(1, 1, "alice", 300),
            video(2, 1, "alice", 1200),
            video(3, 2, "bob", 600),
            video(4, 3, "me", 1200),
            audio,
        ]);
        assert_eq!(
            index.highest_quality_stream_from_each_group_excluding_self("me"),
            BTreeSet::from([2, 3])
        );
        assert_eq!(
            index.number_of_video_publishing_participants_excluding_self("me"),
            2
        );
        assert_eq!(
            index.all_video_sending_attendees_excluding_self("me"),
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(index.all_streams().len(), 5);
    }

    #[test]
    fn sorted_streams_outlive_the_attendee_id() {
        let index = index_with(vec![
            video(2, 1, "alice", 1200),
            video(1, 1, "alice", 300),
            video(3, 2, "me", 600),
        ]);
        let grouped = {
            let me = String::from("me");
            index.attendee_to_sorted_streams_excluding_self(&me)
        };
        assert_eq!(grouped.len(), 1);
        let (attendee, streams) = &grouped[0];
        assert_eq!(attendee, "alice");
        let ids: Vec<u32> = streams.iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn bandwidth_constrained_selection_upgrades_large_tiles_first() {
        let index = index_with(vec![
            video(1, 1, "alice", 300),
            video(2, 1, "alice", 1200),
            video(3, 2, "bob", 300),
            video(4, 2, "bob", 1200),
        ]);
        let large = BTreeSet::from(["bob".to_string()]);
        let selection =
            index.stream_selection_under_bandwidth_constraint("me", &large, &BTreeSet::new(), 1600);
        assert_eq!(selection, BTreeSet::from([1, 4]));

        // Strictly less than the budget: 300 + 1200 == 1500 does not fit.
        let selection =
            index.stream_selection_under_bandwidth_constraint("me", &large, &BTreeSet::new(), 1500);
        assert_eq!(selection, BTreeSet::from([1, 3]));
    }

    #[test]
    fn group_membership_survives_index_updates() {
        let mut index = index_with(vec![video(1, 7, "alice", 300), video(5, 8, "bob", 300)]);
        index.integrate_index_frame(IndexFrame {
            sources: vec![video(2, 7, "alice", 1200)],
            ..Default::default()
        });
        assert!(index.stream_ids_in_same_group(1, 2));
        assert!(!index.stream_ids_in_same_group(2, 5));
        assert!(!index.stream_ids_in_same_group(2, 99));
        index.clear();
        assert_eq!(index.group_id_for_stream_id(1), None);
    }

    #[test]
    fn subscribe_ack_maps_tracks() {
        let mut index = index_with(vec![video(3, 2, "bob", 600)]);
        index.integrate_subscribe_ack_frame(SubscribeAckFrame {
            sdp_answer: String::new(),
            tracks: vec![
                TrackMapping {
                    stream_id: 3,
                    ssrc: 1,
                    track_label: "v_1".into(),
                },
                TrackMapping {
                    stream_id: 0,
                    ssrc: 2,
                    track_label: "v_2".into(),
                },
            ],
        });
        assert_eq!(index.stream_id_for_track("v_1"), Some(3));
        assert_eq!(index.stream_id_for_track("v_2"), None);
        assert_eq!(index.attendee_id_for_track("v_1").as_deref(), Some("bob"));
    }
}
