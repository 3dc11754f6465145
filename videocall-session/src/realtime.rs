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

//! Realtime attendee state derived from audio metadata frames: presence,
//! volume indicators and data messages.

use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use videocall_types::{AudioMetadataFrame, AudioStreamIdInfoFrame, DataMessage};

const REALTIME_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendeePresence {
    pub attendee_id: String,
    pub external_user_id: String,
    pub present: bool,
    /// The attendee left because the connection dropped.
    pub dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeIndicator {
    pub attendee_id: String,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub signal_strength: Option<u8>,
}

#[derive(Debug, Default)]
struct Attendees {
    by_stream: HashMap<u32, (String, String)>,
    present: HashMap<String, bool>,
    volumes: HashMap<String, VolumeIndicator>,
}

fn channel<T: Clone>() -> (Sender<T>, InactiveReceiver<T>) {
    let (mut sender, receiver) = broadcast(REALTIME_EVENT_CAPACITY);
    sender.set_overflow(true);
    (sender, receiver.deactivate())
}

pub struct RealtimeController {
    attendees: Mutex<Attendees>,
    local_audio_muted: AtomicBool,
    presence: Sender<AttendeePresence>,
    _presence_inactive: InactiveReceiver<AttendeePresence>,
    volumes: Sender<VolumeIndicator>,
    _volumes_inactive: InactiveReceiver<VolumeIndicator>,
    data_messages: Sender<DataMessage>,
    _data_messages_inactive: InactiveReceiver<DataMessage>,
}

impl Default for RealtimeController {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeController {
    pub fn new() -> Self {
        let (presence, _presence_inactive) = channel();
        let (volumes, _volumes_inactive) = channel();
        let (data_messages, _data_messages_inactive) = channel();
        Self {
            attendees: Mutex::new(Attendees::default()),
            local_audio_muted: AtomicBool::new(false),
            presence,
            _presence_inactive,
            volumes,
            _volumes_inactive,
            data_messages,
            _data_messages_inactive,
        }
    }

    pub fn subscribe_attendee_presence(&self) -> Receiver<AttendeePresence> {
        self.presence.new_receiver()
    }

    pub fn subscribe_volume_indicators(&self) -> Receiver<VolumeIndicator> {
        self.volumes.new_receiver()
    }

    pub fn subscribe_data_messages(&self) -> Receiver<DataMessage> {
        self.data_messages.new_receiver()
    }

    pub fn is_attendee_present(&self, attendee_id: &str) -> bool {
        self.attendees
            .lock()
            .present
            .get(attendee_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn volume_indicator(&self, attendee_id: &str) -> Option<VolumeIndicator> {
        self.attendees.lock().volumes.get(attendee_id).cloned()
    }

    pub fn is_local_audio_muted(&self) -> bool {
        self.local_audio_muted.load(Ordering::SeqCst)
    }

    pub fn set_local_audio_muted(&self, muted: bool) {
        self.local_audio_muted.store(muted, Ordering::SeqCst);
    }

    /// Maps audio stream ids to attendees and reports presence changes.
    pub fn handle_audio_stream_id_info(&self, frame: &AudioStreamIdInfoFrame) {
        let mut changes = Vec::new();
        {
            let mut attendees = self.attendees.lock();
            for stream in &frame.streams {
                let known = attendees.by_stream.get(&stream.audio_stream_id).cloned();
                let (attendee_id, external_user_id) = match (&stream.attendee_id, known) {
                    (Some(attendee_id), _) => (
                        attendee_id.clone(),
                        stream.external_user_id.clone().unwrap_or_default(),
                    ),
                    (None, Some(known)) => known,
                    (None, None) => continue,
                };
                attendees.by_stream.insert(
                    stream.audio_stream_id,
                    (attendee_id.clone(), external_user_id.clone()),
                );

                // An entry without an attendee id marks the stream as gone.
                let present = stream.attendee_id.is_some() && !stream.dropped;
                let previous = attendees.present.insert(attendee_id.clone(), present);
                if previous != Some(present) {
                    changes.push(AttendeePresence {
                        attendee_id,
                        external_user_id,
                        present,
                        dropped: stream.dropped,
                    });
                }
            }
        }
        for change in changes {
            info!(
                "attendee {} is {}",
                change.attendee_id,
                if change.present { "present" } else { "absent" }
            );
            let _ = self.presence.try_broadcast(change);
        }
    }

    pub fn handle_audio_metadata(&self, frame: &AudioMetadataFrame) {
        let mut updates = Vec::new();
        {
            let mut attendees = self.attendees.lock();
            for state in &frame.attendee_states {
                let Some((attendee_id, _)) = attendees.by_stream.get(&state.audio_stream_id).cloned()
                else {
                    debug!("metadata for unknown audio stream {}", state.audio_stream_id);
                    continue;
                };
                let indicator = VolumeIndicator {
                    attendee_id: attendee_id.clone(),
                    volume: state.volume,
                    muted: state.muted,
                    signal_strength: state.signal_strength,
                };
                if attendees.volumes.get(&attendee_id) != Some(&indicator) {
                    attendees.volumes.insert(attendee_id, indicator.clone());
                    updates.push(indicator);
                }
            }
        }
        for update in updates {
            let _ = self.volumes.try_broadcast(update);
        }
    }

    pub fn handle_data_messages(&self, messages: &[DataMessage]) {
        for message in messages {
            debug!("data message on topic {}", message.topic);
            let _ = self.data_messages.try_broadcast(message.clone());
        }
    }

    /// Forget every attendee. Subscribers stay registered.
    pub fn clear(&self) {
        *self.attendees.lock() = Attendees::default();
    }
}
