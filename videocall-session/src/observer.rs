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

//! Lifecycle observers.
//!
//! Every callback has an empty default body, so an observer implements only
//! what it cares about.

use crate::connection_health::ConnectionHealthData;
use crate::events::{AudioVideoEventAttributes, AudioVideoEventName};
use crate::status::MeetingSessionStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeetingSessionVideoAvailability {
    pub remote_video_available: bool,
    pub can_start_local_video: bool,
}

/// An attendee currently sending video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoSource {
    pub attendee_id: String,
    pub external_user_id: String,
}

/// Which simulcast layers the local sender currently publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulcastLayers {
    Low,
    LowAndMedium,
    LowAndHigh,
    Medium,
    MediumAndHigh,
    High,
}

#[allow(unused_variables)]
pub trait AudioVideoObserver: Send + Sync {
    fn audio_video_did_start_connecting(&self, reconnecting: bool) {}
    fn audio_video_did_start(&self) {}
    fn audio_video_did_stop(&self, status: MeetingSessionStatus) {}
    fn video_availability_did_change(&self, availability: MeetingSessionVideoAvailability) {}
    fn remote_video_sources_did_change(&self, sources: &[VideoSource]) {}
    fn video_send_did_become_unavailable(&self) {}
    fn connection_did_become_poor(&self) {}
    fn connection_health_did_change(&self, data: &ConnectionHealthData) {}
    fn video_receive_bandwidth_did_change(&self, new_kbps: u32, old_kbps: u32) {}
    fn encoding_simulcast_layers_did_change(&self, layers: SimulcastLayers) {}
    fn event_did_receive(&self, name: AudioVideoEventName, attributes: &AudioVideoEventAttributes) {}
}

pub type ObserverId = u64;

/// Registered observers, notified in registration order.
#[derive(Default)]
pub struct ObserverSet {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn AudioVideoObserver>)>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn AudioVideoObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for each observer. The list is snapshotted first so
    /// observers may add or remove observers from inside a callback.
    pub fn for_each(&self, f: impl Fn(&dyn AudioVideoObserver)) {
        let snapshot: Vec<Arc<dyn AudioVideoObserver>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in snapshot {
            f(observer.as_ref());
        }
    }
}
