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

//! Publishes session lifecycle events.
//!
//! Events go to three places: the meeting history kept here, every
//! observer's `event_did_receive`, and a broadcast bus any component can
//! subscribe to.
//!
//! # Example
//!
//! ```ignore
//! let mut rx = controller.subscribe_session_events();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         if event.name == AudioVideoEventName::MeetingReconnected {
//!             println!("reconnected after {:?} retries", event.attributes.retry_count);
//!         }
//!     }
//! });
//! ```

use crate::events::{AudioVideoEventAttributes, AudioVideoEventName, SessionEvent};
use crate::observer::ObserverSet;
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use web_time::{SystemTime, UNIX_EPOCH};

/// Capacity of the event bus channel
const EVENT_BUS_CAPACITY: usize = 256;

const MAX_HISTORY_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingHistoryEntry {
    pub name: AudioVideoEventName,
    pub timestamp_ms: u64,
}

pub struct EventController {
    observers: Arc<ObserverSet>,
    sender: Sender<SessionEvent>,
    // Keeps the channel open while nobody is subscribed.
    _inactive: InactiveReceiver<SessionEvent>,
    history: Mutex<Vec<MeetingHistoryEntry>>,
}

impl EventController {
    pub fn new(observers: Arc<ObserverSet>) -> Self {
        let (mut sender, receiver) = broadcast(EVENT_BUS_CAPACITY);
        // Slow subscribers lose the oldest events instead of blocking publishers.
        sender.set_overflow(true);
        Self {
            observers,
            sender,
            _inactive: receiver.deactivate(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn publish_event(&self, name: AudioVideoEventName, attributes: AudioVideoEventAttributes) {
        let timestamp_ms = now_ms();
        info!("publishing {name} event");
        debug!("{name} attributes: {attributes:?}");

        {
            let mut history = self.history.lock();
            history.push(MeetingHistoryEntry { name, timestamp_ms });
            if history.len() > MAX_HISTORY_ENTRIES {
                history.remove(0);
            }
        }

        self.observers
            .for_each(|observer| observer.event_did_receive(name, &attributes));

        let _ = self.sender.try_broadcast(SessionEvent {
            name,
            attributes,
            timestamp_ms,
        });
    }

    /// Subscribe to session events.
    ///
    /// Returns a receiver that will receive all future events. Each
    /// subscriber receives every event independently.
    pub fn subscribe_session_events(&self) -> Receiver<SessionEvent> {
        self.sender.new_receiver()
    }

    pub fn meeting_history(&self) -> Vec<MeetingHistoryEntry> {
        self.history.lock().clone()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
