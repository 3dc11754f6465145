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

use super::Task;
use crate::errors::TaskError;
use crate::events::{AudioVideoEventAttributes, AudioVideoEventName};
use crate::session_state::SessionContext;
use crate::status::MeetingSessionStatusCode;
use async_broadcast::RecvError;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Waits until the server reports our own attendee as present. Runs only
/// after the subscribe was acknowledged, so a missing attendee is never
/// mistaken for a failed subscribe.
pub struct WaitForAttendeePresenceTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl WaitForAttendeePresenceTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }

    fn no_attendee_present(&self) -> TaskError {
        TaskError::with_status(
            self.name(),
            MeetingSessionStatusCode::NoAttendeePresent,
            "the attendee was not reported present in time",
        )
    }
}

#[async_trait]
impl Task for WaitForAttendeePresenceTask {
    fn name(&self) -> String {
        "WaitForAttendeePresenceTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let attendee_id = context.self_attendee_id();
        let mut presence = context.realtime.subscribe_attendee_presence();
        let started = Instant::now();

        if !context.realtime.is_attendee_present(attendee_id) {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(self.no_attendee_present()),
                    event = presence.recv() => match event {
                        Ok(p) if p.attendee_id == attendee_id && p.present => break,
                        Ok(_) | Err(RecvError::Overflowed(_)) => {}
                        Err(RecvError::Closed) => return Err(self.no_attendee_present()),
                    }
                }
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        info!("attendee present after {elapsed}ms");
        context.state.lock().attendee_presence_duration_ms = Some(elapsed);
        context.publish_event(
            AudioVideoEventName::AttendeePresenceReceived,
            AudioVideoEventAttributes {
                attendee_presence_duration_ms: Some(elapsed),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
