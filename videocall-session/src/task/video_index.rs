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
use crate::observer::MeetingSessionVideoAvailability;
use crate::session_state::SessionContext;
use crate::signaling_client::SignalingClientEvent;
use async_broadcast::RecvError;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use videocall_types::{IndexFrame, SignalMessage};

/// Ingests stream index frames for the life of the session.
///
/// The first index, received while joining, is applied immediately and
/// sets the initial `videos_to_receive`. Later frames wait until the
/// session finished connecting and are applied under the update lock; a
/// resulting resubscribe is requested as an update.
pub struct ReceiveVideoStreamIndexTask {
    context: Arc<SessionContext>,
}

impl ReceiveVideoStreamIndexTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Task for ReceiveVideoStreamIndexTask {
    fn name(&self) -> String {
        "ReceiveVideoStreamIndexTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let mut events = context.signaling.subscribe_events();

        let first = context.state.lock().index_frame.clone();
        match first {
            Some(frame) => {
                ingest_index(context, frame, true);
            }
            None => warn!("joined without an index"),
        }

        let weak = Arc::downgrade(context);
        context.spawn_background(async move {
            loop {
                let frame = match events.recv().await {
                    Ok(SignalingClientEvent::ReceivedSignalFrame(frame)) => frame,
                    Ok(_) => continue,
                    Err(RecvError::Overflowed(skipped)) => {
                        warn!("index listener skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let SignalMessage::Index(index) = frame.message else {
                    continue;
                };
                let Some(context) = weak.upgrade() else {
                    break;
                };

                context.wait_for_ingestion().await;
                let resubscribe = {
                    let _update = context.update_lock.lock().await;
                    ingest_index(&context, index, false)
                };
                if resubscribe {
                    if let Some(controller) = context.controller() {
                        controller.update(true);
                    }
                }
            }
        });
        Ok(())
    }
}

/// Applies an index frame to the stream index and both policies. Returns
/// whether a resubscribe is needed.
pub(crate) fn ingest_index(context: &SessionContext, frame: IndexFrame, initial: bool) -> bool {
    let self_attendee_id = context.self_attendee_id();
    let at_capacity = frame.at_capacity;

    let (resubscribe, availability, sources) = {
        let mut state = context.state.lock();
        state.video_stream_index.integrate_index_frame(frame);

        let mut uplink = context.uplink_policy.lock();
        let mut downlink = context.downlink_policy.lock();
        uplink.update_index(&state.video_stream_index);
        downlink.update_index(&state.video_stream_index);

        let sending = state.video_input.is_some();
        let for_downlink = initial || downlink.wants_resubscribe();
        let for_uplink = sending && uplink.wants_resubscribe();
        if for_downlink {
            state.videos_to_receive = downlink.choose_subscriptions();
            debug!("videos to receive {:?}", state.videos_to_receive);
        }
        if for_uplink {
            state.video_capture_and_encode_parameters =
                uplink.choose_capture_and_encode_parameters();
        }

        let availability = MeetingSessionVideoAvailability {
            remote_video_available: !state
                .video_stream_index
                .all_video_sending_attendees_excluding_self(self_attendee_id)
                .is_empty(),
            can_start_local_video: !at_capacity,
        };
        let availability = (state.last_known_video_availability != Some(availability)).then(|| {
            state.last_known_video_availability = Some(availability);
            availability
        });

        let sources = state
            .video_stream_index
            .video_sources_excluding_self(self_attendee_id);
        let sources = (sources != state.last_remote_video_sources).then(|| {
            state.last_remote_video_sources = sources.clone();
            sources
        });

        (!initial && (for_downlink || for_uplink), availability, sources)
    };

    if let Some(availability) = availability {
        context
            .observers
            .for_each(|o| o.video_availability_did_change(availability));
    }
    if let Some(sources) = sources {
        context
            .observers
            .for_each(|o| o.remote_video_sources_did_change(&sources));
    }
    resubscribe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{harness, ScriptedTransport};
    use crate::observer::{AudioVideoObserver, VideoSource};
    use crate::policy::test_support::video;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        availability: Mutex<Vec<MeetingSessionVideoAvailability>>,
        sources: Mutex<Vec<Vec<VideoSource>>>,
    }

    impl AudioVideoObserver for Recorder {
        fn video_availability_did_change(&self, availability: MeetingSessionVideoAvailability) {
            self.availability.lock().push(availability);
        }

        fn remote_video_sources_did_change(&self, sources: &[VideoSource]) {
            self.sources.lock().push(sources.to_vec());
        }
    }

    fn index(sources: Vec<videocall_types::StreamDescriptor>) -> IndexFrame {
        IndexFrame {
            sources,
            ..Default::default()
        }
    }

    #[test]
    fn availability_is_published_on_change_only() {
        let context = harness(Arc::new(ScriptedTransport::default()));
        let recorder = Arc::new(Recorder::default());
        context.observers.add(recorder.clone());

        assert!(!ingest_index(&context, index(vec![]), true));
        let frame = index(vec![video(2, 1, "remote", 600)]);
        assert!(ingest_index(&context, frame.clone(), false));
        assert!(!ingest_index(&context, frame, false));

        let availability = recorder.availability.lock();
        assert_eq!(availability.len(), 2);
        assert!(!availability[0].remote_video_available);
        assert!(availability[1].remote_video_available);
        assert_eq!(recorder.sources.lock().len(), 1);
        assert_eq!(
            context.state.lock().videos_to_receive,
            std::collections::BTreeSet::from([2])
        );
    }
}
