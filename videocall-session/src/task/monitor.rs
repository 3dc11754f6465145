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

//! Watches connection health and signaling for reasons to reconnect.

use super::Task;
use crate::connection_health::{ConnectionHealthData, ReconnectionHealthPolicy};
use crate::errors::TaskError;
use crate::events::{AudioVideoEventAttributes, AudioVideoEventName};
use crate::observer::AudioVideoObserver;
use crate::session_state::SessionContext;
use crate::signaling_client::SignalingClientEvent;
use crate::status::{MeetingSessionStatus, MeetingSessionStatusCode};
use async_broadcast::RecvError;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use videocall_types::{FrameType, SignalFrame, SignalMessage};

const PING_PONG_INTERVAL: Duration = Duration::from_secs(10);

struct MonitorObserver {
    context: Weak<SessionContext>,
    health_policy: Mutex<ReconnectionHealthPolicy>,
}

impl AudioVideoObserver for MonitorObserver {
    fn connection_health_did_change(&self, data: &ConnectionHealthData) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        if data.consecutive_missed_pongs == 0 {
            context.reconnect_controller.lock().mark_active();
        }
        let health = {
            let mut policy = self.health_policy.lock();
            policy.update(data.clone());
            policy.health_if_changed()
        };
        if health != Some(ReconnectionHealthPolicy::MINIMUM_HEALTH) {
            return;
        }

        warn!("connection health is poor, reconnecting");
        context.state.lock().poor_connection_count += 1;
        context
            .observers
            .for_each(|o| o.connection_did_become_poor());
        if let Some(controller) = context.controller() {
            controller.handle_meeting_session_status(
                MeetingSessionStatus::new(MeetingSessionStatusCode::ConnectionHealthReconnect),
                None,
            );
        }
    }

    fn video_receive_bandwidth_did_change(&self, new_kbps: u32, _old_kbps: u32) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        context
            .downlink_policy
            .lock()
            .update_available_bandwidth(new_kbps);
        if !context.is_ingesting() {
            return;
        }
        if !context.downlink_policy.lock().wants_resubscribe() {
            return;
        }
        info!("downlink bandwidth changed to {new_kbps}kbps, resubscribing");
        if let Some(controller) = context.controller() {
            controller.update(true);
        }
    }
}

/// Sends a PING every interval and counts the ones left unanswered.
#[derive(Default)]
struct Pinger {
    next_ping_id: u32,
    awaiting: Option<u32>,
}

impl Pinger {
    async fn ping(&mut self, context: &SessionContext) {
        if !context.signaling.ready() {
            return;
        }
        if let Some(ping_id) = self.awaiting.take() {
            debug!("ping {ping_id} went unanswered");
            context.update_connection_health(|h| h.consecutive_missed_pongs += 1);
        }
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        match context.signaling.ping(self.next_ping_id).await {
            Ok(()) => self.awaiting = Some(self.next_ping_id),
            Err(e) => warn!("could not send ping: {e}"),
        }
    }

    fn pong_received(&mut self, context: &SessionContext, ping_id: u32) {
        if self.awaiting == Some(ping_id) {
            self.awaiting = None;
        }
        context.update_connection_health(|h| h.consecutive_missed_pongs = 0);
    }
}

/// Registers the health observer and a signaling listener that stay for
/// the rest of the session.
pub struct MonitorTask {
    context: Arc<SessionContext>,
}

impl MonitorTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

/// Replies to our own requests are judged by the task that sent them.
fn is_request_reply(frame: &SignalFrame) -> bool {
    matches!(
        frame.frame_type(),
        FrameType::JoinAck | FrameType::SubscribeAck | FrameType::LeaveAck
    )
}

fn handle_frame(context: &SessionContext, frame: &SignalFrame, last_bandwidth_kbps: &mut u32) {
    if let SignalMessage::Bitrates(bitrates) = &frame.message {
        let kbps = bitrates.server_available_outgoing_bitrate / 1000;
        if kbps > 0 && kbps != *last_bandwidth_kbps {
            let old = std::mem::replace(last_bandwidth_kbps, kbps);
            context
                .observers
                .for_each(|o| o.video_receive_bandwidth_did_change(kbps, old));
        }
    }
    if is_request_reply(frame) {
        return;
    }
    let status = MeetingSessionStatus::from_signal_frame(frame);
    if status.status_code() == MeetingSessionStatusCode::OK {
        return;
    }
    if let Some(controller) = context.controller() {
        controller.handle_meeting_session_status(status, None);
    }
}

#[async_trait]
impl Task for MonitorTask {
    fn name(&self) -> String {
        "MonitorTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let context = &self.context;
        let observer = Arc::new(MonitorObserver {
            context: Arc::downgrade(context),
            health_policy: Mutex::new(ReconnectionHealthPolicy::new(
                context.configuration.connection_health.clone(),
                ConnectionHealthData::new(),
            )),
        });
        let id = context.observers.add(observer);
        context.set_monitor_observer(id);

        let mut events = context.signaling.subscribe_events();
        let weak = Arc::downgrade(context);
        context.spawn_background(async move {
            let mut pings = tokio::time::interval_at(
                Instant::now() + PING_PONG_INTERVAL,
                PING_PONG_INTERVAL,
            );
            let mut pinger = Pinger::default();
            let mut last_bandwidth_kbps = 0;
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(RecvError::Overflowed(skipped)) => {
                                warn!("monitor skipped {skipped} signaling events");
                                continue;
                            }
                            Err(RecvError::Closed) => break,
                        };
                        let Some(context) = weak.upgrade() else {
                            break;
                        };
                        match event {
                            SignalingClientEvent::ReceivedSignalFrame(frame) => {
                                if let SignalMessage::Pong(pong) = &frame.message {
                                    pinger.pong_received(&context, pong.ping_id);
                                }
                                handle_frame(&context, &frame, &mut last_bandwidth_kbps)
                            }
                            event if event.is_unexpected_close() => {
                                warn!("signaling dropped: {event:?}");
                                context.publish_event(
                                    AudioVideoEventName::SignalingDropped,
                                    AudioVideoEventAttributes::default(),
                                );
                                if let Some(controller) = context.controller() {
                                    controller.handle_meeting_session_status(
                                        MeetingSessionStatus::new(
                                            MeetingSessionStatusCode::ConnectionHealthReconnect,
                                        ),
                                        None,
                                    );
                                }
                            }
                            _ => {}
                        }
                    }
                    _ = pings.tick() => {
                        let Some(context) = weak.upgrade() else {
                            break;
                        };
                        pinger.ping(&context).await;
                    }
                }
            }
        });
        Ok(())
    }
}
