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

//! Connection orchestration for a videocall.rs meeting session.
//!
//! This crate owns the lifecycle of one attendee's audio/video session: it
//! opens signaling, joins, negotiates the peer connection, subscribes to
//! remote video, keeps the subscriptions in line with the bandwidth
//! policies and reconnects with backoff when the connection degrades. It
//! makes no assumptions about the media stack; the peer connection, the
//! capture devices and the signaling transport are injected as traits.
//!
//! # Outline of usage
//!
//! ```ignore
//! let configuration = MeetingSessionConfiguration::from_file("session.yaml")?;
//! let controller = AudioVideoController::with_transport(
//!     configuration,
//!     transport,          // Arc<dyn SignalingTransport>
//!     media_stream_broker, // Arc<dyn MediaStreamBroker>
//!     peer_connection_factory,
//! )?;
//! controller.add_observer(my_observer);
//!
//! controller.start()?;
//! controller.start_local_video();
//! controller.stop();
//! ```
//!
//! Everything the session reports also goes out on
//! [`AudioVideoController::subscribe_session_events`].

pub mod audio_video_controller;
pub mod config;
pub mod connection_health;
pub mod errors;
pub mod event_controller;
pub mod events;
pub mod media;
pub mod observer;
pub mod peer;
pub mod policy;
pub mod realtime;
pub mod reconnect_controller;
pub mod sdp;
pub mod session_state;
pub mod session_state_controller;
pub mod signaling_client;
pub mod status;
pub mod subscription_diff;
pub mod task;
pub mod transceiver_controller;
pub mod turn_credentials;
pub mod video_stream_index;

#[cfg(test)]
mod fakes;

pub use audio_video_controller::{AudioVideoController, StartOptions, UpdateOptions};
pub use config::MeetingSessionConfiguration;
pub use errors::{SessionError, TaskError};
pub use events::{AudioVideoEventAttributes, AudioVideoEventName, SessionEvent};
pub use media::{MediaKind, MediaStream, MediaStreamBroker, MediaStreamTrack};
pub use observer::{AudioVideoObserver, ObserverId};
pub use peer::{PeerConnection, PeerConnectionFactory};
pub use policy::{VideoPreference, VideoPreferences, VideoPriorityBasedPolicy};
pub use session_state_controller::SessionStateControllerState;
pub use status::{MeetingSessionStatus, MeetingSessionStatusCode};
pub use turn_credentials::{HttpTurnCredentialsProvider, TurnCredentialsProvider};
