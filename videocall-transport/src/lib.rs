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

//! Signaling transports for videocall.rs sessions.
//!
//! The session orchestrator talks to the media host over a bidirectional
//! text channel. [`SignalingTransport`] is that contract; the
//! [`native_websocket`] module implements it on top of `tokio-tungstenite`.
//!
//! # Features
//!
//! - **`native`** (default): WebSocket transport using `tokio-tungstenite`

pub mod transport;

pub use transport::{SignalingTransport, TransportEvent, WebSocketConnectError};

// ── Native transports ─────────────────────────────────────────────────────────

#[cfg(feature = "native")]
pub mod native_websocket;

#[cfg(feature = "native")]
pub use native_websocket::NativeWebSocketTransport;
