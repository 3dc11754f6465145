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

//! The transport contract consumed by the signaling client.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Close code used when we tear the connection down ourselves.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Everything a transport reports after a successful connect, in the order
/// it happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the server.
    Message(String),
    /// A read or protocol error. A `Closed` event always follows.
    Error(String),
    /// The connection is gone. No further events are delivered.
    Closed { code: u16, reason: String },
}

impl TransportEvent {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportEvent::Closed { .. })
    }
}

/// Error type for connection attempts.
///
/// Preserves the HTTP status code when the server rejects the upgrade so
/// callers can tell an authentication failure from a network failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebSocketConnectError {
    /// The server rejected the upgrade with an HTTP error status.
    #[error("HTTP {status}: WebSocket upgrade rejected")]
    HttpError {
        /// The HTTP status code returned by the server.
        status: u16,
    },
    /// A transport-level or protocol-level error occurred.
    #[error("WebSocket connection failed: {0}")]
    Other(String),
}

impl WebSocketConnectError {
    /// Returns the HTTP status code if this was an HTTP rejection, else `None`.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpError { status } => Some(*status),
            Self::Other(_) => None,
        }
    }
}

/// A bidirectional typed-frame channel to the signaling server.
///
/// Implementations own at most one live connection. Calling
/// [`connect`](SignalingTransport::connect) while connected replaces the
/// previous connection; the old event stream then ends with `Closed`.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a connection and return the stream of inbound events.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, WebSocketConnectError>;

    /// Send one text frame.
    async fn send(&self, text: String) -> anyhow::Result<()>;

    /// Close the connection gracefully. Closing an already closed
    /// transport is not an error.
    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()>;

    /// Whether a connection is currently open.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_http_status() {
        let err = WebSocketConnectError::HttpError { status: 401 };
        assert_eq!(err.http_status(), Some(401));
        assert!(format!("{err}").contains("401"));
    }

    #[test]
    fn test_connect_error_other() {
        let err = WebSocketConnectError::Other("timeout".into());
        assert_eq!(err.http_status(), None);
        assert!(format!("{err}").contains("timeout"));
    }

    #[test]
    fn test_closed_event_detection() {
        assert!(TransportEvent::Closed {
            code: NORMAL_CLOSURE,
            reason: String::new()
        }
        .is_closed());
        assert!(!TransportEvent::Message("{}".into()).is_closed());
    }
}
