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

//! Native WebSocket signaling transport using `tokio-tungstenite`.
//!
//! # Example
//!
//! ```no_run
//! use videocall_transport::{NativeWebSocketTransport, SignalingTransport, TransportEvent};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = NativeWebSocketTransport::new();
//! let mut events = transport.connect("wss://host:443/control/meeting").await?;
//!
//! transport.send(r#"{"message":{"type":"LEAVE"}}"#.to_string()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Message(text) = event {
//!         println!("Received {text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::transport::{
    SignalingTransport, TransportEvent, WebSocketConnectError, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

const INBOUND_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone)]
struct Connection {
    writer: WsWriter,
    closed: Arc<AtomicBool>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self, code: u16, reason: &str) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Message::Close(Some(frame))).await {
                warn!("Error sending WebSocket close frame: {e}");
            }
        }
    }
}

/// A [`SignalingTransport`] over a native WebSocket.
///
/// Text frames carry signaling messages. Binary frames are accepted when
/// they hold UTF-8 so servers that send JSON as binary still work.
#[derive(Default)]
pub struct NativeWebSocketTransport {
    connection: std::sync::Mutex<Option<Connection>>,
}

impl std::fmt::Debug for NativeWebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeWebSocketTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl NativeWebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<Connection> {
        match self.connection.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, connection: Option<Connection>) -> Option<Connection> {
        match self.connection.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, connection),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), connection),
        }
    }

    /// Split the stream and spawn the reader task.
    fn setup_streams(ws_stream: WsStream) -> (Connection, mpsc::Receiver<TransportEvent>) {
        let (writer, mut reader) = ws_stream.split();

        let closed = Arc::new(AtomicBool::new(false));
        let connection = Connection {
            writer: Arc::new(Mutex::new(writer)),
            closed: closed.clone(),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut close_event = None;
            while let Some(msg_result) = reader.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = inbound_tx.send(TransportEvent::Message(text)).await {
                            debug!("Inbound channel closed: {e}");
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        let event = match String::from_utf8(data) {
                            Ok(text) => TransportEvent::Message(text),
                            Err(e) => TransportEvent::Error(format!("non UTF-8 frame: {e}")),
                        };
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket received close frame {frame:?}");
                        close_event = Some(match frame {
                            Some(frame) => TransportEvent::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                            },
                            None => TransportEvent::Closed {
                                code: NORMAL_CLOSURE,
                                reason: String::new(),
                            },
                        });
                        break;
                    }
                    Ok(Message::Ping(payload)) => {
                        debug!("WebSocket ping received ({} bytes)", payload.len());
                    }
                    Ok(Message::Pong(_)) => {
                        debug!("WebSocket pong received");
                    }
                    Ok(Message::Frame(_)) => {
                        debug!("WebSocket raw frame ignored");
                    }
                    Err(e) => {
                        if !closed.load(Ordering::Relaxed) {
                            error!("WebSocket read error: {e}");
                            let _ = inbound_tx.send(TransportEvent::Error(e.to_string())).await;
                        }
                        break;
                    }
                }
            }
            let locally_closed = closed.swap(true, Ordering::AcqRel);
            let event = close_event.unwrap_or(TransportEvent::Closed {
                code: if locally_closed {
                    NORMAL_CLOSURE
                } else {
                    ABNORMAL_CLOSURE
                },
                reason: String::new(),
            });
            let _ = inbound_tx.send(event).await;
            debug!("WebSocket inbound reader loop ended");
        });

        (connection, inbound_rx)
    }
}

#[async_trait]
impl SignalingTransport for NativeWebSocketTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> std::result::Result<mpsc::Receiver<TransportEvent>, WebSocketConnectError> {
        if let Some(previous) = self.replace(None) {
            if previous.is_open() {
                info!("Closing previous signaling connection before reconnecting");
                previous.close(NORMAL_CLOSURE, "reconnecting").await;
            }
        }

        url::Url::parse(url)
            .map_err(|e| WebSocketConnectError::Other(format!("invalid url '{url}': {e}")))?;
        info!("NativeWebSocket connecting to {url}");

        let (ws_stream, response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Http(resp) => {
                        WebSocketConnectError::HttpError {
                            status: resp.status().as_u16(),
                        }
                    }
                    other => WebSocketConnectError::Other(format!(
                        "WebSocket connection to '{url}' failed: {other}"
                    )),
                })?;

        info!("WebSocket connected to {url} (HTTP {})", response.status());

        let (connection, events) = Self::setup_streams(ws_stream);
        self.replace(Some(connection));
        Ok(events)
    }

    async fn send(&self, text: String) -> Result<()> {
        let connection = self
            .current()
            .filter(Connection::is_open)
            .ok_or_else(|| anyhow!("WebSocket is closed"))?;
        let mut writer = connection.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|e| anyhow!("WebSocket send error: {e}"))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if let Some(connection) = self.current() {
            connection.close(code, reason).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current().map(|c| c.is_open()).unwrap_or(false)
    }
}
