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

//! Typed signaling on top of a [`SignalingTransport`].
//!
//! The client encodes outgoing requests, decodes incoming frames and fans
//! everything out as [`SignalingClientEvent`]s on a broadcast bus. Tasks
//! that expect a reply subscribe before sending the request so the reply
//! can never slip past them.

use crate::errors::SignalingError;
use async_broadcast::{broadcast, InactiveReceiver, Receiver, RecvError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use videocall_transport::transport::NORMAL_CLOSURE;
use videocall_transport::{SignalingTransport, TransportEvent};
use videocall_types::{
    decode_frame, encode_frame, DataMessage, DataMessageFrame, FrameType, JoinFrame,
    PauseResumeFrame, PingPongFrame, RemoteVideoUpdateFrame, SignalFrame, SignalMessage,
    SubscribeFrame,
};

const SIGNALING_EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingClientEvent {
    WebSocketConnecting,
    WebSocketOpen,
    WebSocketFailed(String),
    WebSocketError(String),
    WebSocketClosing,
    WebSocketClosed { code: u16, reason: String },
    ReceivedSignalFrame(SignalFrame),
    ProtocolDecodeFailure(String),
}

impl SignalingClientEvent {
    /// A close the client did not ask for.
    pub fn is_unexpected_close(&self) -> bool {
        matches!(self, SignalingClientEvent::WebSocketClosed { code, .. } if *code != NORMAL_CLOSURE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConnectionRequest {
    pub url: String,
}

impl SignalingConnectionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    sender: Sender<SignalingClientEvent>,
    _inactive: InactiveReceiver<SignalingClientEvent>,
    ready: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        let (mut sender, receiver) = broadcast(SIGNALING_EVENT_CAPACITY);
        sender.set_overflow(true);
        Self {
            transport,
            sender,
            _inactive: receiver.deactivate(),
            ready: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    pub fn subscribe_events(&self) -> Receiver<SignalingClientEvent> {
        self.sender.new_receiver()
    }

    /// Whether the connection is open and requests can be sent.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SignalingClientEvent) {
        let _ = self.sender.try_broadcast(event);
    }

    /// Connect, replacing any existing connection.
    pub async fn open_connection(
        &self,
        request: &SignalingConnectionRequest,
    ) -> Result<(), SignalingError> {
        if let Some(previous) = self.pump.lock().take() {
            previous.abort();
        }
        self.ready.store(false, Ordering::SeqCst);
        self.emit(SignalingClientEvent::WebSocketConnecting);

        let mut events = match self.transport.connect(&request.url).await {
            Ok(events) => events,
            Err(e) => {
                warn!("signaling connection failed: {e}");
                self.emit(SignalingClientEvent::WebSocketFailed(e.to_string()));
                return Err(SignalingError::Transport(e.to_string()));
            }
        };

        self.ready.store(true, Ordering::SeqCst);
        info!("signaling connection open");
        self.emit(SignalingClientEvent::WebSocketOpen);

        let sender = self.sender.clone();
        let ready = self.ready.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let event = match event {
                    TransportEvent::Message(text) => match decode_frame(&text) {
                        Ok(frame) => {
                            debug!("received {:?} frame", frame.frame_type());
                            SignalingClientEvent::ReceivedSignalFrame(frame)
                        }
                        Err(e) => {
                            warn!("dropping undecodable signal frame: {e}");
                            SignalingClientEvent::ProtocolDecodeFailure(e.to_string())
                        }
                    },
                    TransportEvent::Error(message) => SignalingClientEvent::WebSocketError(message),
                    TransportEvent::Closed { code, reason } => {
                        ready.store(false, Ordering::SeqCst);
                        info!("signaling connection closed: {code} {reason}");
                        let _ = sender.try_broadcast(SignalingClientEvent::WebSocketClosed {
                            code,
                            reason,
                        });
                        break;
                    }
                };
                let _ = sender.try_broadcast(event);
            }
            ready.store(false, Ordering::SeqCst);
        });
        *self.pump.lock() = Some(pump);
        Ok(())
    }

    async fn send_frame(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.ready() {
            return Err(SignalingError::NotConnected);
        }
        let frame = SignalFrame::new(message);
        let text = encode_frame(&frame)?;
        debug!("sending {:?} frame", frame.frame_type());
        self.transport
            .send(text)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    pub async fn join(&self, frame: JoinFrame) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Join(frame)).await
    }

    pub async fn subscribe(&self, frame: SubscribeFrame) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Subscribe(frame)).await
    }

    pub async fn leave(&self) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Leave).await
    }

    pub async fn pause(&self, stream_ids: Vec<u32>) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Pause(PauseResumeFrame {
            stream_ids,
            group_ids: Vec::new(),
        }))
        .await
    }

    pub async fn resume(&self, stream_ids: Vec<u32>) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Resume(PauseResumeFrame {
            stream_ids,
            group_ids: Vec::new(),
        }))
        .await
    }

    pub async fn remote_video_update(
        &self,
        frame: RemoteVideoUpdateFrame,
    ) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::RemoteVideoUpdate(frame)).await
    }

    pub async fn send_data_message(&self, messages: Vec<DataMessage>) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::DataMessage(DataMessageFrame { messages }))
            .await
    }

    pub async fn ping(&self, ping_id: u32) -> Result<(), SignalingError> {
        self.send_frame(SignalMessage::Ping(PingPongFrame { ping_id }))
            .await
    }

    /// Close gracefully. The `WebSocketClosed` event follows from the pump.
    pub async fn close_connection(&self) -> Result<(), SignalingError> {
        self.emit(SignalingClientEvent::WebSocketClosing);
        self.ready.store(false, Ordering::SeqCst);
        self.transport
            .close(NORMAL_CLOSURE, "normal")
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Wait for the next frame of `frame_type`. Fails if the connection closes
/// first.
pub async fn wait_for_frame(
    events: &mut Receiver<SignalingClientEvent>,
    frame_type: FrameType,
) -> Result<SignalFrame, SignalingError> {
    loop {
        match events.recv().await {
            Ok(SignalingClientEvent::ReceivedSignalFrame(frame))
                if frame.frame_type() == frame_type =>
            {
                return Ok(frame)
            }
            Ok(SignalingClientEvent::WebSocketClosed { .. })
            | Ok(SignalingClientEvent::WebSocketFailed(_)) => {
                return Err(SignalingError::NotConnected)
            }
            Ok(_) => {}
            Err(RecvError::Overflowed(skipped)) => {
                warn!("signaling listener fell behind, skipped {skipped} events");
            }
            Err(RecvError::Closed) => return Err(SignalingError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedTransport;
    use videocall_types::ServerSideNetworkAdaption;

    fn join_frame() -> JoinFrame {
        JoinFrame {
            protocol_version: 2,
            max_num_of_videos: 16,
            attendee_id: "me".into(),
            server_side_network_adaption: ServerSideNetworkAdaption::Default,
            supported_server_side_network_adaptions: vec![],
            wants_all_temporal_layers_in_index: false,
        }
    }

    #[tokio::test]
    async fn requests_fail_before_open() {
        let client = SignalingClient::new(Arc::new(ScriptedTransport::default()));
        assert!(!client.ready());
        assert!(matches!(
            client.join(join_frame()).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn join_reply_is_delivered_in_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = SignalingClient::new(transport.clone());
        let mut events = client.subscribe_events();

        client
            .open_connection(&SignalingConnectionRequest::new("ws://test"))
            .await
            .unwrap();
        assert!(client.ready());
        client.join(join_frame()).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SignalingClientEvent::WebSocketConnecting
        );
        assert_eq!(events.recv().await.unwrap(), SignalingClientEvent::WebSocketOpen);
        let ack = wait_for_frame(&mut events, FrameType::JoinAck).await.unwrap();
        assert_eq!(ack.frame_type(), FrameType::JoinAck);
        let index = wait_for_frame(&mut events, FrameType::Index).await.unwrap();
        assert_eq!(index.frame_type(), FrameType::Index);
        assert_eq!(transport.sent_types(), vec![FrameType::Join]);
    }

    #[tokio::test]
    async fn dropped_connection_ends_waits() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = SignalingClient::new(transport.clone());
        client
            .open_connection(&SignalingConnectionRequest::new("ws://test"))
            .await
            .unwrap();
        let mut events = client.subscribe_events();

        transport.drop_connection().await;
        let result = wait_for_frame(&mut events, FrameType::SubscribeAck).await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
        assert!(!client.ready());
    }

    #[tokio::test]
    async fn graceful_close_is_not_unexpected() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = SignalingClient::new(transport.clone());
        client
            .open_connection(&SignalingConnectionRequest::new("ws://test"))
            .await
            .unwrap();
        let mut events = client.subscribe_events();
        client.close_connection().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SignalingClientEvent::WebSocketClosing);
        let closed = events.recv().await.unwrap();
        assert!(matches!(closed, SignalingClientEvent::WebSocketClosed { code: 1000, .. }));
        assert!(!closed.is_unexpected_close());
    }

    #[tokio::test]
    async fn failed_connect_is_reported() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_connect.store(true, Ordering::SeqCst);
        let client = SignalingClient::new(transport);
        let mut events = client.subscribe_events();
        assert!(client
            .open_connection(&SignalingConnectionRequest::new("ws://test"))
            .await
            .is_err());
        assert_eq!(events.recv().await.unwrap(), SignalingClientEvent::WebSocketConnecting);
        assert!(matches!(
            events.recv().await.unwrap(),
            SignalingClientEvent::WebSocketFailed(_)
        ));
    }
}
