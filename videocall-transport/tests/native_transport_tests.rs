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

//! Tests for the native WebSocket signaling transport.
//!
//! The loopback tests run a local `tokio-tungstenite` server on an
//! ephemeral port, so no external services are needed.

#[cfg(not(target_arch = "wasm32"))]
mod websocket_tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use videocall_transport::{
        NativeWebSocketTransport, SignalingTransport, TransportEvent, WebSocketConnectError,
    };

    async fn next_event(
        events: &mut tokio::sync::mpsc::Receiver<TransportEvent>,
    ) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_fails_with_invalid_url() {
        let transport = NativeWebSocketTransport::new();
        let result = transport.connect("not-a-url").await;
        assert!(matches!(result, Err(WebSocketConnectError::Other(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_fails_with_unreachable_server() {
        let transport = NativeWebSocketTransport::new();
        let result = transport.connect("ws://127.0.0.1:1/control/test").await;
        assert!(result.is_err(), "Should fail with unreachable server");
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let transport = NativeWebSocketTransport::new();
        assert!(transport.send("hello".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_echo_and_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("echo:{text}"))).await.unwrap();
            }
            ws.send(Message::Binary(b"binary-json".to_vec()))
                .await
                .unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".into(),
            }))
            .await
            .unwrap();
        });

        let transport = NativeWebSocketTransport::new();
        let mut events = transport
            .connect(&format!("ws://{addr}/control/meeting"))
            .await
            .unwrap();
        assert!(transport.is_connected());

        transport.send("ping".to_string()).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message("echo:ping".to_string())
        );
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message("binary-json".to_string())
        );
        match next_event(&mut events).await {
            TransportEvent::Closed { code, reason } => {
                assert_eq!(code, 1001);
                assert_eq!(reason, "going away");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!transport.is_connected());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_close_reports_normal_closure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Drain until the client's close handshake completes.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = NativeWebSocketTransport::new();
        let mut events = transport
            .connect(&format!("ws://{addr}/control/meeting"))
            .await
            .unwrap();

        transport.close(1000, "bye").await.unwrap();
        assert!(!transport.is_connected());

        match next_event(&mut events).await {
            TransportEvent::Closed { code, .. } => assert_eq!(code, 1000),
            other => panic!("expected close, got {other:?}"),
        }

        server.await.unwrap();
    }
}
