//! Integration tests for the WebSocket transport.
//!
//! These spin up a real WebSocket listener and client on loopback to verify
//! that frames survive the trip in both directions.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::SinkExt;
    use meshlink_protocol::{Route, STREAM_HEADER_LEN, WireFormat};
    use meshlink_transport::{
        Connector, Listener, Transport, TransportError, WebSocketConnector,
        WebSocketListener,
    };
    use tokio_tungstenite::tungstenite::Message;

    const MAX: usize = 4096;

    fn framed(type_id: u32, payload: &[u8]) -> Bytes {
        WireFormat::Streamed { max_payload: MAX }
            .encode(type_id, payload)
            .unwrap()
    }

    async fn bound() -> (WebSocketListener, u16) {
        // Port 0 lets the OS pick a free port.
        let listener = WebSocketListener::bind("127.0.0.1:0", MAX)
            .await
            .expect("should bind");
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let (listener, port) = bound().await;
        let server_handle =
            tokio::spawn(async move { listener.accept().await.expect("should accept") });

        let client = WebSocketConnector::new(MAX, Duration::from_secs(2))
            .dial("127.0.0.1", port)
            .await
            .expect("client should connect");
        let server = server_handle.await.expect("task should complete");

        // --- Server sends, client receives ---
        let sent = server
            .send_framed(framed(7, b"hello from server"), Route::default())
            .await
            .expect("send should succeed");
        assert_eq!(sent, STREAM_HEADER_LEN + 17);

        let frame = client.recv_framed().await.unwrap().unwrap();
        assert_eq!(frame.type_id, 7);
        assert_eq!(&frame.payload[..], b"hello from server");

        // --- Client sends, server receives ---
        client
            .send_framed(framed(8, b"hello from client"), Route::default())
            .await
            .unwrap();
        let frame = server.recv_framed().await.unwrap().unwrap();
        assert_eq!(frame.type_id, 8);
        assert_eq!(&frame.payload[..], b"hello from client");

        // --- Clean close ---
        server.close().await.expect("close should succeed");
        assert!(client.recv_framed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (listener, port) = bound().await;
        let server_handle = tokio::spawn(async move { listener.accept().await.unwrap() });

        let url = format!("ws://127.0.0.1:{port}");
        let (mut raw_client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let server = server_handle.await.unwrap();

        raw_client.send(Message::Close(None)).await.unwrap();

        let result = server.recv_framed().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_websocket_malformed_frame_is_frame_error() {
        let (listener, port) = bound().await;
        let server_handle = tokio::spawn(async move { listener.accept().await.unwrap() });

        let url = format!("ws://127.0.0.1:{port}");
        let (mut raw_client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let server = server_handle.await.unwrap();

        // Three bytes cannot hold a ten-byte header.
        raw_client
            .send(Message::binary(vec![1u8, 0, 5]))
            .await
            .unwrap();

        let result = server.recv_framed().await;
        assert!(matches!(result, Err(TransportError::Frame(_))));
    }

    #[tokio::test]
    async fn test_websocket_idle_socket_does_not_block_accept() {
        let (listener, port) = bound().await;

        // Connects but never sends the HTTP upgrade.
        let _idle = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();

        let server_handle = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = WebSocketConnector::new(MAX, Duration::from_secs(2))
            .dial("127.0.0.1", port)
            .await
            .expect("client should connect past the idle socket");
        let server = tokio::time::timeout(Duration::from_secs(2), server_handle)
            .await
            .expect("accept should not wait on the idle socket")
            .unwrap();

        client
            .send_framed(framed(9, b"through"), Route::default())
            .await
            .unwrap();
        let frame = server.recv_framed().await.unwrap().unwrap();
        assert_eq!(frame.type_id, 9);
    }

    #[tokio::test]
    async fn test_websocket_upgrade_timeout_drops_silent_socket() {
        use tokio::io::AsyncReadExt;

        let listener =
            WebSocketListener::bind_with_timeout("127.0.0.1:0", MAX, Duration::from_millis(100))
                .await
                .unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut idle = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("server should hang up on the silent socket");
        assert!(matches!(read, Ok(0) | Err(_)));
        drop(listener);
    }
}
