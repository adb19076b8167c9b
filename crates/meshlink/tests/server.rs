//! Integration tests for the server and client hosts over loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use meshlink::prelude::*;
use meshlink::transport::{StreamTransport, TcpConnector};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =========================================================================
// Helpers
// =========================================================================

const CHAT: u32 = 100;

type Inbox = mpsc::UnboundedReceiver<(u32, Bytes)>;

async fn start_server(config: ServerConfig) -> Server<StreamTransport> {
    ServerBuilder::new()
        .config(config.bind("127.0.0.1:0"))
        .tcp()
        .await
        .expect("server should bind")
}

/// A connected client whose unsolicited messages land in the returned inbox.
async fn connect_client(server: &Server<StreamTransport>) -> (Client<TcpConnector>, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = ClientBuilder::new()
        .on_message(move |type_id, payload| {
            let _ = tx.send((type_id, payload));
        })
        .tcp();
    client
        .connect("127.0.0.1", server.local_addr().port())
        .await
        .expect("client should connect");
    (client, rx)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn next_message(inbox: &mut Inbox) -> (u32, Bytes) {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("inbox closed")
}

// =========================================================================
// Handshake
// =========================================================================

#[tokio::test]
async fn test_handshake_alice_gets_welcome_and_others_get_event() {
    let server = start_server(ServerConfig::default()).await;

    let (alice, mut alice_inbox) = connect_client(&server).await;
    wait_until("alice registered", || server.peer_count() == 1).await;
    let (_bob, mut bob_inbox) = connect_client(&server).await;
    wait_until("bob registered", || server.peer_count() == 2).await;

    alice.handshake("Alice").unwrap();

    let (type_id, payload) = next_message(&mut alice_inbox).await;
    assert_eq!(type_id, PacketType::Handshake.id());
    assert_eq!(
        Welcome::decode(&payload).unwrap(),
        Welcome {
            peer_id: PeerId(1),
            message: "Welcome".into()
        }
    );
    wait_until("welcome recorded", || alice.peer_id() == Some(PeerId(1))).await;

    let (type_id, payload) = next_message(&mut bob_inbox).await;
    assert_eq!(type_id, PacketType::Event.id());
    assert_eq!(
        Event::decode(&payload).unwrap(),
        Event::PeerJoined {
            peer_id: PeerId(1),
            name: "Alice".into()
        }
    );

    assert_eq!(server.peer_name(PeerId(1)).as_deref(), Some("Alice"));
    assert_eq!(server.peer_id_by_name("Alice"), Some(PeerId(1)));

    // The sender is excluded from its own join event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_inbox.try_recv().is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_unnamed_peer_messages_are_dropped() {
    let server = start_server(ServerConfig::default()).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    server.set_on_message(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (client, _inbox) = connect_client(&server).await;
    client.send(CHAT, b"too early").unwrap();
    client.handshake("Carol").unwrap();
    client.send(CHAT, b"hello").unwrap();

    wait_until("named message delivered", || received.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(server.peer_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unnamed_policy_disconnect_closes_peer() {
    let server = start_server(
        ServerConfig::default().unnamed_policy(UnnamedPolicy::Disconnect),
    )
    .await;
    let (client, _inbox) = connect_client(&server).await;
    wait_until("peer registered", || server.peer_count() == 1).await;

    client.send(CHAT, b"no name").unwrap();
    wait_until("peer removed", || server.peer_count() == 0).await;
    wait_until("client closed", || !client.is_connected()).await;

    server.stop().await;
}

#[tokio::test]
async fn test_handshake_timeout_kicks_silent_peer() {
    let server = start_server(
        ServerConfig::default().handshake_timeout(Duration::from_millis(50)),
    )
    .await;
    let (_client, _inbox) = connect_client(&server).await;
    wait_until("peer registered", || server.peer_count() == 1).await;
    wait_until("peer kicked", || server.peer_count() == 0).await;

    server.stop().await;
}

// =========================================================================
// Requests
// =========================================================================

#[tokio::test]
async fn test_ping_answered_by_auto_pong() {
    let server = start_server(ServerConfig::default()).await;
    let (client, _inbox) = connect_client(&server).await;

    let rtt = client.ping(Some(Duration::from_secs(2))).await.unwrap();
    assert!(rtt < Duration::from_secs(2));
    assert_eq!(client.pending_requests(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_ping_timeout_then_late_reply_is_discarded() {
    let server = start_server(ServerConfig::default().auto_pong(false)).await;
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
    server.set_on_message(move |peer, type_id, payload| {
        if type_id == PacketType::Ping.id() {
            let _ = ping_tx.send((peer, payload));
        }
    });

    let (client, mut inbox) = connect_client(&server).await;
    client.handshake("Dave").unwrap();
    let _welcome = next_message(&mut inbox).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let counter = Arc::clone(&calls);
    let started = tokio::time::Instant::now();
    client
        .async_request(
            PacketType::Ping.id(),
            PacketType::Pong.id(),
            b"",
            Some(Duration::from_millis(50)),
            move |result| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(result);
            },
        )
        .unwrap();

    let result = done_rx.await.unwrap();
    assert!(matches!(result, Err(RequestError::TimedOut { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_millis(1000));

    // The server answers late, echoing the request id.
    let (peer, ping_payload) = tokio::time::timeout(Duration::from_secs(1), ping_rx.recv())
        .await
        .unwrap()
        .unwrap();
    server
        .send_to_peer(peer, PacketType::Pong.id(), &ping_payload)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(inbox.try_recv().is_err(), "late pong must not reach the app");
    assert!(client.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn test_pending_request_fails_when_server_stops() {
    let server = start_server(ServerConfig::default().auto_pong(false)).await;
    let (client, _inbox) = connect_client(&server).await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    client
        .async_request(
            PacketType::Ping.id(),
            PacketType::Pong.id(),
            b"",
            Some(Duration::from_secs(10)),
            move |result| {
                let _ = done_tx.send(result);
            },
        )
        .unwrap();

    server.stop().await;
    let result = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(RequestError::ConnectionClosed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_fails_pending_requests_before_returning() {
    let server = start_server(ServerConfig::default().auto_pong(false)).await;
    let (client, _inbox) = connect_client(&server).await;
    let failed = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let failed = Arc::clone(&failed);
        client
            .async_request(
                PacketType::Ping.id(),
                PacketType::Pong.id(),
                b"",
                Some(Duration::from_secs(10)),
                move |result| {
                    assert_eq!(result, Err(RequestError::ConnectionClosed));
                    failed.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }

    client.disconnect().await;
    assert_eq!(failed.load(Ordering::SeqCst), 2);
    assert_eq!(client.pending_requests(), 0);
    server.stop().await;
}

// =========================================================================
// Peer management
// =========================================================================

#[tokio::test]
async fn test_kick_removes_peer_once_closed() {
    let server = start_server(ServerConfig::default()).await;
    let disconnected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnected);
    server.set_on_disconnected(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (client, _inbox) = connect_client(&server).await;
    wait_until("peer registered", || server.peer_count() == 1).await;
    let peer = server.peer_ids()[0];

    server.kick_peer(peer).unwrap();
    wait_until("peer removed", || server.peer_count() == 0).await;
    wait_until("client sees close", || !client.is_connected()).await;
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert!(matches!(
        server.kick_peer(peer),
        Err(MeshlinkError::Session(SessionError::PeerNotFound(_)))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_peer_left_event_after_disconnect() {
    let server = start_server(ServerConfig::default()).await;
    let (alice, mut alice_inbox) = connect_client(&server).await;
    let (bob, mut bob_inbox) = connect_client(&server).await;
    wait_until("both registered", || server.peer_count() == 2).await;

    bob.handshake("Bob").unwrap();
    let (_, joined) = next_message(&mut alice_inbox).await;
    let bob_id = Event::decode(&joined).unwrap().peer_id();
    let _welcome = next_message(&mut bob_inbox).await;

    bob.disconnect().await;
    let (type_id, payload) = next_message(&mut alice_inbox).await;
    assert_eq!(type_id, PacketType::Event.id());
    assert_eq!(Event::decode(&payload).unwrap(), Event::PeerLeft { peer_id: bob_id });

    drop(alice);
    server.stop().await;
}

#[tokio::test]
async fn test_max_peers_rejects_extra_connection() {
    let server = start_server(ServerConfig::default().max_peers(1)).await;
    let (_first, _i1) = connect_client(&server).await;
    wait_until("first registered", || server.peer_count() == 1).await;

    let (second, _i2) = connect_client(&server).await;
    wait_until("second closed", || !second.is_connected()).await;
    assert_eq!(server.peer_count(), 1);
    assert_eq!(server.stats().rejected, 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_leaves_no_peers_and_silences_callbacks() {
    let server = start_server(ServerConfig::default()).await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    server.set_on_disconnected(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_client(&server).await);
    }
    wait_until("all registered", || server.peer_count() == 3).await;

    server.stop().await;
    assert_eq!(server.peer_count(), 0);
    for (client, _) in &clients {
        wait_until("client closed", || !client.is_connected()).await;
    }

    let after_stop = disconnects.load(Ordering::SeqCst);
    assert_eq!(after_stop, 3, "every disconnect reported before stop returned");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), after_stop);
}

// =========================================================================
// Broadcast and relay
// =========================================================================

#[tokio::test]
async fn test_broadcast_excludes_one_peer() {
    let server = start_server(ServerConfig::default()).await;
    let (_a, mut inbox_a) = connect_client(&server).await;
    let (_b, mut inbox_b) = connect_client(&server).await;
    let (_c, mut inbox_c) = connect_client(&server).await;
    wait_until("all registered", || server.peer_count() == 3).await;

    let excluded = server.peer_ids()[2];
    let report = server.broadcast(CHAT, b"news", Some(excluded));
    assert_eq!(report.delivered, 2);
    assert!(report.failed.is_empty());

    let mut got = 0;
    for inbox in [&mut inbox_a, &mut inbox_b, &mut inbox_c] {
        if let Ok(Some((type_id, payload))) =
            tokio::time::timeout(Duration::from_millis(200), inbox.recv()).await
        {
            assert_eq!(type_id, CHAT);
            assert_eq!(&payload[..], b"news");
            got += 1;
        }
    }
    assert_eq!(got, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_relay_forwards_to_other_peers() {
    let server = start_server(ServerConfig::default().relay(true)).await;
    let (alice, mut alice_inbox) = connect_client(&server).await;
    let (bob, mut bob_inbox) = connect_client(&server).await;
    wait_until("both registered", || server.peer_count() == 2).await;

    alice.handshake("Alice").unwrap();
    let _welcome = next_message(&mut alice_inbox).await;
    let _joined = next_message(&mut bob_inbox).await;

    alice.send(CHAT, b"hi bob").unwrap();
    let (type_id, payload) = next_message(&mut bob_inbox).await;
    assert_eq!(type_id, CHAT);
    assert_eq!(&payload[..], b"hi bob");

    drop(bob);
    server.stop().await;
}

// =========================================================================
// Typed payloads
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    from: String,
    text: String,
}

#[tokio::test]
async fn test_typed_send_round_trips_through_registry() {
    let registry = Arc::new(TypeRegistry::new());
    registry.register_codec::<Chat, _>(CHAT, JsonCodec).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let server_registry = Arc::clone(&registry);
    let server = ServerBuilder::new()
        .bind("127.0.0.1:0")
        .registry(Arc::clone(&registry))
        .on_message(move |_, type_id, payload| {
            let chat: Chat = server_registry.deserialize(type_id, &payload).unwrap();
            let _ = tx.send(chat);
        })
        .tcp()
        .await
        .unwrap();

    let client = ClientBuilder::new().registry(Arc::clone(&registry)).tcp();
    client
        .connect("127.0.0.1", server.local_addr().port())
        .await
        .unwrap();
    client.handshake("Erin").unwrap();

    let chat = Chat {
        from: "Erin".into(),
        text: "gg".into(),
    };
    client.send_typed(CHAT, &chat).unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, chat);

    assert!(server.stats().messages_received >= 2);
    assert!(client.bytes_sent() > 0);
    server.stop().await;
}
