//! A tiny chat lobby: one server, two clients, all in one process.
//!
//! Run with `RUST_LOG=debug cargo run -p lobby` to watch the frames.

use std::sync::Arc;
use std::time::Duration;

use meshlink::logging::init_tracing;
use meshlink::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

const CHAT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub from: String,
    pub text: String,
}

fn registry() -> Result<Arc<TypeRegistry>, MeshlinkError> {
    let registry = TypeRegistry::new();
    registry.register_codec::<Chat, _>(CHAT, JsonCodec)?;
    Ok(Arc::new(registry))
}

/// What a lobby client saw, decoded.
#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Welcome(PeerId),
    Joined(String),
    Left(PeerId),
    Chat(Chat),
}

fn decode(registry: &TypeRegistry, type_id: u32, payload: &[u8]) -> Option<Seen> {
    match PacketType::try_from(type_id) {
        Ok(PacketType::Handshake) => Welcome::decode(payload).ok().map(|w| Seen::Welcome(w.peer_id)),
        Ok(PacketType::Event) => match Event::decode(payload).ok()? {
            Event::PeerJoined { name, .. } => Some(Seen::Joined(name)),
            Event::PeerLeft { peer_id } => Some(Seen::Left(peer_id)),
        },
        _ => registry.deserialize::<Chat>(type_id, payload).ok().map(Seen::Chat),
    }
}

async fn join(
    server: &Server<meshlink::transport::StreamTransport>,
    registry: &Arc<TypeRegistry>,
    name: &str,
) -> Result<(Client<meshlink::transport::TcpConnector>, mpsc::UnboundedReceiver<Seen>), MeshlinkError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let decoder = Arc::clone(registry);
    let who = name.to_owned();
    let client = ClientBuilder::new()
        .registry(Arc::clone(registry))
        .on_message(move |type_id, payload| {
            if let Some(seen) = decode(&decoder, type_id, &payload) {
                tracing::info!(client = %who, ?seen, "received");
                let _ = tx.send(seen);
            }
        })
        .tcp();
    client.connect("127.0.0.1", server.local_addr().port()).await?;
    client.handshake(name)?;
    Ok((client, rx))
}

async fn run() -> Result<(), MeshlinkError> {
    let registry = registry()?;
    let server = ServerBuilder::new()
        .config(ServerConfig::default().bind("127.0.0.1:0").relay(true))
        .registry(Arc::clone(&registry))
        .on_connected(|peer| tracing::info!(%peer, "lobby: peer connected"))
        .on_disconnected(|peer| tracing::info!(%peer, "lobby: peer left"))
        .tcp()
        .await?;

    let (alice, mut alice_seen) = join(&server, &registry, "Alice").await?;
    let _ = alice_seen.recv().await;
    let (bob, mut bob_seen) = join(&server, &registry, "Bob").await?;
    let _ = bob_seen.recv().await;
    let _ = alice_seen.recv().await;

    alice.send_typed(
        CHAT,
        &Chat {
            from: "Alice".into(),
            text: "anyone up for a match?".into(),
        },
    )?;
    let _ = tokio::time::timeout(Duration::from_secs(1), bob_seen.recv()).await;

    let rtt = bob.ping(None).await?;
    tracing::info!(?rtt, "bob pinged the server");

    bob.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), alice_seen.recv()).await;

    tracing::info!(stats = ?server.stats(), "lobby closing");
    alice.disconnect().await;
    server.stop().await;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");
    let runtime = meshlink::runtime::worker_runtime(2)?;
    runtime.block_on(run())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat_through_registry() {
        let registry = registry().unwrap();
        let chat = Chat {
            from: "Bob".into(),
            text: "hi".into(),
        };
        let bytes = registry.serialize(CHAT, &chat).unwrap();
        assert_eq!(decode(&registry, CHAT, &bytes), Some(Seen::Chat(chat)));
    }

    #[test]
    fn test_decode_unknown_type_is_none() {
        let registry = registry().unwrap();
        assert_eq!(decode(&registry, 999, b"{}"), None);
    }

    #[tokio::test]
    async fn test_lobby_chat_reaches_other_client() {
        let registry = registry().unwrap();
        let server = ServerBuilder::new()
            .config(ServerConfig::default().bind("127.0.0.1:0").relay(true))
            .registry(Arc::clone(&registry))
            .tcp()
            .await
            .unwrap();

        let (alice, mut alice_seen) = join(&server, &registry, "Alice").await.unwrap();
        assert_eq!(alice_seen.recv().await, Some(Seen::Welcome(PeerId(1))));
        let (_bob, mut bob_seen) = join(&server, &registry, "Bob").await.unwrap();
        assert_eq!(bob_seen.recv().await, Some(Seen::Welcome(PeerId(2))));
        assert_eq!(alice_seen.recv().await, Some(Seen::Joined("Bob".into())));

        let chat = Chat {
            from: "Alice".into(),
            text: "gl hf".into(),
        };
        alice.send_typed(CHAT, &chat).unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), bob_seen.recv())
            .await
            .unwrap();
        assert_eq!(seen, Some(Seen::Chat(chat)));

        server.stop().await;
    }
}
