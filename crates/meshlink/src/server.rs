//! `Server` builder and accept loop.
//!
//! This is the entry point for hosting peers. It ties the layers together:
//! listener → connection → peer table → application callbacks.
//!
//! ```text
//!   Listener ──accept──▶ admit() ──▶ PeerTable
//!                                      │
//!   Connection ──on_message──▶ PeerObserver ──▶ built-ins (handshake, ping)
//!                                      └──────▶ on_message callback
//! ```
//!
//! Every connection's observer holds only a `Weak` reference to the server
//! state, so the table (which owns the connections) never forms a cycle
//! with them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use meshlink_protocol::{Event, Handshake, PacketType, PeerId, TypeRegistry, Welcome};
use meshlink_session::{BroadcastReport, Connection, ConnectionObserver, PeerInfo, PeerTable};
use meshlink_transport::{
    ConnectionId, DatagramListener, DatagramTransport, Listener, StreamListener,
    StreamTransport, Transport, TransportError,
};
#[cfg(feature = "websocket")]
use meshlink_transport::{WebSocketListener, WebSocketTransport};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::MeshlinkError;
use crate::config::{ServerConfig, UnnamedPolicy};

/// Extra time `stop` grants beyond the configured linger.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Text the server puts in every [`Welcome`].
const WELCOME_MESSAGE: &str = "Welcome";

/// Called with the sender, type id, and payload of each routable message.
pub type MessageHandler = Arc<dyn Fn(PeerId, u32, Bytes) + Send + Sync>;

/// Called when a peer connects or disconnects.
pub type PeerHandler = Arc<dyn Fn(PeerId) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_message: Option<MessageHandler>,
    on_connected: Option<PeerHandler>,
    on_disconnected: Option<PeerHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// No new peers; existing ones are closing.
    Draining,
    Stopped,
}

/// A point-in-time summary of server activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub peers: usize,
    pub accepted: u64,
    /// Connections closed on arrival because the server was full.
    pub rejected: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    messages_received: AtomicU64,
    /// Traffic of peers that already left.
    retired_sent: AtomicU64,
    retired_received: AtomicU64,
}

/// Shared server state. Connection observers reach it through a `Weak`.
struct ServerState<T: Transport> {
    config: ServerConfig,
    registry: Arc<TypeRegistry>,
    peers: PeerTable<T>,
    callbacks: RwLock<Callbacks>,
    accepting: AtomicBool,
    /// Set once `stop` has closed everything; silences callbacks.
    stopped: AtomicBool,
    counters: Counters,
}

impl<T: Transport> ServerState<T> {
    fn callbacks(&self) -> Callbacks {
        if self.stopped.load(Ordering::Acquire) {
            return Callbacks::default();
        }
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_callbacks(&self, update: impl FnOnce(&mut Callbacks)) {
        update(
            &mut self
                .callbacks
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Registers a freshly accepted transport as a peer.
    fn admit(self: &Arc<Self>, transport: T) {
        let full = self.peers.len() >= self.config.limits.max_peers;
        if full || !self.accepting.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                addr = ?transport.peer_addr(),
                max_peers = self.config.limits.max_peers,
                "rejecting connection"
            );
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
            return;
        }

        let peer = self.peers.allocate_id();
        let observer = Arc::new(PeerObserver {
            peer,
            state: Arc::downgrade(self),
        });
        let conn = Connection::accept(transport, observer, self.config.connection());
        self.peers.insert(peer, conn.clone());
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        conn.start();

        tracing::info!(%peer, conn = %conn.id(), addr = ?conn.peer_addr(), "peer connected");

        if let Some(timeout) = self.config.handshake_timeout {
            self.arm_handshake_timeout(peer, timeout);
        }
        if let Some(on_connected) = self.callbacks().on_connected {
            on_connected(peer);
        }
    }

    fn arm_handshake_timeout(self: &Arc<Self>, peer: PeerId, timeout: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(state) = weak.upgrade() else {
                return;
            };
            if state.peers.contains(peer) && !state.peers.is_handshaken(peer) {
                tracing::warn!(%peer, ?timeout, "handshake timed out");
                let _ = state.peers.kick(peer);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    fn on_message(&self, peer: PeerId, type_id: u32, payload: Bytes) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.peers.touch(peer);

        match PacketType::try_from(type_id) {
            Ok(PacketType::Handshake) => {
                self.on_handshake(peer, &payload);
                return;
            }
            Ok(PacketType::Ping) if self.config.auto_pong => {
                if let Err(e) = self.peers.send_to(peer, PacketType::Pong.id(), &payload) {
                    tracing::debug!(%peer, error = %e, "pong not sent");
                }
                return;
            }
            Ok(PacketType::Disconnect) => {
                tracing::debug!(%peer, "peer asked to disconnect");
                let _ = self.peers.kick(peer);
                return;
            }
            _ => {}
        }

        if !self.peers.is_handshaken(peer) {
            match self.config.unnamed_policy {
                UnnamedPolicy::Drop => {
                    tracing::debug!(%peer, type_id, "dropping message from unnamed peer");
                }
                UnnamedPolicy::Disconnect => {
                    tracing::warn!(%peer, type_id, "message before handshake, disconnecting");
                    let _ = self.peers.kick(peer);
                }
            }
            return;
        }

        if self.config.relay {
            let report = self.peers.broadcast(type_id, &payload, Some(peer));
            if !report.failed.is_empty() {
                tracing::warn!(%peer, type_id, failed = ?report.failed, "relay incomplete");
            }
        }

        if let Some(on_message) = self.callbacks().on_message {
            on_message(peer, type_id, payload);
        }
    }

    fn on_handshake(&self, peer: PeerId, payload: &[u8]) {
        let name = match Handshake::decode(payload) {
            Ok(handshake) => handshake.name,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed handshake");
                let _ = self.peers.kick(peer);
                return;
            }
        };

        self.peers.set_name(peer, name.clone());
        self.peers.mark_handshaken(peer);
        tracing::info!(%peer, %name, "peer handshaken");

        let welcome = Welcome {
            peer_id: peer,
            message: WELCOME_MESSAGE.to_owned(),
        };
        match welcome.encode() {
            Ok(bytes) => {
                if let Err(e) = self.peers.send_to(peer, PacketType::Handshake.id(), &bytes) {
                    tracing::warn!(%peer, error = %e, "welcome not sent");
                }
            }
            Err(e) => tracing::warn!(%peer, error = %e, "welcome not encodable"),
        }

        self.announce(Event::PeerJoined { peer_id: peer, name }, peer);
    }

    /// Broadcasts `event` to everyone but `about`.
    fn announce(&self, event: Event, about: PeerId) {
        match event.encode() {
            Ok(bytes) => {
                let report = self.peers.broadcast(PacketType::Event.id(), &bytes, Some(about));
                if !report.failed.is_empty() {
                    tracing::warn!(peer = %about, failed = ?report.failed, "event not delivered to all peers");
                }
            }
            Err(e) => tracing::warn!(peer = %about, error = %e, "event not encodable"),
        }
    }

    fn on_close(&self, peer: PeerId) {
        if let Some(conn) = self.peers.connection(peer) {
            self.counters
                .retired_sent
                .fetch_add(conn.bytes_sent(), Ordering::Relaxed);
            self.counters
                .retired_received
                .fetch_add(conn.bytes_received(), Ordering::Relaxed);
        }

        let removed = self.peers.remove(peer);
        if removed.as_ref().is_some_and(|info| info.handshaken) {
            self.announce(Event::PeerLeft { peer_id: peer }, peer);
        }
        tracing::info!(%peer, "peer disconnected");

        if let Some(on_disconnected) = self.callbacks().on_disconnected {
            on_disconnected(peer);
        }
    }
}

/// Tags one connection's events with its peer id.
struct PeerObserver<T: Transport> {
    peer: PeerId,
    state: Weak<ServerState<T>>,
}

impl<T: Transport> ConnectionObserver for PeerObserver<T> {
    fn on_message(&self, _conn: ConnectionId, type_id: u32, payload: Bytes) {
        if let Some(state) = self.state.upgrade() {
            state.on_message(self.peer, type_id, payload);
        }
    }

    fn on_error(&self, conn: ConnectionId, error: &TransportError) {
        tracing::warn!(peer = %self.peer, %conn, error = %error, "peer connection failed");
    }

    fn on_close(&self, _conn: ConnectionId) {
        if let Some(state) = self.state.upgrade() {
            state.on_close(self.peer);
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`Server`].
///
/// # Example
///
/// ```rust,no_run
/// use meshlink::prelude::*;
///
/// # async fn run() -> Result<(), MeshlinkError> {
/// let server = ServerBuilder::new()
///     .bind("0.0.0.0:27015")
///     .on_message(|peer, type_id, payload| {
///         tracing::info!(%peer, type_id, len = payload.len(), "message");
///     })
///     .tcp()
///     .await?;
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    registry: Option<Arc<TypeRegistry>>,
    callbacks: Callbacks,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            registry: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Shares an application-owned registry. A fresh one is created
    /// otherwise.
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(PeerId, u32, Bytes) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.callbacks.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.callbacks.on_disconnected = Some(Arc::new(f));
        self
    }

    /// Binds a TCP listener and starts serving.
    ///
    /// # Errors
    /// [`TransportError::Bind`] if the address is invalid or taken.
    pub async fn tcp(self) -> Result<Server<StreamTransport>, MeshlinkError> {
        let listener =
            StreamListener::bind(&self.config.bind_addr, self.config.limits.max_payload).await?;
        self.serve(listener)
    }

    /// Binds a UDP socket and starts serving.
    ///
    /// # Errors
    /// - [`TransportError::InvalidChannel`] if the delivery policy routes
    ///   to a channel the datagram config doesn't have.
    /// - [`TransportError::Bind`] as for [`tcp`](Self::tcp).
    pub async fn udp(self) -> Result<Server<DatagramTransport>, MeshlinkError> {
        check_channels(&self.config.policy, self.config.datagram.channel_count)?;
        let listener =
            DatagramListener::bind(&self.config.bind_addr, self.config.datagram.clone()).await?;
        self.serve(listener)
    }

    /// Binds a WebSocket listener and starts serving.
    #[cfg(feature = "websocket")]
    pub async fn websocket(self) -> Result<Server<WebSocketTransport>, MeshlinkError> {
        let listener =
            WebSocketListener::bind(&self.config.bind_addr, self.config.limits.max_payload)
                .await?;
        self.serve(listener)
    }

    /// Starts serving on an already bound listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn serve<L: Listener>(self, listener: L) -> Result<Server<L::Transport>, MeshlinkError> {
        let local_addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            registry: self.registry.unwrap_or_default(),
            peers: PeerTable::new(),
            callbacks: RwLock::new(self.callbacks),
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
            config: self.config,
        });

        let (phase, phase_rx) = watch::channel(Phase::Running);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state), phase_rx));
        tracing::info!(%local_addr, "server running");

        Ok(Server {
            state,
            local_addr,
            phase,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn check_channels(
    policy: &meshlink_protocol::DeliveryPolicy,
    channel_count: u8,
) -> Result<(), TransportError> {
    let channel = policy.max_channel();
    if channel >= channel_count {
        return Err(TransportError::InvalidChannel {
            channel,
            count: channel_count,
        });
    }
    Ok(())
}

async fn wait_phase(phase: &mut watch::Receiver<Phase>, reached: impl Fn(&Phase) -> bool) {
    let _ = phase.wait_for(reached).await;
}

async fn accept_loop<L: Listener>(
    listener: L,
    state: Arc<ServerState<L::Transport>>,
    mut phase: watch::Receiver<Phase>,
) {
    loop {
        tokio::select! {
            _ = wait_phase(&mut phase, |p| *p != Phase::Running) => break,
            accepted = listener.accept() => match accepted {
                Ok(transport) => state.admit(transport),
                Err(TransportError::Shutdown) => break,
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    // A datagram listener's socket carries every accepted peer, so it stays
    // open until those peers are closed.
    wait_phase(&mut phase, |p| *p == Phase::Stopped).await;
    if let Err(e) = listener.shutdown().await {
        tracing::debug!(error = %e, "listener shutdown failed");
    }
    tracing::debug!("accept loop finished");
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A running server.
///
/// Dropping it stops accepting and starts closing every peer; call
/// [`stop`](Self::stop) to wait for that to finish.
pub struct Server<T: Transport> {
    state: Arc<ServerState<T>>,
    local_addr: SocketAddr,
    phase: watch::Sender<Phase>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Server<T> {
    /// Creates a new builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.state.registry
    }

    pub fn is_running(&self) -> bool {
        *self.phase.borrow() == Phase::Running
    }

    fn ensure_running(&self) -> Result<(), MeshlinkError> {
        if self.state.stopped.load(Ordering::Acquire) {
            return Err(MeshlinkError::Stopped);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends a raw payload to one peer.
    pub fn send_to_peer(&self, peer: PeerId, type_id: u32, payload: &[u8]) -> Result<(), MeshlinkError> {
        self.ensure_running()?;
        Ok(self.state.peers.send_to(peer, type_id, payload)?)
    }

    /// Serializes `value` through the registry and sends it to one peer.
    pub fn send_typed_to_peer<V: 'static>(
        &self,
        peer: PeerId,
        type_id: u32,
        value: &V,
    ) -> Result<(), MeshlinkError> {
        let payload = self.state.registry.serialize(type_id, value)?;
        self.send_to_peer(peer, type_id, &payload)
    }

    /// Sends to every peer except `exclude`. Failures are reported, not
    /// returned: one bad peer never stops the rest.
    pub fn broadcast(&self, type_id: u32, payload: &[u8], exclude: Option<PeerId>) -> BroadcastReport {
        self.state.peers.broadcast(type_id, payload, exclude)
    }

    pub fn broadcast_typed<V: 'static>(
        &self,
        type_id: u32,
        value: &V,
        exclude: Option<PeerId>,
    ) -> Result<BroadcastReport, MeshlinkError> {
        let payload = self.state.registry.serialize(type_id, value)?;
        Ok(self.broadcast(type_id, &payload, exclude))
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Starts closing a peer. It leaves the table (and `on_disconnected`
    /// fires) once the close completes.
    pub fn kick_peer(&self, peer: PeerId) -> Result<(), MeshlinkError> {
        Ok(self.state.peers.kick(peer)?)
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.state.peers.ids()
    }

    pub fn peer_info(&self, peer: PeerId) -> Option<PeerInfo> {
        self.state.peers.info(peer)
    }

    pub fn peer_name(&self, peer: PeerId) -> Option<String> {
        self.state.peers.name_of(peer)
    }

    pub fn peer_id_by_name(&self, name: &str) -> Option<PeerId> {
        self.state.peers.find_by_name(name)
    }

    pub fn set_peer_name(&self, peer: PeerId, name: impl Into<String>) -> Result<(), MeshlinkError> {
        if self.state.peers.set_name(peer, name) {
            Ok(())
        } else {
            Err(meshlink_session::SessionError::PeerNotFound(peer).into())
        }
    }

    pub fn stats(&self) -> ServerStats {
        let counters = &self.state.counters;
        let (sent, received) = self.state.peers.traffic();
        ServerStats {
            peers: self.state.peers.len(),
            accepted: counters.accepted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            bytes_sent: sent + counters.retired_sent.load(Ordering::Relaxed),
            bytes_received: received + counters.retired_received.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    pub fn set_on_message<F>(&self, f: F)
    where
        F: Fn(PeerId, u32, Bytes) + Send + Sync + 'static,
    {
        self.state.update_callbacks(|c| c.on_message = Some(Arc::new(f)));
    }

    pub fn set_on_connected<F>(&self, f: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.state.update_callbacks(|c| c.on_connected = Some(Arc::new(f)));
    }

    pub fn set_on_disconnected<F>(&self, f: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.state.update_callbacks(|c| c.on_disconnected = Some(Arc::new(f)));
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops accepting, closes every peer, and waits for the closes to
    /// finish (bounded by linger plus a short grace). No callback fires
    /// after this returns. Calling it again is a no-op.
    pub async fn stop(&self) {
        let began = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        tracing::info!(addr = %self.local_addr, peers = self.peer_count(), "server stopping");
        self.state.accepting.store(false, Ordering::Release);
        let deadline = Instant::now() + self.state.config.linger + STOP_GRACE;
        self.close_all(deadline).await;

        self.state.stopped.store(true, Ordering::Release);
        self.phase.send_replace(Phase::Stopped);
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        // Anything admitted while the first pass ran.
        self.close_all(Instant::now() + self.state.config.linger + STOP_GRACE)
            .await;
        tracing::info!(addr = %self.local_addr, "server stopped");
    }

    async fn close_all(&self, deadline: Instant) {
        let connections = self.state.peers.drain();
        for (_, conn) in &connections {
            conn.close();
        }
        for (peer, conn) in connections {
            if tokio::time::timeout_at(deadline, conn.closed()).await.is_err() {
                tracing::warn!(%peer, "connection still open at shutdown deadline");
            }
        }
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        self.phase.send_replace(Phase::Stopped);
        if tokio::runtime::Handle::try_current().is_ok() {
            for (_, conn) in self.state.peers.drain() {
                conn.close();
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("phase", &*self.phase.borrow())
            .field("peers", &self.state.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use meshlink_protocol::{DeliveryPolicy, Route};

    use super::*;

    #[test]
    fn test_check_channels_rejects_out_of_range_route() {
        let policy = DeliveryPolicy::default().with_route(200, Route::reliable(5));
        let err = check_channels(&policy, 3).unwrap_err();
        assert!(matches!(err, TransportError::InvalidChannel { channel: 5, count: 3 }));
        assert!(check_channels(&DeliveryPolicy::default(), 3).is_ok());
    }

    #[test]
    fn test_stats_serialize_as_flat_json() {
        let stats = ServerStats {
            peers: 2,
            accepted: 3,
            rejected: 1,
            ..ServerStats::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["peers"], 2);
        assert_eq!(json["accepted"], 3);
        assert_eq!(json["rejected"], 1);
        assert_eq!(json["bytes_sent"], 0);
    }

    #[tokio::test]
    async fn test_bind_in_use_returns_error() {
        let first = ServerBuilder::new().bind("127.0.0.1:0").tcp().await.unwrap();
        let addr = first.local_addr().to_string();

        let result = ServerBuilder::new().bind(addr).tcp().await;
        assert!(matches!(
            result,
            Err(MeshlinkError::Transport(TransportError::Bind { .. }))
        ));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let server = ServerBuilder::new().bind("127.0.0.1:0").tcp().await.unwrap();
        assert!(server.is_running());
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert!(matches!(
            server.send_to_peer(PeerId(1), 10, b""),
            Err(MeshlinkError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_set_peer_name_unknown_peer_is_not_found() {
        let server = ServerBuilder::new().bind("127.0.0.1:0").tcp().await.unwrap();
        assert!(server.set_peer_name(PeerId(9), "ghost").is_err());
        assert_eq!(server.stats(), ServerStats::default());
        server.stop().await;
    }
}
