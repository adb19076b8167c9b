//! `Client` builder and connection handling.
//!
//! A client owns at most one connection at a time. Each connection gets
//! its own [`RequestCorrelator`]; inbound frames go to it first and only
//! reach the application's `on_message` when they answer nothing.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use meshlink_protocol::{Handshake, PacketType, PeerId, TypeRegistry, Welcome};
use meshlink_session::{
    Connection, ConnectionObserver, Correlation, RequestCorrelator, RequestError,
};
use meshlink_transport::{ConnectionId, Connector, TcpConnector, TransportError, UdpConnector};
#[cfg(feature = "websocket")]
use meshlink_transport::WebSocketConnector;
use tokio::time::Instant;

use crate::MeshlinkError;
use crate::config::ClientConfig;
use crate::server::check_channels;

/// Called with the type id and payload of each unsolicited message.
pub type ClientMessageHandler = Arc<dyn Fn(u32, Bytes) + Send + Sync>;

/// Called on connect and disconnect.
pub type ClientEventHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_message: Option<ClientMessageHandler>,
    on_connected: Option<ClientEventHandler>,
    on_disconnected: Option<ClientEventHandler>,
}

struct Shared {
    callbacks: RwLock<Callbacks>,
    /// Assigned by the server's welcome.
    peer_id: Mutex<Option<PeerId>>,
}

impl Shared {
    fn callbacks(&self) -> Callbacks {
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

    fn set_peer_id(&self, peer_id: Option<PeerId>) {
        *self.peer_id.lock().unwrap_or_else(PoisonError::into_inner) = peer_id;
    }
}

/// Routes one connection's frames: replies to the correlator, welcomes to
/// the peer id slot, everything else to the application.
struct ClientObserver {
    correlator: RequestCorrelator,
    shared: Weak<Shared>,
}

impl ConnectionObserver for ClientObserver {
    fn on_message(&self, _conn: ConnectionId, type_id: u32, payload: Bytes) {
        match self.correlator.try_resolve(type_id, &payload) {
            Correlation::Resolved | Correlation::Discarded => return,
            Correlation::Unmatched => {}
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if type_id == PacketType::Handshake.id() {
            match Welcome::decode(&payload) {
                Ok(welcome) => {
                    tracing::info!(peer_id = %welcome.peer_id, "welcomed by server");
                    shared.set_peer_id(Some(welcome.peer_id));
                }
                Err(e) => tracing::debug!(error = %e, "handshake reply is not a welcome"),
            }
        }

        if let Some(on_message) = shared.callbacks().on_message {
            on_message(type_id, payload);
        }
    }

    fn on_error(&self, conn: ConnectionId, error: &TransportError) {
        tracing::warn!(%conn, error = %error, "connection failed");
    }

    fn on_close(&self, conn: ConnectionId) {
        self.correlator.fail_all();
        tracing::info!(%conn, "disconnected");
        if let Some(shared) = self.shared.upgrade() {
            if let Some(on_disconnected) = shared.callbacks().on_disconnected {
                on_disconnected();
            }
        }
    }
}

/// One connection and the requests riding on it.
struct Session<T> {
    connection: Connection<T>,
    correlator: RequestCorrelator,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            correlator: self.correlator.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    registry: Option<Arc<TypeRegistry>>,
    callbacks: Callbacks,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            registry: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, Bytes) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_disconnected = Some(Arc::new(f));
        self
    }

    /// A client that dials over TCP.
    pub fn tcp(self) -> Client<TcpConnector> {
        let connector = TcpConnector::new(self.config.max_payload, self.config.connect_timeout);
        self.connector(connector)
    }

    /// A client that dials over UDP.
    ///
    /// # Errors
    /// [`TransportError::InvalidChannel`] if the delivery policy routes to
    /// a channel the datagram config doesn't have.
    pub fn udp(self) -> Result<Client<UdpConnector>, MeshlinkError> {
        check_channels(&self.config.policy, self.config.datagram.channel_count)?;
        let connector = UdpConnector::new(self.config.datagram.clone());
        Ok(self.connector(connector))
    }

    /// A client that dials `ws://host:port/`.
    #[cfg(feature = "websocket")]
    pub fn websocket(self) -> Client<WebSocketConnector> {
        let connector =
            WebSocketConnector::new(self.config.max_payload, self.config.connect_timeout);
        self.connector(connector)
    }

    /// A client over any [`Connector`].
    pub fn connector<C: Connector>(self, connector: C) -> Client<C> {
        Client {
            connector,
            registry: self.registry.unwrap_or_default(),
            config: self.config,
            shared: Arc::new(Shared {
                callbacks: RwLock::new(self.callbacks),
                peer_id: Mutex::new(None),
            }),
            session: Mutex::new(None),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The client half of the transport host.
pub struct Client<C: Connector> {
    connector: C,
    config: ClientConfig,
    registry: Arc<TypeRegistry>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session<C::Transport>>>,
}

impl<C: Connector> Client<C> {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn session(&self) -> Result<Session<C::Transport>, MeshlinkError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MeshlinkError::NotConnected)
    }

    /// Resolves `host`, connects, and opens a fresh connection. Any previous
    /// connection is closed first.
    ///
    /// # Errors
    /// Resolve and connect failures, as [`MeshlinkError::Session`] wrapping
    /// the transport error.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), MeshlinkError> {
        let correlator = RequestCorrelator::new();
        let observer = Arc::new(ClientObserver {
            correlator: correlator.clone(),
            shared: Arc::downgrade(&self.shared),
        });
        let connection = Connection::new(observer, self.config.connection());
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session {
                connection: connection.clone(),
                correlator,
            });
        if let Some(previous) = previous {
            previous.connection.close();
        }
        self.shared.set_peer_id(None);

        connection.connect(self.connector.dial(host, port)).await?;
        tracing::info!(host, port, conn = %connection.id(), "connected");

        if let Some(on_connected) = self.shared.callbacks().on_connected {
            on_connected();
        }
        Ok(())
    }

    /// Closes the connection and waits until it is closed. Pending requests
    /// fail with [`RequestError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.connection.close();
            session.connection.closed().await;
        }
        self.shared.set_peer_id(None);
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_ok_and(|s| s.connection.is_open())
    }

    /// The id the server assigned in its welcome, once it has arrived.
    pub fn peer_id(&self) -> Option<PeerId> {
        *self
            .shared
            .peer_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    pub fn send(&self, type_id: u32, payload: &[u8]) -> Result<(), MeshlinkError> {
        Ok(self.session()?.connection.send(type_id, payload)?)
    }

    pub fn send_typed<V: 'static>(&self, type_id: u32, value: &V) -> Result<(), MeshlinkError> {
        Ok(self
            .session()?
            .connection
            .send_typed(&self.registry, type_id, value)?)
    }

    /// Introduces this client to the server under `name`. The server's
    /// welcome fills in [`peer_id`](Self::peer_id).
    pub fn handshake(&self, name: &str) -> Result<(), MeshlinkError> {
        let payload = Handshake::new(name).encode()?;
        self.send(PacketType::Handshake.id(), &payload)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Sends a request and calls `callback` exactly once with the reply,
    /// a timeout, or the connection closing. `timeout` defaults to the
    /// configured request timeout.
    ///
    /// Returns the request id.
    pub fn async_request<F>(
        &self,
        request_type: u32,
        response_type: u32,
        body: &[u8],
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<u32, MeshlinkError>
    where
        F: FnOnce(Result<Bytes, RequestError>) + Send + 'static,
    {
        let session = self.session()?;
        Ok(session.correlator.async_request(
            &session.connection,
            request_type,
            response_type,
            body,
            timeout.unwrap_or(self.config.request_timeout),
            callback,
        )?)
    }

    /// Sends a request and waits for the reply.
    pub async fn request(
        &self,
        request_type: u32,
        response_type: u32,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Bytes, MeshlinkError> {
        let session = self.session()?;
        Ok(session
            .correlator
            .request(
                &session.connection,
                request_type,
                response_type,
                body,
                timeout.unwrap_or(self.config.request_timeout),
            )
            .await?)
    }

    /// Round-trip time of a `Ping` answered by `Pong`.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, MeshlinkError> {
        let started = Instant::now();
        self.request(PacketType::Ping.id(), PacketType::Pong.id(), &[], timeout)
            .await?;
        Ok(started.elapsed())
    }

    /// Requests still waiting on the current connection.
    pub fn pending_requests(&self) -> usize {
        self.session().map_or(0, |s| s.correlator.pending())
    }

    // -----------------------------------------------------------------------
    // Counters and callbacks
    // -----------------------------------------------------------------------

    /// Frame bytes written on the current connection.
    pub fn bytes_sent(&self) -> u64 {
        self.session().map_or(0, |s| s.connection.bytes_sent())
    }

    /// Frame bytes read on the current connection.
    pub fn bytes_received(&self) -> u64 {
        self.session().map_or(0, |s| s.connection.bytes_received())
    }

    pub fn set_on_message<F>(&self, f: F)
    where
        F: Fn(u32, Bytes) + Send + Sync + 'static,
    {
        self.shared.update_callbacks(|c| c.on_message = Some(Arc::new(f)));
    }

    pub fn set_on_connected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.update_callbacks(|c| c.on_connected = Some(Arc::new(f)));
    }

    pub fn set_on_disconnected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .update_callbacks(|c| c.on_disconnected = Some(Arc::new(f)));
    }
}

impl<C: Connector> Drop for Client<C> {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            if tokio::runtime::Handle::try_current().is_ok() {
                session.connection.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_connection_is_not_connected() {
        let client = ClientBuilder::new().tcp();
        assert!(!client.is_connected());
        assert!(matches!(client.send(10, b"x"), Err(MeshlinkError::NotConnected)));
        assert!(matches!(
            client.async_request(10, 11, b"", None, |_| {}),
            Err(MeshlinkError::NotConnected)
        ));
        assert_eq!(client.bytes_sent(), 0);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_propagates_error() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let client = ClientBuilder::new().tcp();
        let err = client.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, MeshlinkError::Session(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let client = ClientBuilder::new().tcp();
        client.disconnect().await;
        assert_eq!(client.peer_id(), None);
    }
}
