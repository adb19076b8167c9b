//! Transport abstraction layer for Meshlink.
//!
//! Provides the [`Listener`], [`Transport`], and [`Connector`] traits that
//! abstract over different network protocols, plus three implementations:
//!
//! | Transport                  | Framing  | Delivery                          |
//! |----------------------------|----------|-----------------------------------|
//! | [`StreamTransport`] (TCP)  | streamed | reliable, ordered                 |
//! | [`DatagramTransport`] (UDP)| datagram | per-route reliable or unreliable  |
//! | [`WebSocketTransport`]     | streamed | reliable, ordered                 |
//!
//! A transport moves already-framed bytes out and hands decoded
//! [`Frame`]s back. Everything above that (queues, counters, peers) lives
//! in the session layer.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
mod link;
mod tcp;
mod udp;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use tcp::{StreamListener, StreamTransport, TcpConnector};
pub use udp::{DatagramConfig, DatagramListener, DatagramTransport, UdpConnector};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnector, WebSocketListener, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use meshlink_protocol::{Frame, Route, WireFormat};

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
///
/// The methods return `Send` futures so hosts can drive a listener from a
/// spawned task without knowing the concrete type.
pub trait Listener: Send + Sync + 'static {
    /// The transport produced for each accepted peer.
    type Transport: Transport;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;

    /// The address actually bound (useful after binding port 0).
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Stops accepting. Already accepted transports are unaffected unless
    /// the implementation shares one socket between them.
    fn shutdown(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// One established link to a remote peer.
///
/// `send_framed` and `recv_framed` may run concurrently from different
/// tasks; a transport never holds one direction's lock while waiting on
/// the other.
pub trait Transport: Send + Sync + 'static {
    /// The framing this transport expects from [`send_framed`](Self::send_framed).
    fn wire_format(&self) -> WireFormat;

    /// Writes one frame produced by [`wire_format`](Self::wire_format).
    ///
    /// Returns the number of frame bytes written. Stream transports ignore
    /// `route`; datagram transports use it to pick a channel and a
    /// reliability mode.
    fn send_framed(
        &self,
        frame: Bytes,
        route: Route,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv_framed(
        &self,
    ) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// The remote address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Establishes outbound links. Carries its own limits and timeouts.
pub trait Connector: Send + Sync + 'static {
    /// The transport produced by a successful dial.
    type Transport: Transport;

    /// Resolves `host` and connects to `port`.
    fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Resolves `host:port`, mapping failure (or an empty result) to
/// [`TransportError::Resolve`].
pub(crate) async fn resolve(
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, TransportError> {
    let resolve_err = |source| TransportError::Resolve {
        host: host.to_owned(),
        port,
        source,
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_err)?
        .collect();
    if addrs.is_empty() {
        return Err(resolve_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no addresses found",
        )));
    }
    Ok(addrs)
}
