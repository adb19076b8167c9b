//! Host configuration.
//!
//! Plain structs with sensible defaults and chainable setters:
//!
//! ```rust
//! use std::time::Duration;
//! use meshlink::config::{ServerConfig, UnnamedPolicy};
//!
//! let config = ServerConfig::default()
//!     .bind("127.0.0.1:0")
//!     .max_peers(8)
//!     .handshake_timeout(Duration::from_secs(2))
//!     .unnamed_policy(UnnamedPolicy::Disconnect);
//! assert_eq!(config.limits.max_peers, 8);
//! ```

use std::sync::Arc;
use std::time::Duration;

use meshlink_protocol::{DEFAULT_MAX_PAYLOAD, DeliveryPolicy};
use meshlink_session::ConnectionConfig;

pub use meshlink_transport::DatagramConfig;

/// Address a server binds when none is given.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:27015";

/// Size and population ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest payload a streamed transport (TCP, WebSocket) accepts.
    pub max_payload: usize,
    /// Connections beyond this are closed right after accept.
    pub max_peers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_peers: 32,
        }
    }
}

/// What the server does with application messages from a peer that
/// hasn't completed the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnnamedPolicy {
    /// Ignore the message and keep the connection.
    #[default]
    Drop,
    /// Close the connection.
    Disconnect,
}

/// Settings for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub limits: Limits,
    /// Peers that haven't handshaken within this window are kicked.
    pub handshake_timeout: Option<Duration>,
    /// How long a closing connection may spend flushing its queue.
    pub linger: Duration,
    /// Re-broadcast routable application messages to every other peer.
    pub relay: bool,
    /// Answer `Ping` with `Pong` automatically.
    pub auto_pong: bool,
    pub unnamed_policy: UnnamedPolicy,
    pub policy: Arc<DeliveryPolicy>,
    /// UDP tuning, used by [`ServerBuilder::udp`](crate::ServerBuilder::udp).
    pub datagram: DatagramConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_owned(),
            limits: Limits::default(),
            handshake_timeout: None,
            linger: Duration::from_secs(1),
            relay: false,
            auto_pong: true,
            unnamed_policy: UnnamedPolicy::default(),
            policy: Arc::new(DeliveryPolicy::default()),
            datagram: DatagramConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.limits.max_peers = max_peers;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.limits.max_payload = max_payload;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn auto_pong(mut self, auto_pong: bool) -> Self {
        self.auto_pong = auto_pong;
        self
    }

    pub fn unnamed_policy(mut self, policy: UnnamedPolicy) -> Self {
        self.unnamed_policy = policy;
        self
    }

    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn datagram(mut self, datagram: DatagramConfig) -> Self {
        self.datagram = datagram;
        self
    }

    pub(crate) fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            policy: Arc::clone(&self.policy),
            linger: self.linger,
        }
    }
}

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Used by requests that don't name their own timeout.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub linger: Duration,
    pub max_payload: usize,
    pub policy: Arc<DeliveryPolicy>,
    pub datagram: DatagramConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            linger: Duration::from_secs(1),
            max_payload: DEFAULT_MAX_PAYLOAD,
            policy: Arc::new(DeliveryPolicy::default()),
            datagram: DatagramConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn datagram(mut self, datagram: DatagramConfig) -> Self {
        self.datagram = datagram;
        self
    }

    pub(crate) fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            policy: Arc::clone(&self.policy),
            linger: self.linger,
        }
    }
}
