//! # Meshlink
//!
//! Message transport and session layer for game clients and servers.
//!
//! Meshlink frames typed byte payloads over TCP, UDP, or WebSocket,
//! routes each message type reliably or unreliably, matches replies to
//! requests, and keeps the server's table of connected peers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshlink::prelude::*;
//!
//! # async fn run() -> Result<(), MeshlinkError> {
//! let server = ServerBuilder::new().bind("127.0.0.1:27015").tcp().await?;
//!
//! let client = ClientBuilder::new().tcp();
//! client.connect("127.0.0.1", server.local_addr().port()).await?;
//! client.handshake("Alice")?;
//! let rtt = client.ping(None).await?;
//! tracing::info!(?rtt, "ping");
//!
//! client.disconnect().await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod error;
pub mod logging;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientBuilder};
pub use error::MeshlinkError;
pub use server::{Server, ServerBuilder, ServerStats};

pub use meshlink_protocol as protocol;
pub use meshlink_session as session;
pub use meshlink_transport as transport;

/// Everything a typical host needs in one import.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder};
    pub use crate::config::{ClientConfig, DatagramConfig, Limits, ServerConfig, UnnamedPolicy};
    pub use crate::error::MeshlinkError;
    pub use crate::server::{Server, ServerBuilder, ServerStats};

    #[cfg(feature = "json")]
    pub use meshlink_protocol::JsonCodec;
    pub use meshlink_protocol::{
        Codec, DeliveryPolicy, Event, Handshake, PacketType, PeerId, Reliability, Route,
        TypeRegistry, Welcome,
    };
    pub use meshlink_session::{BroadcastReport, PeerInfo, RequestError, SessionError};
    pub use meshlink_transport::TransportError;
}
