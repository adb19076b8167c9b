use std::io;
use std::time::Duration;

use meshlink_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Name resolution failed or produced no addresses.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The remote end refused or the connect attempt failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// No connection was established within the connect timeout.
    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Accepting an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] io::Error),

    /// A frame could not be decoded (bad version, bad length, ...).
    #[error(transparent)]
    Frame(#[from] ProtocolError),

    /// A route named a channel the link does not have.
    #[error("channel {channel} out of range (link has {count})")]
    InvalidChannel { channel: u8, count: u8 },

    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The remote end stopped answering.
    #[error("peer timed out after {0:?}")]
    PeerTimedOut(Duration),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
