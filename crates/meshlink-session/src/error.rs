//! Error types for the session layer.

use meshlink_protocol::{PeerId, ProtocolError, RegistryError};
use meshlink_transport::{ConnectionId, TransportError};

use crate::ConnectionState;

/// Errors from connections, the peer table, and request correlation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No peer with this id is connected.
    /// Ids are never reused, so a stale id always lands here.
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    /// The connection isn't accepting sends (not yet open, or closing).
    #[error("{id} is not open (state: {state:?})")]
    NotOpen {
        id: ConnectionId,
        state: ConnectionState,
    },

    /// The message couldn't be framed or its type isn't routable.
    #[error(transparent)]
    Frame(#[from] ProtocolError),

    /// The payload couldn't be serialized through the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A request resolved without a reply.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Why a request finished without a reply.
///
/// Exactly one of reply, timeout, or close resolves each request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No reply arrived before the timeout.
    #[error("request {request_id} timed out")]
    TimedOut { request_id: u32 },

    /// The connection closed while the request was pending.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
}
