//! Unified error type for Meshlink.

use meshlink_protocol::{ProtocolError, RegistryError};
use meshlink_session::{RequestError, SessionError};
use meshlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Hosts return this single type; the `#[from]` conversions let `?` lift
/// sub-crate errors without ceremony.
#[derive(Debug, thiserror::Error)]
pub enum MeshlinkError {
    /// Binding, dialing, or moving bytes failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame or built-in packet was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A payload type is missing, duplicated, or failed to (de)serialize.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A connection or peer operation was rejected.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The client has no connection to send on.
    #[error("not connected")]
    NotConnected,

    /// The server has been stopped.
    #[error("server stopped")]
    Stopped,
}

impl From<RequestError> for MeshlinkError {
    fn from(e: RequestError) -> Self {
        Self::Session(SessionError::Request(e))
    }
}

impl MeshlinkError {
    /// The request error inside, if this is a timed-out or cancelled request.
    pub fn as_request(&self) -> Option<&RequestError> {
        match self {
            Self::Session(SessionError::Request(e)) => Some(e),
            _ => None,
        }
    }
}
