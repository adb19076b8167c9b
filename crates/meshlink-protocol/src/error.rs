//! Error types for the protocol layer.
//!
//! Each crate in Meshlink defines its own error enum. This keeps errors
//! specific and meaningful: a `ProtocolError` means the bytes on the wire
//! were wrong, a `RegistryError` means the application asked the
//! [`TypeRegistry`](crate::TypeRegistry) for something it can't do.

/// Errors produced while framing, unframing, or interpreting messages.
///
/// Any of these on an inbound frame is fatal to the connection that
/// produced it, but never to the process or to other connections.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    /// The frame carries a type tag the delivery policy doesn't know.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    /// Fewer bytes than a complete header (or message body).
    #[error("truncated frame: got {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    /// The header announces a payload above the configured ceiling.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A datagram (header included) above the maximum packet size.
    #[error("packet too large ({size} bytes, max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// A message-framed transport delivered a frame whose length field
    /// disagrees with the number of bytes actually received.
    #[error("frame length mismatch: header says {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The compact datagram header only has room for a `u8` tag.
    #[error("type id {0} does not fit the compact datagram header")]
    TypeIdOutOfRange(u32),

    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is invalid at the protocol level.
    ///
    /// For logical errors in otherwise well-framed payloads, e.g. a
    /// handshake name that isn't UTF-8.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Returns `true` for errors about the shape of a frame (lengths,
    /// headers) as opposed to its meaning (version, tag, content).
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::PayloadTooLarge { .. }
                | Self::PacketTooLarge { .. }
                | Self::LengthMismatch { .. }
                | Self::TypeIdOutOfRange(_)
        )
    }
}

/// Errors from the payload [`TypeRegistry`](crate::TypeRegistry).
///
/// These are programming errors: a duplicate registration at startup or a
/// typo'd type id at a call site. They are reported, never retried.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registration reused an id that is already bound.
    #[error("type id {0} is already registered")]
    DuplicateType(u32),

    /// Nothing is registered under this id.
    #[error("type id {0} is not registered")]
    UnknownType(u32),

    /// The id is bound, but to a different Rust type.
    #[error("type id {type_id} is bound to `{registered}`, not `{requested}`")]
    TypeMismatch {
        type_id: u32,
        registered: &'static str,
        requested: &'static str,
    },

    /// The bound serialize function failed.
    #[error("encode failed for type id {type_id}")]
    Encode {
        type_id: u32,
        #[source]
        source: ProtocolError,
    },

    /// The bound deserialize function rejected the bytes.
    #[error("decode failed for type id {type_id}")]
    Decode {
        type_id: u32,
        #[source]
        source: ProtocolError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_framing_classifies_length_errors() {
        assert!(ProtocolError::Truncated { len: 2, needed: 10 }.is_framing());
        assert!(
            ProtocolError::PayloadTooLarge { size: 11, max: 10 }.is_framing()
        );
        assert!(ProtocolError::TypeIdOutOfRange(300).is_framing());
    }

    #[test]
    fn test_is_framing_rejects_semantic_errors() {
        assert!(
            !ProtocolError::VersionMismatch {
                expected: 1,
                got: 2
            }
            .is_framing()
        );
        assert!(!ProtocolError::UnknownPacketType(9).is_framing());
    }

    #[test]
    fn test_registry_error_display_names_both_types() {
        let err = RegistryError::TypeMismatch {
            type_id: 7,
            registered: "u32",
            requested: "String",
        };
        let text = err.to_string();
        assert!(text.contains("u32"));
        assert!(text.contains("String"));
    }
}
