//! Payload codecs: serde-driven serialization for registry bindings.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! The [`TypeRegistry`](crate::TypeRegistry) doesn't care HOW a payload is
//! serialized; [`TypeRegistry::register_codec`](crate::TypeRegistry::register_codec)
//! accepts anything that implements [`Codec`].
//!
//! Currently we provide [`JsonCodec`] (human-readable, great for debugging).
//! Hand-written binary layouts go through
//! [`TypeRegistry::register`](crate::TypeRegistry::register) instead.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// ## Trait bounds
///
/// - `Send + Sync` → registry bindings are shared by every connection
///   task, on whichever worker thread Tokio runs them.
/// - `Clone` → the registry keeps one copy for encoding and one for
///   decoding inside the binding closures.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// This is behind the `json` feature flag (enabled by default).
///
/// ## Example
///
/// ```rust
/// use meshlink_protocol::{Codec, JsonCodec, PeerId};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&PeerId(7)).unwrap();
/// assert_eq!(bytes, b"7");
///
/// let decoded: PeerId = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, PeerId(7));
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
