//! Wire protocol for Meshlink.
//!
//! This crate defines how a typed message becomes bytes and back:
//!
//! - **Registry** ([`TypeRegistry`]): numeric type id -> serializer pair,
//!   owned by the application and shared by the hosts.
//! - **Frames** ([`WireFormat`], [`StreamHeader`]): the streamed and
//!   datagram framings, with version and size validation.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): serde-backed payload
//!   serialization for registry bindings.
//! - **Types** ([`PeerId`], [`PacketType`], [`DeliveryPolicy`]) and the
//!   built-in message payloads ([`Handshake`], [`Welcome`], [`Event`]).
//!
//! # Architecture
//!
//! The protocol layer is the bottom of the stack. It knows nothing about
//! sockets or peers; transports use it to frame, sessions use it to route.
//!
//! ```text
//! Protocol (frames, types) -> Transport (bytes on a socket)
//!                          -> Session (connections, peers, requests)
//! ```

mod codec;
mod error;
mod frame;
mod messages;
mod registry;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{ProtocolError, RegistryError};
pub use frame::{
    DATAGRAM_HEADER_LEN, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_PAYLOAD, Frame,
    PROTOCOL_VERSION, STREAM_HEADER_LEN, StreamHeader, WireFormat,
    decode_datagram, decode_stream_message, encode_datagram, encode_stream,
};
pub use messages::{Event, Handshake, Welcome, encode_request, split_request};
pub use registry::TypeRegistry;
pub use types::{
    DEFAULT_CHANNEL_COUNT, DeliveryPolicy, PacketType, PeerId, Reliability,
    Route,
};
