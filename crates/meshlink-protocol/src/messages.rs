//! Payloads of the built-in packet types.
//!
//! These use a small hand-written binary layout rather than a serde codec,
//! so any client can speak them without sharing Rust types:
//!
//! ```text
//! string   = len u16 | UTF-8 bytes
//! Handshake = name: string
//! Welcome   = peer_id u64 | message: string
//! Event     = kind u16 | peer_id u64 [| name: string]   (1 = joined, 2 = left)
//! Request   = request_id u32 | body
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PeerId, ProtocolError};

const EVENT_PEER_JOINED: u16 = 1;
const EVENT_PEER_LEFT: u16 = 2;

/// Client -> server: "this is my name".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub name: String,
}

impl Handshake {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(2 + self.name.len());
        put_string(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        let name = get_string(&mut src)?;
        Ok(Self { name })
    }
}

/// Server -> client reply to a handshake, carrying the assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub peer_id: PeerId,
    pub message: String,
}

impl Welcome {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(8 + 2 + self.message.len());
        buf.put_u64_le(self.peer_id.0);
        put_string(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        let peer_id = PeerId(get_u64(&mut src)?);
        let message = get_string(&mut src)?;
        Ok(Self { peer_id, message })
    }
}

/// Peer lifecycle notifications broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerJoined { peer_id: PeerId, name: String },
    PeerLeft { peer_id: PeerId },
}

impl Event {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::PeerJoined { peer_id, name } => {
                buf.put_u16_le(EVENT_PEER_JOINED);
                buf.put_u64_le(peer_id.0);
                put_string(&mut buf, name)?;
            }
            Self::PeerLeft { peer_id } => {
                buf.put_u16_le(EVENT_PEER_LEFT);
                buf.put_u64_le(peer_id.0);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        let kind = get_u16(&mut src)?;
        let peer_id = PeerId(get_u64(&mut src)?);
        match kind {
            EVENT_PEER_JOINED => {
                let name = get_string(&mut src)?;
                Ok(Self::PeerJoined { peer_id, name })
            }
            EVENT_PEER_LEFT => Ok(Self::PeerLeft { peer_id }),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown event kind {other}"
            ))),
        }
    }

    /// The peer the event is about.
    pub fn peer_id(&self) -> PeerId {
        match self {
            Self::PeerJoined { peer_id, .. } | Self::PeerLeft { peer_id } => {
                *peer_id
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request framing
// ---------------------------------------------------------------------------

/// Prefixes `body` with a request id.
pub fn encode_request(request_id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32_le(request_id);
    buf.put_slice(body);
    buf.freeze()
}

/// Splits a request/reply payload into its id and body.
///
/// Returns `None` for payloads shorter than the 4-byte id.
pub fn split_request(payload: &Bytes) -> Option<(u32, Bytes)> {
    if payload.len() < 4 {
        return None;
    }
    let mut head = &payload[..4];
    Some((head.get_u32_le(), payload.slice(4..)))
}

// ---------------------------------------------------------------------------
// Primitive readers
// ---------------------------------------------------------------------------

fn put_string(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::InvalidMessage(format!(
            "string of {} bytes exceeds u16 length prefix",
            value.len()
        ))
    })?;
    dst.put_u16_le(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(src: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = get_u16(src)? as usize;
    ensure(src, len)?;
    let (head, rest) = src.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|e| ProtocolError::InvalidMessage(format!("invalid UTF-8: {e}")))?
        .to_owned();
    *src = rest;
    Ok(value)
}

fn get_u16(src: &mut &[u8]) -> Result<u16, ProtocolError> {
    ensure(src, 2)?;
    Ok(src.get_u16_le())
}

fn get_u64(src: &mut &[u8]) -> Result<u64, ProtocolError> {
    ensure(src, 8)?;
    Ok(src.get_u64_le())
}

fn ensure(src: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if src.len() < needed {
        return Err(ProtocolError::Truncated {
            len: src.len(),
            needed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout_is_length_prefixed() {
        let bytes = Handshake::new("Alice").encode().unwrap();
        assert_eq!(&bytes[..], b"\x05\x00Alice");
        assert_eq!(Handshake::decode(&bytes).unwrap().name, "Alice");
    }

    #[test]
    fn test_handshake_decode_truncated_name_fails() {
        let result = Handshake::decode(b"\x09\x00Ali");
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_handshake_decode_invalid_utf8_fails() {
        let result = Handshake::decode(&[2, 0, 0xFF, 0xFE]);
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_welcome_round_trip() {
        let welcome = Welcome {
            peer_id: PeerId(1),
            message: "Welcome".into(),
        };
        let bytes = welcome.encode().unwrap();
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
        assert_eq!(Welcome::decode(&bytes).unwrap(), welcome);
    }

    #[test]
    fn test_event_peer_joined_carries_name() {
        let event = Event::PeerJoined {
            peer_id: PeerId(3),
            name: "Bob".into(),
        };
        let bytes = event.encode().unwrap();
        assert_eq!(&bytes[..2], &[1, 0]);
        assert_eq!(Event::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_event_peer_left_has_no_name() {
        let event = Event::PeerLeft { peer_id: PeerId(3) };
        let bytes = event.encode().unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(Event::decode(&bytes).unwrap().peer_id(), PeerId(3));
    }

    #[test]
    fn test_event_decode_unknown_kind_fails() {
        let mut raw = vec![9, 0];
        raw.extend_from_slice(&5u64.to_le_bytes());
        assert!(matches!(
            Event::decode(&raw),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_split_request_separates_id_and_body() {
        let payload = encode_request(0xDEAD_BEEF, b"body");
        let (id, body) = split_request(&payload).unwrap();
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(&body[..], b"body");
    }

    #[test]
    fn test_split_request_short_payload_is_none() {
        assert!(split_request(&Bytes::from_static(&[1, 2, 3])).is_none());
    }
}
