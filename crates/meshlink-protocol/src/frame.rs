//! Wire codec: how a `(type_id, payload)` pair becomes bytes and back.
//!
//! There are two framings, picked by the transport:
//!
//! - **Streamed** (TCP, WebSocket): a fixed 10-byte header carrying the
//!   payload length, so a byte stream can be cut back into messages.
//! - **Datagram** (UDP): a compact 3-byte header. The datagram itself
//!   delivers message boundaries, so no length field is needed.
//!
//! ```text
//! Streamed:  ┌──────────────┬──────────────┬──────────────────┬─────────┐
//!            │ version u16  │ type_id u32  │ payload_len u32  │ payload │
//!            └──────────────┴──────────────┴──────────────────┴─────────┘
//! Datagram:  ┌──────────────┬──────────────┬─────────────────────────────┐
//!            │ version u16  │ type u8      │ payload (rest of datagram)  │
//!            └──────────────┴──────────────┴─────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// The protocol version every frame must carry.
pub const PROTOCOL_VERSION: u16 = 1;

/// Streamed header: version (2) + type id (4) + payload length (4).
pub const STREAM_HEADER_LEN: usize = 10;

/// Datagram header: version (2) + packet type (1).
pub const DATAGRAM_HEADER_LEN: usize = 3;

/// Default payload ceiling for streamed transports: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 10 * 1024 * 1024;

/// Default datagram ceiling, header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 5000;

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Application (or built-in) type tag.
    pub type_id: u32,
    /// The opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(type_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Streamed framing
// ---------------------------------------------------------------------------

/// The fixed-size header in front of every streamed payload.
///
/// Reading a streamed frame is two-phase: read exactly
/// [`STREAM_HEADER_LEN`] bytes, [`decode`](Self::decode) them (which also
/// validates version and length), then read exactly `payload_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u16,
    pub type_id: u32,
    pub payload_len: u32,
}

impl StreamHeader {
    /// Builds a header for a payload of `payload_len` bytes.
    pub fn new(type_id: u32, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            type_id,
            payload_len,
        }
    }

    /// Appends the header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.version);
        dst.put_u32_le(self.type_id);
        dst.put_u32_le(self.payload_len);
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    /// - [`ProtocolError::VersionMismatch`] if the version isn't ours.
    /// - [`ProtocolError::PayloadTooLarge`] if `payload_len > max_payload`.
    pub fn decode(
        src: &[u8; STREAM_HEADER_LEN],
        max_payload: usize,
    ) -> Result<Self, ProtocolError> {
        let mut buf = &src[..];
        let header = Self {
            version: buf.get_u16_le(),
            type_id: buf.get_u32_le(),
            payload_len: buf.get_u32_le(),
        };

        check_version(header.version)?;
        if header.payload_len as usize > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: header.payload_len as usize,
                max: max_payload,
            });
        }
        Ok(header)
    }
}

/// Encodes a streamed frame (header + payload) into `dst`.
///
/// # Errors
/// Returns [`ProtocolError::PayloadTooLarge`] when the payload exceeds
/// `max_payload`; nothing is written in that case.
pub fn encode_stream(
    type_id: u32,
    payload: &[u8],
    max_payload: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let max = max_payload.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    dst.reserve(STREAM_HEADER_LEN + payload.len());
    StreamHeader::new(type_id, payload.len() as u32).encode(dst);
    dst.put_slice(payload);
    Ok(())
}

/// Decodes a streamed frame that arrived as one complete message.
///
/// Used by message-oriented transports (WebSocket) that carry the
/// streamed header inside each message.
pub fn decode_stream_message(
    mut src: Bytes,
    max_payload: usize,
) -> Result<Frame, ProtocolError> {
    if src.len() < STREAM_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            len: src.len(),
            needed: STREAM_HEADER_LEN,
        });
    }

    let mut raw = [0u8; STREAM_HEADER_LEN];
    raw.copy_from_slice(&src[..STREAM_HEADER_LEN]);
    let header = StreamHeader::decode(&raw, max_payload)?;

    src.advance(STREAM_HEADER_LEN);
    if src.len() != header.payload_len as usize {
        return Err(ProtocolError::LengthMismatch {
            declared: header.payload_len as usize,
            actual: src.len(),
        });
    }

    Ok(Frame {
        type_id: header.type_id,
        payload: src,
    })
}

// ---------------------------------------------------------------------------
// Datagram framing
// ---------------------------------------------------------------------------

/// Encodes a compact datagram frame into `dst`.
///
/// Oversized datagrams are rejected here, before anything reaches the
/// socket.
pub fn encode_datagram(
    type_id: u32,
    payload: &[u8],
    max_packet: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let tag =
        u8::try_from(type_id).map_err(|_| ProtocolError::TypeIdOutOfRange(type_id))?;
    let total = DATAGRAM_HEADER_LEN + payload.len();
    if total > max_packet {
        return Err(ProtocolError::PacketTooLarge {
            size: total,
            max: max_packet,
        });
    }
    dst.reserve(total);
    dst.put_u16_le(PROTOCOL_VERSION);
    dst.put_u8(tag);
    dst.put_slice(payload);
    Ok(())
}

/// Decodes one datagram.
pub fn decode_datagram(
    mut src: Bytes,
    max_packet: usize,
) -> Result<Frame, ProtocolError> {
    if src.len() > max_packet {
        return Err(ProtocolError::PacketTooLarge {
            size: src.len(),
            max: max_packet,
        });
    }
    if src.len() < DATAGRAM_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            len: src.len(),
            needed: DATAGRAM_HEADER_LEN,
        });
    }

    check_version(src.get_u16_le())?;
    let tag = src.get_u8();
    Ok(Frame {
        type_id: u32::from(tag),
        payload: src,
    })
}

fn check_version(got: u16) -> Result<(), ProtocolError> {
    if got != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WireFormat
// ---------------------------------------------------------------------------

/// Which framing a transport speaks, with its size ceiling.
///
/// Transports report their format; the connection layer uses it to frame
/// outbound messages at send time, so oversize messages fail synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Length-prefixed frames.
    Streamed { max_payload: usize },
    /// One frame per datagram.
    Datagram { max_packet: usize },
}

impl WireFormat {
    /// Streamed framing with the default payload ceiling.
    pub fn streamed() -> Self {
        Self::Streamed {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Datagram framing with the default packet ceiling.
    pub fn datagram() -> Self {
        Self::Datagram {
            max_packet: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Size of the header this format puts in front of every payload.
    pub fn header_len(&self) -> usize {
        match self {
            Self::Streamed { .. } => STREAM_HEADER_LEN,
            Self::Datagram { .. } => DATAGRAM_HEADER_LEN,
        }
    }

    /// Total bytes on the wire for a payload of `payload_len` bytes.
    pub fn wire_len(&self, payload_len: usize) -> usize {
        self.header_len() + payload_len
    }

    /// Frames a message into a fresh buffer.
    pub fn encode(
        &self,
        type_id: u32,
        payload: &[u8],
    ) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.wire_len(payload.len()));
        match *self {
            Self::Streamed { max_payload } => {
                encode_stream(type_id, payload, max_payload, &mut buf)?
            }
            Self::Datagram { max_packet } => {
                encode_datagram(type_id, payload, max_packet, &mut buf)?
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes a frame delivered as one whole message.
    pub fn decode(&self, message: Bytes) -> Result<Frame, ProtocolError> {
        match *self {
            Self::Streamed { max_payload } => {
                decode_stream_message(message, max_payload)
            }
            Self::Datagram { max_packet } => {
                decode_datagram(message, max_packet)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_MAX: usize = 1024;

    fn stream_round_trip(payload: &[u8]) -> Frame {
        let format = WireFormat::Streamed {
            max_payload: SMALL_MAX,
        };
        let bytes = format.encode(42, payload).expect("encode");
        assert_eq!(bytes.len(), STREAM_HEADER_LEN + payload.len());
        format.decode(bytes).expect("decode")
    }

    // =====================================================================
    // Streamed
    // =====================================================================

    #[test]
    fn test_stream_frame_empty_payload_round_trips() {
        let frame = stream_round_trip(b"");
        assert_eq!(frame.type_id, 42);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_stream_frame_one_byte_round_trips() {
        let frame = stream_round_trip(&[7]);
        assert_eq!(frame.payload.as_ref(), &[7]);
    }

    #[test]
    fn test_stream_frame_at_max_payload_round_trips() {
        let payload = vec![0xAB; SMALL_MAX];
        let frame = stream_round_trip(&payload);
        assert_eq!(frame.payload.len(), SMALL_MAX);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_stream_frame_over_max_payload_rejected() {
        let format = WireFormat::Streamed {
            max_payload: SMALL_MAX,
        };
        let result = format.encode(1, &vec![0; SMALL_MAX + 1]);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size, max })
                if size == SMALL_MAX + 1 && max == SMALL_MAX
        ));
    }

    #[test]
    fn test_stream_header_decode_rejects_announced_oversize() {
        // A hostile header can claim any length; it must be rejected
        // before anyone allocates a buffer for it.
        let mut buf = BytesMut::new();
        StreamHeader::new(1, (SMALL_MAX + 1) as u32).encode(&mut buf);
        let mut raw = [0u8; STREAM_HEADER_LEN];
        raw.copy_from_slice(&buf);

        let result = StreamHeader::decode(&raw, SMALL_MAX);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_stream_header_decode_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        StreamHeader {
            version: PROTOCOL_VERSION + 1,
            type_id: 1,
            payload_len: 0,
        }
        .encode(&mut buf);
        let mut raw = [0u8; STREAM_HEADER_LEN];
        raw.copy_from_slice(&buf);

        let result = StreamHeader::decode(&raw, SMALL_MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { got, .. }) if got == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn test_stream_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        StreamHeader::new(0x0403_0201, 5).encode(&mut buf);
        assert_eq!(&buf[..], &[1, 0, 1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_decode_stream_message_truncated_header() {
        let result =
            decode_stream_message(Bytes::from_static(&[1, 0, 9]), SMALL_MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated { len: 3, needed: STREAM_HEADER_LEN })
        ));
    }

    #[test]
    fn test_decode_stream_message_length_mismatch() {
        let mut buf = BytesMut::new();
        encode_stream(3, b"hello", SMALL_MAX, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        let result = decode_stream_message(buf.freeze(), SMALL_MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::LengthMismatch { declared: 5, actual: 4 })
        ));
    }

    // =====================================================================
    // Datagram
    // =====================================================================

    #[test]
    fn test_datagram_round_trip() {
        let format = WireFormat::Datagram { max_packet: 64 };
        let bytes = format.encode(4, b"ping").unwrap();
        assert_eq!(bytes.len(), DATAGRAM_HEADER_LEN + 4);

        let frame = format.decode(bytes).unwrap();
        assert_eq!(frame, Frame::new(4, Bytes::from_static(b"ping")));
    }

    #[test]
    fn test_datagram_exactly_max_packet_accepted() {
        let format = WireFormat::Datagram { max_packet: 16 };
        let payload = vec![1; 16 - DATAGRAM_HEADER_LEN];
        assert!(format.encode(1, &payload).is_ok());
    }

    #[test]
    fn test_datagram_oversize_rejected_before_send() {
        let format = WireFormat::Datagram { max_packet: 16 };
        let payload = vec![1; 16 - DATAGRAM_HEADER_LEN + 1];
        assert!(matches!(
            format.encode(1, &payload),
            Err(ProtocolError::PacketTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_datagram_type_id_must_fit_u8() {
        let format = WireFormat::datagram();
        assert!(matches!(
            format.encode(256, b""),
            Err(ProtocolError::TypeIdOutOfRange(256))
        ));
    }

    #[test]
    fn test_datagram_decode_short_packet() {
        let result = decode_datagram(Bytes::from_static(&[1, 0]), 64);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_datagram_decode_wrong_version() {
        let result = decode_datagram(Bytes::from_static(&[9, 0, 1]), 64);
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { got: 9, .. })
        ));
    }

    #[test]
    fn test_wire_len_counts_header() {
        assert_eq!(WireFormat::streamed().wire_len(5), 15);
        assert_eq!(WireFormat::datagram().wire_len(5), 8);
    }
}
