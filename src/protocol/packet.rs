//! Packet encoding/decoding
//!
//! Every message is a fixed 16-byte header followed by the payload. Bytes past
//! the declared payload length are ignored on decode, which is how traffic
//! padding appended after the packet gets discarded.

use super::{ProtocolError, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client initiates handshake (server reuses it to start a rekey)
    HandshakeInit = 0x01,
    /// Server responds to handshake (client reuses it to answer a rekey)
    HandshakeResponse = 0x02,
    /// Client proves possession of the session key
    HandshakeComplete = 0x03,
    /// Encrypted tunnel data
    Data = 0x10,
    /// Keepalive
    Keepalive = 0x20,
    /// Disconnect notification
    Disconnect = 0x30,
    /// Error message
    Error = 0x40,
    /// Authentication request
    AuthRequest = 0x50,
    /// Authentication response
    AuthResponse = 0x51,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(PacketType::HandshakeInit),
            0x02 => Ok(PacketType::HandshakeResponse),
            0x03 => Ok(PacketType::HandshakeComplete),
            0x10 => Ok(PacketType::Data),
            0x20 => Ok(PacketType::Keepalive),
            0x30 => Ok(PacketType::Disconnect),
            0x40 => Ok(PacketType::Error),
            0x50 => Ok(PacketType::AuthRequest),
            0x51 => Ok(PacketType::AuthResponse),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// A protocol packet. Built fresh for every message and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Sequence counter
    pub sequence: u32,
    /// Session identifier (0 before a session exists)
    pub session_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet, rejecting oversized payloads
    pub fn new(
        packet_type: PacketType,
        session_id: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            packet_type,
            sequence,
            session_id,
            payload,
        })
    }

    /// Create a packet with an empty payload
    pub fn empty(packet_type: PacketType, session_id: u32, sequence: u32) -> Self {
        Self {
            packet_type,
            sequence,
            session_id,
            payload: Bytes::new(),
        }
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        encode(self.packet_type, self.session_id, self.sequence, &self.payload)
    }

    /// Decode packet from bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        decode(data)
    }

    /// Get the total encoded size of this packet
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The 16 header bytes as they appear on the wire
    pub fn header(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        encode_header(self.packet_type, self.session_id, self.sequence, self.payload.len())
    }
}

/// Encode only the header for a payload of `payload_len` bytes.
///
/// Sealed packets authenticate these bytes as AEAD associated data, so the
/// type, sequence and session id cannot be rewritten in transit.
pub fn encode_header(
    packet_type: PacketType,
    session_id: u32,
    sequence: u32,
    payload_len: usize,
) -> Result<[u8; HEADER_SIZE], ProtocolError> {
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    let mut header = [0u8; HEADER_SIZE];
    let mut buf = &mut header[..];
    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(packet_type as u8);
    buf.put_u32(sequence);
    buf.put_u32(session_id);
    buf.put_u16(payload_len as u16);
    Ok(header)
}

/// Encode a packet from its parts
pub fn encode(
    packet_type: PacketType,
    session_id: u32,
    sequence: u32,
    payload: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let header = encode_header(packet_type, session_id, sequence, payload.len())?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);

    Ok(buf)
}

/// Decode a packet from a datagram
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::PacketTooShort(data.len()));
    }

    let mut header = &data[..HEADER_SIZE];

    if header[..4] != MAGIC {
        return Err(ProtocolError::InvalidMagic);
    }
    header.advance(4);

    let version = header.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let packet_type = PacketType::try_from(header.get_u8())?;
    let sequence = header.get_u32();
    let session_id = header.get_u32();
    let length = header.get_u16() as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(length));
    }

    let available = data.len() - HEADER_SIZE;
    if length > available {
        return Err(ProtocolError::TruncatedPayload {
            declared: length,
            available,
        });
    }

    Ok(Packet {
        packet_type,
        sequence,
        session_id,
        payload: Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + length]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let original = Packet::new(PacketType::Data, 0xDEADBEEF, 42, &b"Hello, World!"[..]).unwrap();
        let encoded = original.encode().unwrap();

        assert_eq!(encoded.len(), HEADER_SIZE + 13);
        assert_eq!(&encoded[..4], b"PHAZ");

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode(PacketType::Keepalive, 0x01020304, 0x0A0B0C0D, &[0xFF; 3]).unwrap();

        assert_eq!(encoded[4], PROTOCOL_VERSION);
        assert_eq!(encoded[5], 0x20);
        assert_eq!(&encoded[6..10], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&encoded[10..14], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&encoded[14..16], &[0x00, 0x03]);
    }

    #[test]
    fn test_header_matches_encoding() {
        let packet = Packet::new(PacketType::Disconnect, 5, 6, &b"sealed"[..]).unwrap();
        let encoded = packet.encode().unwrap();
        assert_eq!(&packet.header().unwrap()[..], &encoded[..HEADER_SIZE]);
        assert_eq!(
            encode_header(PacketType::Data, 1, 1, MAX_PAYLOAD_SIZE + 1).unwrap_err(),
            ProtocolError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1)
        );
    }

    #[test]
    fn test_max_payload() {
        let payload = vec![0xAB; MAX_PAYLOAD_SIZE];
        let encoded = encode(PacketType::Data, 1, 1, &payload).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);

        let too_big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            encode(PacketType::Data, 1, 1, &too_big).unwrap_err(),
            ProtocolError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1)
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[0u8; 15]).unwrap_err(), ProtocolError::PacketTooShort(15));

        let mut bad_magic = encode(PacketType::Data, 1, 1, b"x").unwrap();
        bad_magic[0] = b'X';
        assert_eq!(decode(&bad_magic).unwrap_err(), ProtocolError::InvalidMagic);

        let mut bad_version = encode(PacketType::Data, 1, 1, b"x").unwrap();
        bad_version[4] = 2;
        assert_eq!(decode(&bad_version).unwrap_err(), ProtocolError::UnsupportedVersion(2));

        let mut bad_type = encode(PacketType::Data, 1, 1, b"x").unwrap();
        bad_type[5] = 0x99;
        assert_eq!(decode(&bad_type).unwrap_err(), ProtocolError::InvalidPacketType(0x99));

        let encoded = encode(PacketType::Data, 1, 1, b"hello").unwrap();
        assert_eq!(
            decode(&encoded[..encoded.len() - 2]).unwrap_err(),
            ProtocolError::TruncatedPayload { declared: 5, available: 3 }
        );
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut encoded = encode(PacketType::Data, 7, 3, b"payload").unwrap();
        encoded.extend_from_slice(&[0x55; 100]);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.payload[..], b"payload");
    }

    #[test]
    fn test_all_types_roundtrip() {
        for ty in [
            PacketType::HandshakeInit,
            PacketType::HandshakeResponse,
            PacketType::HandshakeComplete,
            PacketType::Data,
            PacketType::Keepalive,
            PacketType::Disconnect,
            PacketType::Error,
            PacketType::AuthRequest,
            PacketType::AuthResponse,
        ] {
            let decoded = decode(&encode(ty, 9, 9, &[]).unwrap()).unwrap();
            assert_eq!(decoded.packet_type, ty);
        }
    }
}
