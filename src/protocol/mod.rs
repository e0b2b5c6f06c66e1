//! Protocol definitions and constants
//!
//! Wire format of a PhazeVPN datagram:
//! ```text
//! offset 0:  magic       4 bytes  "PHAZ"
//! offset 4:  version     1 byte   0x01
//! offset 5:  type        1 byte
//! offset 6:  sequence    4 bytes  big-endian
//! offset 10: session_id  4 bytes  big-endian
//! offset 14: length      2 bytes  big-endian
//! offset 16: payload     <length> bytes
//! ```

mod handshake;
mod packet;

pub use handshake::{HandshakeComplete, HandshakeMessage, HandshakeResponse, RekeyMessage};
pub use packet::{encode_header, Packet, PacketType};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Truncated payload: declared {declared}, available {available}")]
    TruncatedPayload { declared: usize, available: usize },

    #[error("Truncated handshake field: {0}")]
    TruncatedField(&'static str),

    #[error("Invalid public key length: {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid UTF-8 in field: {0}")]
    InvalidUtf8(&'static str),

    #[error("Field too long: {0}")]
    FieldTooLong(&'static str),
}

/// Magic bytes at the start of every packet
pub const MAGIC: [u8; 4] = *b"PHAZ";

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (16 KB)
pub const MAX_PAYLOAD_SIZE: usize = 16384;

/// Session id carried by packets that belong to no session yet
pub const NO_SESSION: u32 = 0;

/// Mode name assumed when a handshake omits the field
pub const DEFAULT_MODE_NAME: &str = "normal";

/// Default UDP port
pub const DEFAULT_PORT: u16 = 51820;
