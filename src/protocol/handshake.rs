//! Handshake payload codecs
//!
//! All variable fields are prefixed with a 2-byte big-endian length.

use super::{ProtocolError, DEFAULT_MODE_NAME};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Handshake salt length
pub const SALT_LEN: usize = 32;

/// HMAC-SHA256 output length
pub const MAC_LEN: usize = 32;

fn put_field(buf: &mut BytesMut, name: &'static str, field: &[u8]) -> Result<(), ProtocolError> {
    if field.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong(name));
    }
    buf.put_u16(field.len() as u16);
    buf.put_slice(field);
    Ok(())
}

fn get_field<'a>(data: &mut &'a [u8], name: &'static str) -> Result<&'a [u8], ProtocolError> {
    if data.remaining() < 2 {
        return Err(ProtocolError::TruncatedField(name));
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(ProtocolError::TruncatedField(name));
    }
    let slice: &'a [u8] = *data;
    let (field, rest) = slice.split_at(len);
    *data = rest;
    Ok(field)
}

/// Like `get_field` but yields `None` when the payload ends before the field
fn get_optional_field<'a>(
    data: &mut &'a [u8],
    name: &'static str,
) -> Result<Option<&'a [u8]>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    get_field(data, name).map(Some)
}

fn get_key(data: &mut &[u8]) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    let field = get_field(data, "public_key")?;
    field
        .try_into()
        .map_err(|_| ProtocolError::InvalidKeyLength(field.len()))
}

fn get_string(data: &mut &[u8], name: &'static str) -> Result<Option<String>, ProtocolError> {
    match get_optional_field(data, name)? {
        None => Ok(None),
        Some(field) => std::str::from_utf8(field)
            .map(|s| Some(s.to_string()))
            .map_err(|_| ProtocolError::InvalidUtf8(name)),
    }
}

/// HANDSHAKE_INIT payload sent by a connecting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub username: Option<String>,
    pub password_hash: Option<Vec<u8>>,
    pub mode: String,
}

impl HandshakeMessage {
    pub fn new(public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self {
            public_key,
            username: None,
            password_hash: None,
            mode: DEFAULT_MODE_NAME.to_string(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password_hash(mut self, hash: Vec<u8>) -> Self {
        self.password_hash = Some(hash);
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "public_key", &self.public_key)?;
        put_field(
            &mut buf,
            "username",
            self.username.as_deref().unwrap_or_default().as_bytes(),
        )?;
        put_field(
            &mut buf,
            "password_hash",
            self.password_hash.as_deref().unwrap_or_default(),
        )?;
        put_field(&mut buf, "vpn_mode", self.mode.as_bytes())?;
        Ok(buf.freeze())
    }

    /// Decode an INIT payload. Trailing optional fields may be missing
    /// entirely; a missing mode reads as "normal".
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let public_key = get_key(&mut data)?;
        let username = get_string(&mut data, "username")?.filter(|u| !u.is_empty());
        let password_hash = get_optional_field(&mut data, "password_hash")?
            .filter(|h| !h.is_empty())
            .map(|h| h.to_vec());
        let mode = get_string(&mut data, "vpn_mode")?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODE_NAME.to_string());

        Ok(Self {
            public_key,
            username,
            password_hash,
            mode,
        })
    }
}

/// HANDSHAKE_RESPONSE payload sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: [u8; SALT_LEN],
    pub cipher_id: u8,
    /// Mode the server actually applied
    pub mode: String,
    /// Tunnel address assigned to the client, if the server runs a pool
    pub vpn_address: Option<Ipv4Addr>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "public_key", &self.public_key)?;
        put_field(&mut buf, "salt", &self.salt)?;
        buf.put_u8(self.cipher_id);
        put_field(&mut buf, "vpn_mode", self.mode.as_bytes())?;
        if let Some(addr) = self.vpn_address {
            put_field(&mut buf, "vpn_address", &addr.octets())?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let public_key = get_key(&mut data)?;
        let salt = get_field(&mut data, "salt")?
            .try_into()
            .map_err(|_| ProtocolError::TruncatedField("salt"))?;
        if !data.has_remaining() {
            return Err(ProtocolError::TruncatedField("cipher_id"));
        }
        let cipher_id = data.get_u8();
        let mode = get_string(&mut data, "vpn_mode")?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODE_NAME.to_string());
        let vpn_address = match get_optional_field(&mut data, "vpn_address")? {
            None => None,
            Some(octets) => {
                let octets: [u8; 4] = octets
                    .try_into()
                    .map_err(|_| ProtocolError::TruncatedField("vpn_address"))?;
                Some(Ipv4Addr::from(octets))
            }
        };

        Ok(Self {
            public_key,
            salt,
            cipher_id,
            mode,
            vpn_address,
        })
    }
}

/// HANDSHAKE_COMPLETE payload: key confirmation plus optional credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub confirm: [u8; MAC_LEN],
    /// AEAD-sealed password, empty when the client has none
    pub credential: Vec<u8>,
}

impl HandshakeComplete {
    /// Context string bound into the confirmation MAC
    pub const CONTEXT: &'static [u8] = b"phazevpn-handshake-complete";

    /// Bytes covered by the confirmation MAC for a session
    pub fn confirm_input(session_id: u32) -> Vec<u8> {
        let mut input = Self::CONTEXT.to_vec();
        input.extend_from_slice(&session_id.to_be_bytes());
        input
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "confirm", &self.confirm)?;
        put_field(&mut buf, "credential", &self.credential)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let confirm = get_field(&mut data, "confirm")?
            .try_into()
            .map_err(|_| ProtocolError::TruncatedField("confirm"))?;
        let credential = get_optional_field(&mut data, "credential")?
            .map(|c| c.to_vec())
            .unwrap_or_default();
        Ok(Self {
            confirm,
            credential,
        })
    }
}

/// In-band rekey message, authenticated under the key being replaced.
///
/// The server sends it inside HANDSHAKE_INIT with a fresh salt; the client
/// answers inside HANDSHAKE_RESPONSE with an empty salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyMessage {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl RekeyMessage {
    /// Bytes covered by `mac`
    pub fn signed_input(public_key: &[u8], salt: &[u8], session_id: u32) -> Vec<u8> {
        let mut input = Vec::with_capacity(public_key.len() + salt.len() + 4);
        input.extend_from_slice(public_key);
        input.extend_from_slice(salt);
        input.extend_from_slice(&session_id.to_be_bytes());
        input
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "public_key", &self.public_key)?;
        put_field(&mut buf, "salt", &self.salt)?;
        put_field(&mut buf, "mac", &self.mac)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let public_key = get_key(&mut data)?;
        let salt = get_field(&mut data, "salt")?.to_vec();
        let mac = get_field(&mut data, "mac")?
            .try_into()
            .map_err(|_| ProtocolError::TruncatedField("mac"))?;
        Ok(Self {
            public_key,
            salt,
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_message_roundtrip() {
        let msg = HandshakeMessage::new([7u8; 32])
            .with_username("alice")
            .with_password_hash(vec![1, 2, 3])
            .with_mode("semi_ghost");

        let decoded = HandshakeMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_missing_mode_defaults_to_normal() {
        // Older clients stop after the password hash
        let mut buf = BytesMut::new();
        put_field(&mut buf, "public_key", &[9u8; 32]).unwrap();
        put_field(&mut buf, "username", b"").unwrap();
        put_field(&mut buf, "password_hash", b"").unwrap();

        let decoded = HandshakeMessage::decode(&buf).unwrap();
        assert_eq!(decoded.mode, "normal");
        assert!(decoded.username.is_none());
        assert!(decoded.password_hash.is_none());

        let key_only = HandshakeMessage::decode(&buf[..34]).unwrap();
        assert_eq!(key_only.mode, "normal");
    }

    #[test]
    fn test_bad_key_length() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "public_key", &[1u8; 31]).unwrap();
        assert_eq!(
            HandshakeMessage::decode(&buf).unwrap_err(),
            ProtocolError::InvalidKeyLength(31)
        );
    }

    #[test]
    fn test_truncated_field() {
        let msg = HandshakeMessage::new([3u8; 32]).with_username("bob");
        let encoded = msg.encode().unwrap();
        // Cut inside the username field
        assert_eq!(
            HandshakeMessage::decode(&encoded[..36]).unwrap_err(),
            ProtocolError::TruncatedField("username")
        );
        assert!(HandshakeMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let response = HandshakeResponse {
            public_key: [4u8; 32],
            salt: [5u8; 32],
            cipher_id: 2,
            mode: "full_ghost".into(),
            vpn_address: None,
        };
        let decoded = HandshakeResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);

        let addressed = HandshakeResponse {
            vpn_address: Some(Ipv4Addr::new(10, 9, 0, 2)),
            ..response
        };
        let decoded = HandshakeResponse::decode(&addressed.encode().unwrap()).unwrap();
        assert_eq!(decoded.vpn_address, Some(Ipv4Addr::new(10, 9, 0, 2)));
    }

    #[test]
    fn test_complete_without_credential() {
        let complete = HandshakeComplete {
            confirm: [8u8; 32],
            credential: Vec::new(),
        };
        let decoded = HandshakeComplete::decode(&complete.encode().unwrap()).unwrap();
        assert_eq!(decoded, complete);
        assert!(HandshakeComplete::decode(&[0, 32, 1, 2]).is_err());
    }

    #[test]
    fn test_rekey_roundtrip() {
        let rekey = RekeyMessage {
            public_key: [6u8; 32],
            salt: Vec::new(),
            mac: [1u8; 32],
        };
        let decoded = RekeyMessage::decode(&rekey.encode().unwrap()).unwrap();
        assert_eq!(decoded, rekey);

        let a = RekeyMessage::signed_input(&[1; 32], &[2; 32], 5);
        let b = RekeyMessage::signed_input(&[1; 32], &[2; 32], 6);
        assert_ne!(a, b);
    }
}
