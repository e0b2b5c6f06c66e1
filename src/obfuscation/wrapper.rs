//! Pseudo TLS record wrapper
//!
//! ```text
//! 0x16 0x03 0x03 | length (u16 BE) | packet | trailing padding
//! ```

use super::ObfuscationError;

/// TLS handshake record type followed by version 1.2
pub const RECORD_MARKER: [u8; 3] = [0x16, 0x03, 0x03];

/// Marker plus length
pub const RECORD_HEADER_LEN: usize = 5;

/// Prepend the record marker and length
pub fn wrap(packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
    let len = u16::try_from(packet.len()).map_err(|_| ObfuscationError::TooLarge(packet.len()))?;

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + packet.len());
    out.extend_from_slice(&RECORD_MARKER);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(packet);
    Ok(out)
}

/// Extract exactly the declared number of bytes after the header
pub fn unwrap(wrapped: &[u8]) -> Result<&[u8], ObfuscationError> {
    if wrapped.len() < RECORD_HEADER_LEN || wrapped[..3] != RECORD_MARKER {
        return Err(ObfuscationError::MalformedWrapper);
    }

    let len = u16::from_be_bytes([wrapped[3], wrapped[4]]) as usize;
    wrapped
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len)
        .ok_or(ObfuscationError::MalformedWrapper)
}

/// First byte is the record type; raw protocol packets start with `P`
pub fn is_wrapped(datagram: &[u8]) -> bool {
    datagram.first() == Some(&RECORD_MARKER[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let wrapped = wrap(b"hello").unwrap();
        assert_eq!(wrapped, [0x16, 0x03, 0x03, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(unwrap(&wrapped).unwrap(), b"hello");
    }

    #[test]
    fn test_unwrap_ignores_padding() {
        let mut wrapped = wrap(b"data").unwrap();
        wrapped.extend_from_slice(&[0xAA; 64]);
        assert_eq!(unwrap(&wrapped).unwrap(), b"data");
    }

    #[test]
    fn test_malformed() {
        assert_eq!(unwrap(b"PHAZ1234").unwrap_err(), ObfuscationError::MalformedWrapper);
        assert_eq!(unwrap(&[0x16, 0x03]).unwrap_err(), ObfuscationError::MalformedWrapper);
        // Declared length overruns the buffer
        assert_eq!(
            unwrap(&[0x16, 0x03, 0x03, 0x00, 0x09, 1, 2]).unwrap_err(),
            ObfuscationError::MalformedWrapper
        );
    }

    #[test]
    fn test_detection() {
        assert!(is_wrapped(&wrap(b"x").unwrap()));
        assert!(!is_wrapped(b"PHAZ"));
        assert!(!is_wrapped(&[]));
    }
}
