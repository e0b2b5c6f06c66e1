//! HMAC-SHA256 helpers

use ring::hmac;

/// Sign `data`, returning the 32-byte tag
pub fn hmac_sign(key: &hmac::Key, data: &[u8]) -> [u8; 32] {
    let tag = hmac::sign(key, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Constant-time tag verification
pub fn hmac_verify(key: &hmac::Key, data: &[u8], tag: &[u8]) -> bool {
    hmac::verify(key, data, tag).is_ok()
}
