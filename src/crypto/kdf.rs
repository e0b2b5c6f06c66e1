//! Session key derivation (HKDF-SHA256 over the X25519 shared secret)

use super::{generate_salt, CryptoError, SharedSecret, KEY_LEN, SALT_LEN};
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};

/// Output length marker for ring's HKDF
struct SessionKeyLen;

impl KeyType for SessionKeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Extract-then-expand `ikm` into one 256-bit key bound to `info`.
pub fn expand_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(ikm);
    let mut key = [0u8; KEY_LEN];
    prk.expand(&[info], SessionKeyLen)
        .and_then(|okm| okm.fill(&mut key))
        .map_err(|_| CryptoError::KeyGeneration("session key expansion failed".to_string()))?;
    Ok(key)
}

/// Expand a shared secret into a session key.
///
/// The server passes `None` and gets a fresh salt back, which travels in the
/// handshake response. The client passes that salt to arrive at the same key.
pub fn derive_session_key(
    shared_secret: &SharedSecret,
    salt: Option<&[u8; SALT_LEN]>,
    info: &[u8],
) -> Result<([u8; KEY_LEN], [u8; SALT_LEN]), CryptoError> {
    let salt = salt.copied().unwrap_or_else(generate_salt);
    let key = expand_key(&salt, shared_secret.as_bytes(), info)?;
    Ok((key, salt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_shared_secret, generate_keypair, SESSION_INFO};

    #[test]
    fn test_info_separates_keys() {
        let salt = [9u8; SALT_LEN];
        let session = expand_key(&salt, b"shared", SESSION_INFO).unwrap();
        let other = expand_key(&salt, b"shared", b"phazevpn-other").unwrap();
        assert_ne!(session, other);
        assert_eq!(session, expand_key(&salt, b"shared", SESSION_INFO).unwrap());
    }

    #[test]
    fn test_session_key_agreement() {
        let (a_priv, a_pub) = generate_keypair();
        let (b_priv, b_pub) = generate_keypair();
        let a_shared = derive_shared_secret(&a_priv, &b_pub).unwrap();
        let b_shared = derive_shared_secret(&b_priv, &a_pub).unwrap();

        let (a_key, salt) = derive_session_key(&a_shared, None, SESSION_INFO).unwrap();
        let (b_key, b_salt) = derive_session_key(&b_shared, Some(&salt), SESSION_INFO).unwrap();

        assert_eq!(a_key, b_key);
        assert_eq!(salt, b_salt);
    }

    #[test]
    fn test_fresh_salt_changes_key() {
        let (a_priv, _) = generate_keypair();
        let (_, b_pub) = generate_keypair();
        let shared = derive_shared_secret(&a_priv, &b_pub).unwrap();

        let (k1, s1) = derive_session_key(&shared, None, SESSION_INFO).unwrap();
        let (k2, s2) = derive_session_key(&shared, None, SESSION_INFO).unwrap();
        assert_ne!(s1, s2);
        assert_ne!(k1, k2);
    }
}
