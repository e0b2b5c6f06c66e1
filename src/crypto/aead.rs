//! AEAD encryption/decryption
//!
//! Sealed messages are laid out as `nonce(12) || ciphertext || tag(16)`. The
//! suite is negotiated once per session; decryption never retries with the
//! other suite.

use super::{generate_nonce, hmac_sign, hmac_verify, CryptoError, KEY_LEN, MIN_CIPHERTEXT_LEN, NONCE_LEN};
use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use ring::hmac;
use std::fmt;

/// AEAD cipher suites, identified on the wire by a single byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CipherSuite {
    #[default]
    ChaCha20Poly1305 = 0x01,
    Aes256Gcm = 0x02,
}

impl CipherSuite {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            0x01 => Ok(Self::ChaCha20Poly1305),
            0x02 => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnsupportedCipher(other)),
        }
    }

    /// Parse a configuration name such as `chacha20-poly1305`
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "chacha20-poly1305" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256-gcm" | "aes" => Ok(Self::Aes256Gcm),
            _ => Err(CryptoError::UnknownCipherName(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }

    fn algorithm(self) -> &'static Algorithm {
        match self {
            Self::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            Self::Aes256Gcm => &AES_256_GCM,
        }
    }

    /// Pick the preferred suite, falling back to AES-256-GCM when the
    /// preferred one cannot be initialised.
    pub fn negotiate(preferred: Self) -> Self {
        let probe = [0u8; KEY_LEN];
        if UnboundKey::new(preferred.algorithm(), &probe).is_ok() {
            preferred
        } else {
            Self::Aes256Gcm
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-session key material: the AEAD key plus an HMAC key over the same
/// secret.
pub struct SessionCipher {
    suite: CipherSuite,
    key: LessSafeKey,
    mac_key: hmac::Key,
}

impl SessionCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(suite: CipherSuite, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(suite.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            suite,
            key: LessSafeKey::new(unbound_key),
            mac_key: hmac::Key::new(hmac::HMAC_SHA256, key),
        })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Seal with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal(generate_nonce(), &[], plaintext)
    }

    /// Seal with a caller-supplied nonce, prepended to the output
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: [u8; NONCE_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        self.seal(nonce, &[], plaintext)
    }

    /// Seal with a fresh nonce, binding `aad` into the tag
    pub fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal(generate_nonce(), aad, plaintext)
    }

    /// Verify and open a sealed message
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open(sealed, &[])
    }

    /// Open a message sealed with [`encrypt_with_aad`](Self::encrypt_with_aad).
    /// Fails unless `aad` is byte-identical to what the sender bound.
    pub fn decrypt_with_aad(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open(sealed, aad)
    }

    fn seal(&self, nonce: [u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = Vec::with_capacity(MIN_CIPHERTEXT_LEN + plaintext.len());
        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad),
                &mut buffer[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption)?;
        buffer.extend_from_slice(tag.as_ref());

        Ok(buffer)
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MIN_CIPHERTEXT_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::DecryptionFailed)?;
        let mut buffer = ciphertext.to_vec();

        let plaintext_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut buffer)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .len();
        buffer.truncate(plaintext_len);

        Ok(buffer)
    }

    /// HMAC-SHA256 under the session key
    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        hmac_sign(&self.mac_key, data)
    }

    /// Constant-time HMAC check under the session key
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        hmac_verify(&self.mac_key, data, tag)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionCipher({})", self.suite)
    }
}

/// Encrypt under the default suite. `nonce` is random when `None`.
pub fn encrypt(
    session_key: &[u8; KEY_LEN],
    plaintext: &[u8],
    nonce: Option<[u8; NONCE_LEN]>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = SessionCipher::new(CipherSuite::default(), session_key)?;
    cipher.encrypt_with_nonce(plaintext, nonce.unwrap_or_else(generate_nonce))
}

/// Decrypt under the default suite
pub fn decrypt(session_key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    SessionCipher::new(CipherSuite::default(), session_key)?.decrypt(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_LEN;

    #[test]
    fn test_cipher_encrypt_decrypt() {
        for suite in [CipherSuite::ChaCha20Poly1305, CipherSuite::Aes256Gcm] {
            let cipher = SessionCipher::new(suite, &[0x42u8; KEY_LEN]).unwrap();
            let plaintext = b"Hello, World!";

            let sealed = cipher.encrypt(plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let sealed = encrypt(&[1u8; KEY_LEN], b"", None).unwrap();
        assert_eq!(sealed.len(), MIN_CIPHERTEXT_LEN);
        assert!(decrypt(&[1u8; KEY_LEN], &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_explicit_nonce_prepended() {
        let nonce = [9u8; NONCE_LEN];
        let sealed = encrypt(&[2u8; KEY_LEN], b"data", Some(nonce)).unwrap();
        assert_eq!(&sealed[..NONCE_LEN], &nonce);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&[1u8; KEY_LEN], b"secret", None).unwrap();
        assert_eq!(
            decrypt(&[2u8; KEY_LEN], &sealed).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_wrong_suite_fails() {
        let chacha = SessionCipher::new(CipherSuite::ChaCha20Poly1305, &[3u8; KEY_LEN]).unwrap();
        let aes = SessionCipher::new(CipherSuite::Aes256Gcm, &[3u8; KEY_LEN]).unwrap();
        let sealed = chacha.encrypt(b"payload").unwrap();
        assert!(aes.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = SessionCipher::new(CipherSuite::default(), &[0x42u8; KEY_LEN]).unwrap();
        let mut sealed = cipher.encrypt(b"Hello, World!").unwrap();

        // Tamper with ciphertext
        sealed[NONCE_LEN] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_associated_data_bound() {
        let cipher = SessionCipher::new(CipherSuite::Aes256Gcm, &[7u8; KEY_LEN]).unwrap();
        let sealed = cipher.encrypt_with_aad(b"payload", b"header-a").unwrap();
        assert_eq!(cipher.decrypt_with_aad(&sealed, b"header-a").unwrap(), b"payload");
        assert!(cipher.decrypt_with_aad(&sealed, b"header-b").is_err());
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_short_input_rejected() {
        let cipher = SessionCipher::new(CipherSuite::default(), &[0u8; KEY_LEN]).unwrap();
        assert_eq!(
            cipher.decrypt(&[0u8; MIN_CIPHERTEXT_LEN - 1]).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_suite_ids_and_names() {
        assert_eq!(CipherSuite::from_id(0x02).unwrap(), CipherSuite::Aes256Gcm);
        assert_eq!(
            CipherSuite::from_id(0x07).unwrap_err(),
            CryptoError::UnsupportedCipher(0x07)
        );
        assert_eq!(
            CipherSuite::from_name("ChaCha20_Poly1305").unwrap(),
            CipherSuite::ChaCha20Poly1305
        );
        assert!(CipherSuite::from_name("rot13").is_err());
        assert_eq!(
            CipherSuite::negotiate(CipherSuite::ChaCha20Poly1305),
            CipherSuite::ChaCha20Poly1305
        );
    }

    #[test]
    fn test_session_hmac() {
        let cipher = SessionCipher::new(CipherSuite::default(), &[5u8; KEY_LEN]).unwrap();
        let other = SessionCipher::new(CipherSuite::default(), &[6u8; KEY_LEN]).unwrap();
        let tag = cipher.sign(b"confirm");
        assert!(cipher.verify(b"confirm", &tag));
        assert!(!other.verify(b"confirm", &tag));
    }
}
