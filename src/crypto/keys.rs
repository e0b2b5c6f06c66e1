//! X25519 key management

use super::{CryptoError, KEY_LEN};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

/// X25519 key pair. Fresh ephemeral pairs are generated for every handshake
/// and every rekey.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DalekPublic::from(&secret);
        Self {
            public: PublicKey(public.to_bytes()),
            private: PrivateKey(secret.to_bytes()),
        }
    }

    /// Create from existing private key bytes (derives public key)
    pub fn from_private_bytes(private_bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = DalekPublic::from(&secret);
        Self {
            public: PublicKey(public.to_bytes()),
            private: PrivateKey(private_bytes),
        }
    }
}

/// Generate an X25519 keypair as `(private, public)`
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let pair = KeyPair::generate();
    (pair.private, pair.public)
}

/// Perform the Diffie-Hellman exchange.
///
/// Low-order peer points produce an all-zero secret and are rejected.
pub fn derive_shared_secret(
    own_private: &PrivateKey,
    peer_public: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let secret = StaticSecret::from(own_private.0);
    let shared = secret.diffie_hellman(&DalekPublic::from(peer_public.0));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPeerKey);
    }
    Ok(SharedSecret(shared.to_bytes()))
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    /// Create from bytes; anything but 32 bytes is not a curve point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidPeerKey)?;
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// X25519 private key (kept secret)
#[derive(Clone)]
pub struct PrivateKey(pub(crate) [u8; KEY_LEN]);

impl PrivateKey {
    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// Raw Diffie-Hellman output, only ever fed into HKDF
pub struct SharedSecret(pub(crate) [u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

fn zeroize(bytes: &mut [u8; KEY_LEN]) {
    for byte in bytes.iter_mut() {
        unsafe {
            std::ptr::write_volatile(byte, 0);
        }
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

// Zeroize secrets on drop
impl Drop for PrivateKey {
    fn drop(&mut self) {
        zeroize(&mut self.0);
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        zeroize(&mut self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        assert_ne!(kp.public, other.public);
        assert_eq!(KeyPair::from_private_bytes(*kp.private.as_bytes()).public, kp.public);
    }

    #[test]
    fn test_dh_symmetry() {
        let (a_priv, a_pub) = generate_keypair();
        let (b_priv, b_pub) = generate_keypair();

        let ab = derive_shared_secret(&a_priv, &b_pub).unwrap();
        let ba = derive_shared_secret(&b_priv, &a_pub).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let (own, _) = generate_keypair();
        let zero = PublicKey([0u8; KEY_LEN]);
        assert_eq!(
            derive_shared_secret(&own, &zero).unwrap_err(),
            CryptoError::InvalidPeerKey
        );
    }

    #[test]
    fn test_public_key_parsing() {
        assert_eq!(
            PublicKey::from_bytes(&[1u8; 31]).unwrap_err(),
            CryptoError::InvalidPeerKey
        );

        let kp = KeyPair::generate();
        let b64 = kp.public.to_base64();
        assert_eq!(PublicKey::from_base64(&b64).unwrap(), kp.public);
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let kp = KeyPair::generate();
        assert_eq!(format!("{:?}", kp.private), "PrivateKey([REDACTED])");
    }
}
