//! Cryptographic primitives for PhazeVPN
//!
//! This module provides:
//! - X25519 key generation and Diffie-Hellman
//! - HKDF-SHA256 session key derivation
//! - ChaCha20-Poly1305 / AES-256-GCM AEAD with a negotiated suite
//! - PBKDF2-HMAC-SHA256 password hashing
//! - HMAC-SHA256 signing
//! - Secure random number generation

mod aead;
mod kdf;
mod keys;
mod mac;
mod password;

pub use aead::{decrypt, encrypt, CipherSuite, SessionCipher};
pub use kdf::{derive_session_key, expand_key};
pub use keys::{derive_shared_secret, generate_keypair, KeyPair, PrivateKey, PublicKey, SharedSecret};
pub use mac::{hmac_sign, hmac_verify};
pub use password::{generate_password, hash_password, verify_password, PasswordHash};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Smallest valid sealed message: nonce plus tag
pub const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

/// Length of HKDF and PBKDF2 salts
pub const SALT_LEN: usize = 32;

/// HKDF info string for session keys
pub const SESSION_INFO: &[u8] = b"phazevpn-session";

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid peer public key")]
    InvalidPeerKey,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Unsupported cipher suite id: {0:#04x}")]
    UnsupportedCipher(u8),

    #[error("Unknown cipher suite: {0}")]
    UnknownCipherName(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random nonce
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce);
    nonce
}

/// Generate a fresh 32-byte salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt);
    salt
}

/// Random u32 from the secure source
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf);
    u32::from_be_bytes(buf)
}
