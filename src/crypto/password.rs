//! PBKDF2-HMAC-SHA256 password hashing

use super::{generate_salt, random_bytes, SALT_LEN};
use base64::Engine;
use ring::pbkdf2;
use std::num::NonZeroU32;

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Length of a derived password hash
pub const HASH_LEN: usize = 32;

const ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// A stored password verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub hash: [u8; HASH_LEN],
    pub salt: [u8; SALT_LEN],
}

/// Hash a password; a fresh salt is drawn when none is supplied
pub fn hash_password(password: &str, salt: Option<&[u8; SALT_LEN]>) -> PasswordHash {
    let salt = salt.copied().unwrap_or_else(generate_salt);
    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(ALGORITHM, iterations(), &salt, password.as_bytes(), &mut hash);
    PasswordHash { hash, salt }
}

/// Recompute and compare in constant time
pub fn verify_password(password: &str, hash: &[u8], salt: &[u8]) -> bool {
    pbkdf2::verify(ALGORITHM, iterations(), salt, password.as_bytes(), hash).is_ok()
}

/// Random password: 16 bytes, URL-safe base64 without padding
pub fn generate_password() -> String {
    let mut raw = [0u8; 16];
    random_bytes(&mut raw);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("correct horse", None);
        assert!(verify_password("correct horse", &stored.hash, &stored.salt));
        assert!(!verify_password("battery staple", &stored.hash, &stored.salt));
    }

    #[test]
    fn test_same_salt_same_hash() {
        let salt = [7u8; SALT_LEN];
        let a = hash_password("pw", Some(&salt));
        let b = hash_password("pw", Some(&salt));
        assert_eq!(a, b);
        assert_ne!(a.hash, hash_password("pw", None).hash);
    }

    #[test]
    fn test_generated_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.len(), 22);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(pw, generate_password());
    }
}
