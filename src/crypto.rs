//! # Token Cipher
//!
//! Symmetric encryption for the Redis-backed OAuth2 token cache. Every
//! instance in the fleet is constructed with the same secret, so any of
//! them can read tokens another instance refreshed.
//!
//! ## Format
//!
//! AES-256-GCM under a key derived as `SHA-256(secret)`. Each ciphertext
//! uses a fresh random 96-bit nonce, prepended to the sealed bytes; the
//! whole blob is base64-encoded for storage as a Redis hash field:
//!
//! ```text
//! base64( nonce[12] ‖ ciphertext ‖ tag[16] )
//! ```

use crate::error::{CourierError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Length of the AES-GCM nonce prefix, bytes.
const NONCE_LEN: usize = 12;

/// Process-wide symmetric cipher for cached credentials.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Derives the AES-256 key from the shared secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts a value for storage. Whitespace is trimmed first so a
    /// token pasted with a stray newline still round-trips cleanly.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.trim().as_bytes())
            .map_err(|e| CourierError::Encryption(format!("encrypt failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a stored value.
    pub fn open(&self, stored: &str) -> Result<String> {
        let blob = BASE64
            .decode(stored)
            .map_err(|e| CourierError::Encryption(format!("bad base64: {}", e)))?;
        if blob.len() < NONCE_LEN {
            return Err(CourierError::Encryption("ciphertext too short".to_string()));
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| CourierError::Encryption(format!("decrypt failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| CourierError::Encryption(format!("invalid utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = TokenCipher::new("fleet-secret");
        let sealed = cipher.seal("ya29.access-token").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), "ya29.access-token");
    }

    #[test]
    fn test_whitespace_trimmed_before_seal() {
        let cipher = TokenCipher::new("fleet-secret");
        let sealed = cipher.seal("  token-value \n").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), "token-value");
    }

    #[test]
    fn test_nonces_differ_between_seals() {
        let cipher = TokenCipher::new("fleet-secret");
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let sealed = TokenCipher::new("key-a").seal("secret").unwrap();
        assert!(TokenCipher::new("key-b").open(&sealed).is_err());
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        let cipher = TokenCipher::new("fleet-secret");
        assert!(cipher.open("not-base64!!!").is_err());
        assert!(cipher.open("AAAA").is_err());
    }
}
