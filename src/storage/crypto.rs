//! AES-256-GCM encryption for the persisted token store
//!
//! The wire format is a 12-byte random nonce followed by the ciphertext
//! (GCM tag appended by the cipher). Keys are 32 bytes, configured as a
//! url-safe base64 string.

use crate::error::{BridgeError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use rand::RngCore;

/// Nonce length for AES-GCM
const NONCE_LEN: usize = 12;

/// Decode and validate a configured encryption key
///
/// Accepts url-safe base64 with or without padding; the decoded key must be
/// exactly 32 bytes.
pub fn validate_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| BridgeError::config(format!("Encryption key is not valid base64: {}", e)))?;

    if bytes.len() != 32 {
        return Err(BridgeError::config(format!(
            "Encryption key must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Encrypt plaintext with AES-256-GCM, prepending a random 12-byte nonce
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BridgeError::storage(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| BridgeError::storage(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a nonce-prefixed AES-256-GCM payload
pub fn decrypt(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(BridgeError::storage("Invalid encrypted payload format"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BridgeError::storage(format!("Failed to create cipher: {}", e)))?;

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| BridgeError::storage(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_round_trip() {
        let key = test_key();
        let plaintext = b"{\"version\":1,\"records\":[]}";
        let encrypted = encrypt(plaintext, &key).unwrap();
        assert_ne!(&encrypted[NONCE_LEN..], plaintext.as_slice());
        let decrypted = decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = test_key();
        let key2 = test_key();
        let encrypted = encrypt(b"secret payload", &key1).unwrap();
        assert!(decrypt(&encrypted, &key2).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = test_key();
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_validate_key_lengths() {
        let good = URL_SAFE_NO_PAD.encode([7u8; 32]);
        assert!(validate_key(&good).is_ok());

        let short = URL_SAFE_NO_PAD.encode([7u8; 16]);
        assert!(validate_key(&short).is_err());

        assert!(validate_key("not base64 at all!").is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let key = test_key();
        assert!(decrypt(&[0u8; 5], &key).is_err());
    }
}
