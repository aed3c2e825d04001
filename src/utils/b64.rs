//! URL-safe base64 JSON encoding helpers
//!
//! Used for pagination cursors and the composite OAuth state parameter.

use crate::error::{BridgeError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Serialize};

/// Encode a serializable value as url-safe base64 JSON (no padding)
pub fn encode_json_b64url<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a url-safe base64 JSON string back into a value
pub fn decode_json_b64url<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| BridgeError::validation(format!("Invalid base64url payload: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Generate an opaque url-safe token from `len` random bytes
pub fn random_token(len: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let value = json!({"tid": "abc", "cs": "client-state", "sid": "s-1"});
        let encoded = encode_json_b64url(&value).unwrap();
        let decoded: serde_json::Value = decode_json_b64url(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<serde_json::Value> = decode_json_b64url("!!not-base64!!");
        assert!(result.is_err());
    }

    #[test]
    fn test_random_token_length_and_charset() {
        let token = random_token(24);
        // 24 bytes => 32 base64url chars, no padding
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, random_token(24));
    }
}
