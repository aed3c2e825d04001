//! PKCE S256 challenge verification (RFC 7636)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Compute the S256 challenge for a verifier: `base64url(sha256(verifier))`
pub fn compute_s256(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Verify a code verifier against a stored S256 challenge, bytewise
pub fn verify_s256(code_verifier: &str, code_challenge: &str) -> bool {
    compute_s256(code_verifier) == code_challenge
}
