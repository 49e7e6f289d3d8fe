//! Gateway connect-token derivation and verification.
//!
//! Authentication proper lives in an external service; the contract here is
//! narrow: the auth service derives a per-user token from the shared gateway
//! secret and hands it to the client, and this service verifies it at
//! IDENTIFY time.

use sha2::{Digest, Sha256};

/// Derive the connect token for a user from the shared gateway secret.
pub fn connect_token(secret: &str, user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(user_id.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Verify a presented token against the derived value (constant-time compare).
pub fn verify_token(secret: &str, user_id: &str, token: &str) -> bool {
    let expected = connect_token(secret, user_id);
    if expected.len() != token.len() {
        return false;
    }
    expected
        .bytes()
        .zip(token.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
