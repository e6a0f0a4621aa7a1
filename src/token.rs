//! Token generation, HMAC hashing, and constant-time validation
//!
//! ## Overview
//! - Generate long-lived node and cluster secrets
//! - Hash secrets under the process-wide HMAC-SHA256 key
//! - Validate presented secrets without timing oracles

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Raw entropy per generated token, before encoding.
const TOKEN_ENTROPY_BYTES: usize = 32;

/// Minimum accepted length of a presented token. Generated tokens are 43
/// characters (32 bytes, URL-safe base64, no padding); anything shorter
/// than this is rejected before any hashing work happens.
pub const TOKEN_MIN_LEN: usize = 41;

/// Minimum length of the process-wide HMAC key.
pub const KEY_MIN_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("HMAC key must be at least {KEY_MIN_BYTES} bytes, got {0}")]
    KeyTooShort(usize),

    #[error("token below minimum length")]
    TokenTooShort,
}

/// Process-wide HMAC key. Construction enforces the minimum length, so a
/// `TokenKey` in hand is always usable.
#[derive(Clone)]
pub struct TokenKey(Vec<u8>);

impl TokenKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if bytes.len() < KEY_MIN_BYTES {
            return Err(TokenError::KeyTooShort(bytes.len()));
        }
        Ok(TokenKey(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(..)")
    }
}

/// Generate a new random secret: 32 bytes from the OS entropy source,
/// URL-safe base64 without padding.
pub fn generate() -> String {
    let mut buf = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// HMAC-SHA256 of `secret` under `key`, hex-encoded. This is the only form
/// in which secrets are ever persisted.
pub fn hash(secret: &str, key: &TokenKey) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(secret.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Whether `presented` hashes to `stored_hash` under `key`.
///
/// The digest comparison is constant-time over the full digest; it never
/// short-circuits on the first mismatching byte.
pub fn validate(presented: &str, key: &TokenKey, stored_hash: &str) -> bool {
    let computed = hash(presented, key);
    // Hex digests have fixed length, so the length gate leaks nothing
    // secret-dependent.
    if computed.len() != stored_hash.len() {
        return false;
    }
    computed
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}

/// Cheap pre-check run before any lookup or hashing.
pub fn validate_length(presented: &str) -> Result<(), TokenError> {
    if presented.len() < TOKEN_MIN_LEN {
        return Err(TokenError::TokenTooShort);
    }
    Ok(())
}
