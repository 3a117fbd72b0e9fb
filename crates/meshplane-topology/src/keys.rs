//! WireGuard (Curve25519) key material, base64-encoded as `wg` expects.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{TopologyError, TopologyResult};

#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.as_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the public key of a base64 private key (`wg pubkey`).
pub fn public_key_for(private_key: &str) -> TopologyResult<String> {
    let raw = STANDARD
        .decode(private_key.trim())
        .map_err(|e| TopologyError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = raw.try_into().map_err(|raw: Vec<u8>| {
        TopologyError::InvalidKey(format!("{} bytes, expected 32", raw.len()))
    })?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Check that `key` is a base64 Curve25519 key.
pub fn validate_public_key(key: &str) -> TopologyResult<()> {
    let raw = STANDARD
        .decode(key.trim())
        .map_err(|e| TopologyError::InvalidKey(e.to_string()))?;
    if raw.len() != 32 {
        return Err(TopologyError::InvalidKey(format!(
            "{} bytes, expected 32",
            raw.len()
        )));
    }
    Ok(())
}
