//! Relaylink Crypto -- NaCl box, nonce counters, BLAKE2b key derivation, client identity.
//!
//! Wire compatible with the chat server:
//! - X25519 key agreement, HSalsa20 on top of the shared point
//! - XSalsa20Poly1305 secretbox with the 16-byte tag in front of the ciphertext
//! - 24-byte nonces: 16-byte cookie + 8-byte little-endian sequence number
//! - BLAKE2b-256 keyed hashing with salt + personal for key derivation

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use ring::rand::{SecureRandom, SystemRandom};

pub mod identity;
pub mod nacl;
pub mod nonce;

// Re-exports
pub use identity::ClientIdentity;
pub use nacl::{hsalsa20, KeyPair, PublicKey, SharedKey};
pub use nonce::{Cookie, NonceCounter};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;
pub const COOKIE_LENGTH: usize = 16;
pub const NONCE_LENGTH: usize = 24;
/// Poly1305 tag prepended by the secretbox.
pub const BOX_OVERHEAD: usize = 16;
pub const MAC_256_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("nonce sequence number exhausted")]
    SequenceNumberOverflow,
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fill a fixed-size array from the system RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let rng = SystemRandom::new();
    let mut out = [0u8; N];
    rng.fill(&mut out).expect("system RNG failure");
    out
}

/// Derive a 32-byte key: BLAKE2b-256 keyed with `secret`, empty input.
pub fn derive_key(secret: &[u8], salt: &[u8], personal: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mac = Blake2bMac::<U32>::new_with_salt_and_personal(secret, salt, personal)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(mac.finalize().into_bytes().into())
}

/// BLAKE2b-256 MAC over the concatenation of `parts`.
pub fn mac_256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_256_LENGTH], CryptoError> {
    let mut mac = Blake2bMac::<U32>::new_with_salt_and_personal(key, &[], &[])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(mac.finalize().into_bytes().into())
}
