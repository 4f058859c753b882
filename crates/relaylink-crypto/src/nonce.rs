//! Cookie + sequence number nonces.

use std::fmt;

use crate::{random_bytes, CryptoError, COOKIE_LENGTH, NONCE_LENGTH};

/// Random 16-byte cookie chosen by each side of a connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cookie(pub [u8; COOKIE_LENGTH]);

impl Cookie {
    pub fn random() -> Self {
        Self(random_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let cookie: [u8; COOKIE_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: COOKIE_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(cookie))
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", hex::encode(self.0))
    }
}

/// Produces `cookie || sn` nonces with a little-endian u64 sequence number
/// starting at 1. Never yields the same nonce twice.
#[derive(Debug)]
pub struct NonceCounter {
    cookie: Cookie,
    next: Option<u64>,
}

impl NonceCounter {
    pub fn new(cookie: Cookie) -> Self {
        Self::starting_at(cookie, 1)
    }

    pub fn starting_at(cookie: Cookie, sequence_number: u64) -> Self {
        Self {
            cookie,
            next: Some(sequence_number),
        }
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    /// Next nonce, or `SequenceNumberOverflow` once u64::MAX has been used.
    pub fn next_nonce(&mut self) -> Result<[u8; NONCE_LENGTH], CryptoError> {
        let sn = self.next.ok_or(CryptoError::SequenceNumberOverflow)?;
        self.next = sn.checked_add(1);

        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[..COOKIE_LENGTH].copy_from_slice(&self.cookie.0);
        nonce[COOKIE_LENGTH..].copy_from_slice(&sn.to_le_bytes());
        Ok(nonce)
    }
}
