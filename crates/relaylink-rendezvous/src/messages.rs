//! Handshake messages, fixed binary layouts.
//!
//! | message | direction | layout |
//! |---|---|---|
//! | `Hello` | RRD → RID | `challenge(16) ‖ etk(32)` |
//! | `AuthHello` | RID → RRD | `response(16) ‖ challenge(16) ‖ etk(32)` |
//! | `Auth` | RRD → RID | `response(16)` |
//! | `Nominate` | nominator → nominee | empty |

use relaylink_crypto::{PublicKey, PUBLIC_KEY_LENGTH};

use crate::RendezvousProtocolError;

pub const CHALLENGE_LENGTH: usize = 16;

/// Random authentication challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge(pub [u8; CHALLENGE_LENGTH]);

impl Challenge {
    pub fn random() -> Self {
        Self(relaylink_crypto::random_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub challenge: Challenge,
    pub etk: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHello {
    pub response: Challenge,
    pub challenge: Challenge,
    pub etk: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub response: Challenge,
}

fn expect_len(
    message: &'static str,
    data: &[u8],
    expected: usize,
) -> Result<(), RendezvousProtocolError> {
    if data.len() != expected {
        return Err(RendezvousProtocolError::InvalidMessage {
            message,
            reason: format!("expected {expected} bytes, got {}", data.len()),
        });
    }
    Ok(())
}

fn challenge_at(data: &[u8], offset: usize) -> Challenge {
    let mut challenge = [0u8; CHALLENGE_LENGTH];
    challenge.copy_from_slice(&data[offset..offset + CHALLENGE_LENGTH]);
    Challenge(challenge)
}

fn etk_at(data: &[u8], offset: usize) -> PublicKey {
    let mut key = [0u8; PUBLIC_KEY_LENGTH];
    key.copy_from_slice(&data[offset..offset + PUBLIC_KEY_LENGTH]);
    PublicKey(key)
}

impl Hello {
    pub const LENGTH: usize = CHALLENGE_LENGTH + PUBLIC_KEY_LENGTH;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.extend_from_slice(&self.challenge.0);
        out.extend_from_slice(self.etk.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RendezvousProtocolError> {
        expect_len("hello", data, Self::LENGTH)?;
        Ok(Self {
            challenge: challenge_at(data, 0),
            etk: etk_at(data, CHALLENGE_LENGTH),
        })
    }
}

impl AuthHello {
    pub const LENGTH: usize = 2 * CHALLENGE_LENGTH + PUBLIC_KEY_LENGTH;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.extend_from_slice(&self.response.0);
        out.extend_from_slice(&self.challenge.0);
        out.extend_from_slice(self.etk.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RendezvousProtocolError> {
        expect_len("auth-hello", data, Self::LENGTH)?;
        Ok(Self {
            response: challenge_at(data, 0),
            challenge: challenge_at(data, CHALLENGE_LENGTH),
            etk: etk_at(data, 2 * CHALLENGE_LENGTH),
        })
    }
}

impl Auth {
    pub const LENGTH: usize = CHALLENGE_LENGTH;

    pub fn encode(&self) -> Vec<u8> {
        self.response.0.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RendezvousProtocolError> {
        expect_len("auth", data, Self::LENGTH)?;
        Ok(Self {
            response: challenge_at(data, 0),
        })
    }
}

/// `Nominate` carries no payload.
pub fn decode_nominate(data: &[u8]) -> Result<(), RendezvousProtocolError> {
    expect_len("nominate", data, 0)
}
