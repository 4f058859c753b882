//! Relaylink Rendezvous -- multi-path connection rendezvous for device linking.
//!
//! Two devices share an authentication key (AK) out of band. The Rendezvous
//! Responder Device (RRD) opens every candidate path with a `Hello`, the
//! Rendezvous Initiator Device (RID) answers with an `AuthHello`, the RRD
//! completes with `Auth`. Each path then derives its own transport keys and
//! waits for the nominator to `Nominate` exactly one of them; all others are
//! dropped and the nominated path carries upper-layer (ULP) data.
//!
//! [`RendezvousProtocol`] is the pure state machine. [`MultiplexedRendezvousPath`]
//! and [`RendezvousConnection`] drive it over async [`RendezvousPath`]s.

use zeroize::ZeroizeOnDrop;

pub mod connection;
pub mod frame;
mod keys;
pub mod messages;
pub mod multiplexed;
pub mod path;
pub mod protocol;

pub use connection::RendezvousConnection;
pub use frame::{FrameDecoder, OutgoingFrame};
pub use multiplexed::{MultiplexedRendezvousPath, NominatedPath};
pub use path::{RendezvousPath, StreamPath, TcpPath};
pub use protocol::{PathProcessResult, PathStateUpdate, RendezvousProtocol};

/// Path id chosen by whoever set up the candidate paths.
pub type PathId = u32;

/// BLAKE2b personalisation for every rendezvous key.
pub(crate) const PERSONAL: &[u8] = b"3ma-rendezvous";

#[derive(Debug, thiserror::Error)]
pub enum RendezvousProtocolError {
    #[error("sequence number would overflow")]
    SequenceNumberOverflow,
    #[error("oversized frame of {0} bytes")]
    OversizedFrame(usize),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(#[from] relaylink_crypto::CryptoError),
    #[error("invalid {message} message: {reason}")]
    InvalidMessage {
        message: &'static str,
        reason: String,
    },
    #[error("frame received unexpectedly")]
    UnexpectedFrame,
    #[error("unknown or dropped path with pid {0}")]
    UnknownOrDroppedPath(PathId),
    #[error("path with pid {0} is closed")]
    PathClosed(PathId),
    #[error("nomination is not allowed for the local role")]
    NominateNotAllowed,
    #[error("nomination already occurred for pid {0}")]
    NominationAlreadyDone(PathId),
    #[error("nomination is not allowed in state {0}")]
    InvalidStateForNomination(&'static str),
    #[error("nomination is required before sending ulp data")]
    NominationRequired,
}

/// Errors of the async layer.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("rendezvous protocol error: {0}")]
    Protocol(#[from] RendezvousProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("all rendezvous paths closed")]
    AllPathsClosed,
}

/// Which side of the rendezvous this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousRole {
    /// Rendezvous Initiator Device: waits for `Hello`.
    Initiator,
    /// Rendezvous Responder Device: sends `Hello` on every path.
    Responder,
}

/// Authentication key shared out of band.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AuthenticationKey(pub [u8; 32]);

impl AuthenticationKey {
    pub fn random() -> Self {
        Self(relaylink_crypto::random_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, RendezvousProtocolError> {
        let bytes = hex::decode(s).map_err(|e| RendezvousProtocolError::InvalidMessage {
            message: "authentication key",
            reason: e.to_string(),
        })?;
        let key: [u8; 32] =
            bytes
                .try_into()
                .map_err(|bytes: Vec<u8>| RendezvousProtocolError::InvalidMessage {
                    message: "authentication key",
                    reason: format!("expected 32 bytes, got {}", bytes.len()),
                })?;
        Ok(Self(key))
    }
}

impl std::fmt::Debug for AuthenticationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthenticationKey(..)")
    }
}

/// Rendezvous Path Hash, compared out of band by both users.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RendezvousPathHash(pub [u8; 32]);

impl RendezvousPathHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for RendezvousPathHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RendezvousPathHash({})", self.to_hex())
    }
}
