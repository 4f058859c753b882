//! Key schedule and per-direction frame ciphers.
//!
//! ```text
//! RIDAK = KDF(AK, "rida")        RRDAK = KDF(AK, "rrda")
//! STK   = KDF(AK ‖ ETK, "st")
//! RIDTK = KDF(STK, "ridt")       RRDTK = KDF(STK, "rrdt")
//! RPH   = KDF(STK, "ph")
//! ```

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use relaylink_crypto::{derive_key, SharedKey};
use zeroize::Zeroizing;

use crate::{
    AuthenticationKey, PathId, RendezvousPathHash, RendezvousProtocolError, RendezvousRole,
    PERSONAL,
};

/// Poly1305 tag appended to every encrypted frame.
pub(crate) const TAG_LEN: usize = 16;

/// ChaCha20Poly1305 with nonce `pid u32 LE ‖ sn u32 LE ‖ 0u32`, sequence
/// numbers starting at 1.
pub(crate) struct FrameCipher {
    cipher: ChaCha20Poly1305,
    pid: PathId,
    next_sn: Option<u32>,
}

impl FrameCipher {
    fn new(key: &[u8; 32], pid: PathId) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            pid,
            next_sn: Some(1),
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], RendezvousProtocolError> {
        let sn = self
            .next_sn
            .ok_or(RendezvousProtocolError::SequenceNumberOverflow)?;
        self.next_sn = sn.checked_add(1);
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.pid.to_le_bytes());
        nonce[4..8].copy_from_slice(&sn.to_le_bytes());
        Ok(nonce)
    }

    pub(crate) fn encrypt(&mut self, data: &mut Vec<u8>) -> Result<(), RendezvousProtocolError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), b"", data)
            .map_err(|_| RendezvousProtocolError::EncryptionFailed)
    }

    pub(crate) fn decrypt(&mut self, data: &mut Vec<u8>) -> Result<(), RendezvousProtocolError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), b"", data)
            .map_err(|_| RendezvousProtocolError::DecryptionFailed)
    }
}

/// One cipher per direction, oriented for the local role.
pub(crate) struct DirectionalKeys {
    pub(crate) outgoing: FrameCipher,
    pub(crate) incoming: FrameCipher,
}

impl DirectionalKeys {
    fn oriented(rid_key: &[u8; 32], rrd_key: &[u8; 32], role: RendezvousRole, pid: PathId) -> Self {
        let rid = FrameCipher::new(rid_key, pid);
        let rrd = FrameCipher::new(rrd_key, pid);
        match role {
            RendezvousRole::Initiator => Self {
                outgoing: rid,
                incoming: rrd,
            },
            RendezvousRole::Responder => Self {
                outgoing: rrd,
                incoming: rid,
            },
        }
    }

    /// RIDAK/RRDAK for the handshake.
    pub(crate) fn authentication(
        ak: &AuthenticationKey,
        role: RendezvousRole,
        pid: PathId,
    ) -> Result<Self, RendezvousProtocolError> {
        let ridak = Zeroizing::new(derive_key(&ak.0, b"rida", PERSONAL)?);
        let rrdak = Zeroizing::new(derive_key(&ak.0, b"rrda", PERSONAL)?);
        Ok(Self::oriented(&ridak, &rrdak, role, pid))
    }

    /// RIDTK/RRDTK after the handshake, plus the path hash.
    pub(crate) fn transport(
        ak: &AuthenticationKey,
        etk: &SharedKey,
        role: RendezvousRole,
        pid: PathId,
    ) -> Result<(Self, RendezvousPathHash), RendezvousProtocolError> {
        let mut input = Zeroizing::new([0u8; 64]);
        input[..32].copy_from_slice(&ak.0);
        input[32..].copy_from_slice(etk.as_bytes());
        let stk = Zeroizing::new(derive_key(&input[..], b"st", PERSONAL)?);

        let ridtk = Zeroizing::new(derive_key(&stk[..], b"ridt", PERSONAL)?);
        let rrdtk = Zeroizing::new(derive_key(&stk[..], b"rrdt", PERSONAL)?);
        let rph = RendezvousPathHash(derive_key(&stk[..], b"ph", PERSONAL)?);
        Ok((Self::oriented(&ridtk, &rrdtk, role, pid), rph))
    }
}
