//! Relaylink Protocol -- wire types, frame codec, CSP handshake.
//!
//! Plain TCP to the chat server. The first three exchanges are the CSP login
//! (client hello, server hello, login + login ack); after that every frame is a
//! 2-byte little-endian length prefix followed by a NaCl box of
//! `[payload type][3 reserved][data]`.

pub mod codec;
pub mod csp;
pub mod defines;
pub mod messages;
pub mod payload;

pub use codec::FrameCodec;
pub use csp::{
    CspError, CspServerSession, CspSession, CspState, LoginAck, LoginExtensions, LoginStep,
    ServerKeys,
};
pub use defines::{ProtocolDefines, DEFINES};
pub use messages::*;
pub use payload::{CspPayloadType, D2mPayloadType, FramePayload};

/// Reflect id chosen by the reflecting device (correlates `Reflect` and `ReflectAck`).
pub type ReflectId = u32;

/// CSP device id announced during login and used by device-group operations.
pub type DeviceId = u64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame too short: {size} bytes (min {min})")]
    FrameTooShort { size: usize, min: usize },
    #[error("unknown payload type: {0:#04x}")]
    UnknownPayloadType(u8),
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}
