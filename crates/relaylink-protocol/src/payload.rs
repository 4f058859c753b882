//! Frame payload container: `[payload type u8][3 reserved zero bytes][data]`.

use serde::{Deserialize, Serialize};

use crate::defines::DEFINES;
use crate::messages::hex_bytes;
use crate::ProtocolError;

/// Decrypted frame payload. The codec layer never interprets `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub payload_type: u8,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl FramePayload {
    pub fn new(payload_type: u8, data: Vec<u8>) -> Self {
        Self { payload_type, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEFINES.frame_header_len + self.data.len());
        out.push(self.payload_type);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < DEFINES.frame_header_len {
            return Err(ProtocolError::FrameTooShort {
                size: bytes.len(),
                min: DEFINES.frame_header_len,
            });
        }
        // Reserved bytes are ignored on receipt
        Ok(Self {
            payload_type: bytes[0],
            data: bytes[DEFINES.frame_header_len..].to_vec(),
        })
    }
}

macro_rules! payload_types {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(ProtocolError::UnknownPayloadType(other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

payload_types!(
    /// Chat server (CSP) payload types.
    CspPayloadType {
        EchoRequest = 0x00,
        OutgoingMessage = 0x01,
        IncomingMessage = 0x02,
        UnblockIncomingMessages = 0x03,
        EchoReply = 0x80,
        OutgoingMessageAck = 0x81,
        IncomingMessageAck = 0x82,
        QueueSendComplete = 0xd0,
        DeviceCookieChangeIndication = 0xd2,
        Alert = 0xe0,
        CloseError = 0xe1,
    }
);

payload_types!(
    /// Device-group payload types carried in the same frame stream.
    D2mPayloadType {
        ReflectionQueueDry = 0x20,
        RolePromotedToLeader = 0x21,
        DropDevice = 0x32,
        DropDeviceAck = 0x33,
        BeginTransaction = 0x40,
        BeginTransactionAck = 0x41,
        CommitTransaction = 0x42,
        CommitTransactionAck = 0x43,
        TransactionRejected = 0x44,
        TransactionEnded = 0x45,
        Reflect = 0x90,
        ReflectAck = 0x91,
        Reflected = 0x92,
        ReflectedAck = 0x93,
    }
);
