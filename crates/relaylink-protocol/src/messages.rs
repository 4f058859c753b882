//! Inbound and outbound message types.
//!
//! Both directions are closed sum types over [`FramePayload`]. The engine only
//! looks at the variant and at correlation ids (reflect id, device id); the
//! envelopes and message bodies stay opaque.

use serde::{Deserialize, Serialize};

use crate::payload::{CspPayloadType, D2mPayloadType, FramePayload};
use crate::{DeviceId, ProtocolError, ReflectId};

// ============================================================================
// Device-group payloads
// ============================================================================

/// Header length of an outgoing `Reflect`.
const REFLECT_HEADER_LEN: u8 = 8;
/// Minimum header length of an incoming `Reflected`.
const REFLECTED_HEADER_LEN: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflect {
    pub flags: u16,
    pub reflect_id: ReflectId,
    #[serde(with = "hex_bytes")]
    pub envelope: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectAck {
    pub reflect_id: ReflectId,
    /// Milliseconds since the Unix epoch, assigned by the mediator.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflected {
    pub flags: u16,
    pub reflected_id: u32,
    pub timestamp: u64,
    #[serde(with = "hex_bytes")]
    pub envelope: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub device_id: DeviceId,
    #[serde(with = "hex_bytes")]
    pub encrypted_scope: Vec<u8>,
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundMessage {
    EchoRequest(#[serde(with = "hex_bytes")] Vec<u8>),
    EchoReply(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Encrypted application container from another client.
    IncomingMessage(#[serde(with = "hex_bytes")] Vec<u8>),
    OutgoingMessageAck(#[serde(with = "hex_bytes")] Vec<u8>),
    QueueSendComplete,
    DeviceCookieChangeIndication,
    ServerAlert(String),
    ServerError { reconnect_allowed: bool, text: String },
    /// Any other CSP payload, passed through untouched.
    CspContainer(FramePayload),

    Reflected(Reflected),
    ReflectAck(ReflectAck),
    BeginTransactionAck,
    CommitTransactionAck,
    TransactionRejected(TransactionInfo),
    TransactionEnded(TransactionInfo),
    DropDeviceAck(DeviceId),
    ReflectionQueueDry,
    RolePromotedToLeader,
}

impl InboundMessage {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EchoRequest(_) => "echo-request",
            Self::EchoReply(_) => "echo-reply",
            Self::IncomingMessage(_) => "incoming-message",
            Self::OutgoingMessageAck(_) => "outgoing-message-ack",
            Self::QueueSendComplete => "queue-send-complete",
            Self::DeviceCookieChangeIndication => "device-cookie-change-indication",
            Self::ServerAlert(_) => "server-alert",
            Self::ServerError { .. } => "server-error",
            Self::CspContainer(_) => "csp-container",
            Self::Reflected(_) => "reflected",
            Self::ReflectAck(_) => "reflect-ack",
            Self::BeginTransactionAck => "begin-transaction-ack",
            Self::CommitTransactionAck => "commit-transaction-ack",
            Self::TransactionRejected(_) => "transaction-rejected",
            Self::TransactionEnded(_) => "transaction-ended",
            Self::DropDeviceAck(_) => "drop-device-ack",
            Self::ReflectionQueueDry => "reflection-queue-dry",
            Self::RolePromotedToLeader => "role-promoted-to-leader",
        }
    }

    /// Decode a decrypted payload. Unknown CSP types become `CspContainer`.
    pub fn decode(payload: FramePayload) -> Result<Self, ProtocolError> {
        if let Ok(d2m) = D2mPayloadType::try_from(payload.payload_type) {
            return decode_inbound_d2m(d2m, &payload.data);
        }
        let message = match CspPayloadType::try_from(payload.payload_type) {
            Ok(CspPayloadType::EchoRequest) => Self::EchoRequest(payload.data),
            Ok(CspPayloadType::EchoReply) => Self::EchoReply(payload.data),
            Ok(CspPayloadType::IncomingMessage) => Self::IncomingMessage(payload.data),
            Ok(CspPayloadType::OutgoingMessageAck) => Self::OutgoingMessageAck(payload.data),
            Ok(CspPayloadType::QueueSendComplete) => Self::QueueSendComplete,
            Ok(CspPayloadType::DeviceCookieChangeIndication) => Self::DeviceCookieChangeIndication,
            Ok(CspPayloadType::Alert) => {
                Self::ServerAlert(String::from_utf8_lossy(&payload.data).into_owned())
            }
            Ok(CspPayloadType::CloseError) => {
                let mut r = Reader::new("server-error", &payload.data);
                let reconnect_allowed = r.u8()? != 0;
                Self::ServerError {
                    reconnect_allowed,
                    text: String::from_utf8_lossy(r.rest()).into_owned(),
                }
            }
            _ => Self::CspContainer(payload),
        };
        Ok(message)
    }

    /// Encode as the server would send it.
    pub fn to_payload(&self) -> FramePayload {
        use CspPayloadType as Csp;
        use D2mPayloadType as D2m;

        match self {
            Self::EchoRequest(data) => FramePayload::new(Csp::EchoRequest.into(), data.clone()),
            Self::EchoReply(data) => FramePayload::new(Csp::EchoReply.into(), data.clone()),
            Self::IncomingMessage(data) => {
                FramePayload::new(Csp::IncomingMessage.into(), data.clone())
            }
            Self::OutgoingMessageAck(data) => {
                FramePayload::new(Csp::OutgoingMessageAck.into(), data.clone())
            }
            Self::QueueSendComplete => FramePayload::new(Csp::QueueSendComplete.into(), vec![]),
            Self::DeviceCookieChangeIndication => {
                FramePayload::new(Csp::DeviceCookieChangeIndication.into(), vec![])
            }
            Self::ServerAlert(text) => FramePayload::new(Csp::Alert.into(), text.as_bytes().to_vec()),
            Self::ServerError {
                reconnect_allowed,
                text,
            } => {
                let mut data = vec![u8::from(*reconnect_allowed)];
                data.extend_from_slice(text.as_bytes());
                FramePayload::new(Csp::CloseError.into(), data)
            }
            Self::CspContainer(payload) => payload.clone(),
            Self::Reflected(reflected) => {
                let mut data = vec![REFLECTED_HEADER_LEN, 0];
                data.extend_from_slice(&reflected.flags.to_le_bytes());
                data.extend_from_slice(&reflected.reflected_id.to_le_bytes());
                data.extend_from_slice(&reflected.timestamp.to_le_bytes());
                data.extend_from_slice(&reflected.envelope);
                FramePayload::new(D2m::Reflected.into(), data)
            }
            Self::ReflectAck(ack) => {
                let mut data = vec![0u8; 4];
                data.extend_from_slice(&ack.reflect_id.to_le_bytes());
                data.extend_from_slice(&ack.timestamp.to_le_bytes());
                FramePayload::new(D2m::ReflectAck.into(), data)
            }
            Self::BeginTransactionAck => FramePayload::new(D2m::BeginTransactionAck.into(), vec![]),
            Self::CommitTransactionAck => {
                FramePayload::new(D2m::CommitTransactionAck.into(), vec![])
            }
            Self::TransactionRejected(info) => {
                FramePayload::new(D2m::TransactionRejected.into(), encode_transaction_info(info))
            }
            Self::TransactionEnded(info) => {
                FramePayload::new(D2m::TransactionEnded.into(), encode_transaction_info(info))
            }
            Self::DropDeviceAck(device_id) => {
                FramePayload::new(D2m::DropDeviceAck.into(), device_id.to_le_bytes().to_vec())
            }
            Self::ReflectionQueueDry => FramePayload::new(D2m::ReflectionQueueDry.into(), vec![]),
            Self::RolePromotedToLeader => {
                FramePayload::new(D2m::RolePromotedToLeader.into(), vec![])
            }
        }
    }
}

fn decode_inbound_d2m(kind: D2mPayloadType, data: &[u8]) -> Result<InboundMessage, ProtocolError> {
    let message = match kind {
        D2mPayloadType::Reflected => {
            let mut r = Reader::new("reflected", data);
            let header_len = r.u8()?;
            if header_len < REFLECTED_HEADER_LEN {
                return Err(ProtocolError::malformed(
                    "reflected",
                    format!("header length {header_len} < {REFLECTED_HEADER_LEN}"),
                ));
            }
            let _reserved = r.u8()?;
            let flags = r.u16()?;
            let reflected_id = r.u32()?;
            let timestamp = r.u64()?;
            // Skip header bytes this version does not know about
            r.skip(usize::from(header_len - REFLECTED_HEADER_LEN))?;
            InboundMessage::Reflected(Reflected {
                flags,
                reflected_id,
                timestamp,
                envelope: r.rest().to_vec(),
            })
        }
        D2mPayloadType::ReflectAck => {
            let mut r = Reader::new("reflect-ack", data);
            r.skip(4)?;
            InboundMessage::ReflectAck(ReflectAck {
                reflect_id: r.u32()?,
                timestamp: r.u64()?,
            })
        }
        D2mPayloadType::BeginTransactionAck => InboundMessage::BeginTransactionAck,
        D2mPayloadType::CommitTransactionAck => InboundMessage::CommitTransactionAck,
        D2mPayloadType::TransactionRejected => {
            InboundMessage::TransactionRejected(decode_transaction_info("transaction-rejected", data)?)
        }
        D2mPayloadType::TransactionEnded => {
            InboundMessage::TransactionEnded(decode_transaction_info("transaction-ended", data)?)
        }
        D2mPayloadType::DropDeviceAck => {
            InboundMessage::DropDeviceAck(Reader::new("drop-device-ack", data).u64()?)
        }
        D2mPayloadType::ReflectionQueueDry => InboundMessage::ReflectionQueueDry,
        D2mPayloadType::RolePromotedToLeader => InboundMessage::RolePromotedToLeader,
        other => {
            return Err(ProtocolError::malformed(
                "inbound message",
                format!("{other:?} is client-to-server only"),
            ))
        }
    };
    Ok(message)
}

fn encode_transaction_info(info: &TransactionInfo) -> Vec<u8> {
    let mut data = info.device_id.to_le_bytes().to_vec();
    data.extend_from_slice(&info.encrypted_scope);
    data
}

fn decode_transaction_info(kind: &'static str, data: &[u8]) -> Result<TransactionInfo, ProtocolError> {
    let mut r = Reader::new(kind, data);
    Ok(TransactionInfo {
        device_id: r.u64()?,
        encrypted_scope: r.rest().to_vec(),
    })
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundMessage {
    EchoRequest(#[serde(with = "hex_bytes")] Vec<u8>),
    EchoReply(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Encrypted application container for another client.
    OutgoingMessage(#[serde(with = "hex_bytes")] Vec<u8>),
    IncomingMessageAck(#[serde(with = "hex_bytes")] Vec<u8>),
    UnblockIncomingMessages,
    CspContainer(FramePayload),

    Reflect(Reflect),
    ReflectedAck(u32),
    BeginTransaction {
        #[serde(with = "hex_bytes")]
        encrypted_scope: Vec<u8>,
        /// Seconds, 0 = server default.
        ttl: u32,
    },
    CommitTransaction,
    DropDevice(DeviceId),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EchoRequest(_) => "echo-request",
            Self::EchoReply(_) => "echo-reply",
            Self::OutgoingMessage(_) => "outgoing-message",
            Self::IncomingMessageAck(_) => "incoming-message-ack",
            Self::UnblockIncomingMessages => "unblock-incoming-messages",
            Self::CspContainer(_) => "csp-container",
            Self::Reflect(_) => "reflect",
            Self::ReflectedAck(_) => "reflected-ack",
            Self::BeginTransaction { .. } => "begin-transaction",
            Self::CommitTransaction => "commit-transaction",
            Self::DropDevice(_) => "drop-device",
        }
    }

    pub fn to_payload(&self) -> FramePayload {
        use CspPayloadType as Csp;
        use D2mPayloadType as D2m;

        match self {
            Self::EchoRequest(data) => FramePayload::new(Csp::EchoRequest.into(), data.clone()),
            Self::EchoReply(data) => FramePayload::new(Csp::EchoReply.into(), data.clone()),
            Self::OutgoingMessage(data) => {
                FramePayload::new(Csp::OutgoingMessage.into(), data.clone())
            }
            Self::IncomingMessageAck(data) => {
                FramePayload::new(Csp::IncomingMessageAck.into(), data.clone())
            }
            Self::UnblockIncomingMessages => {
                FramePayload::new(Csp::UnblockIncomingMessages.into(), vec![])
            }
            Self::CspContainer(payload) => payload.clone(),
            Self::Reflect(reflect) => {
                let mut data = vec![REFLECT_HEADER_LEN, 0];
                data.extend_from_slice(&reflect.flags.to_le_bytes());
                data.extend_from_slice(&reflect.reflect_id.to_le_bytes());
                data.extend_from_slice(&reflect.envelope);
                FramePayload::new(D2m::Reflect.into(), data)
            }
            Self::ReflectedAck(reflected_id) => {
                let mut data = vec![0u8; 4];
                data.extend_from_slice(&reflected_id.to_le_bytes());
                FramePayload::new(D2m::ReflectedAck.into(), data)
            }
            Self::BeginTransaction {
                encrypted_scope,
                ttl,
            } => {
                let mut data = ttl.to_le_bytes().to_vec();
                data.extend_from_slice(encrypted_scope);
                FramePayload::new(D2m::BeginTransaction.into(), data)
            }
            Self::CommitTransaction => FramePayload::new(D2m::CommitTransaction.into(), vec![]),
            Self::DropDevice(device_id) => {
                FramePayload::new(D2m::DropDevice.into(), device_id.to_le_bytes().to_vec())
            }
        }
    }

    /// Decode as the server would receive it.
    pub fn decode(payload: FramePayload) -> Result<Self, ProtocolError> {
        if let Ok(d2m) = D2mPayloadType::try_from(payload.payload_type) {
            let data = &payload.data;
            let message = match d2m {
                D2mPayloadType::Reflect => {
                    let mut r = Reader::new("reflect", data);
                    let header_len = r.u8()?;
                    if header_len < REFLECT_HEADER_LEN {
                        return Err(ProtocolError::malformed(
                            "reflect",
                            format!("header length {header_len} < {REFLECT_HEADER_LEN}"),
                        ));
                    }
                    let _reserved = r.u8()?;
                    let flags = r.u16()?;
                    let reflect_id = r.u32()?;
                    r.skip(usize::from(header_len - REFLECT_HEADER_LEN))?;
                    Self::Reflect(Reflect {
                        flags,
                        reflect_id,
                        envelope: r.rest().to_vec(),
                    })
                }
                D2mPayloadType::ReflectedAck => {
                    let mut r = Reader::new("reflected-ack", data);
                    r.skip(4)?;
                    Self::ReflectedAck(r.u32()?)
                }
                D2mPayloadType::BeginTransaction => {
                    let mut r = Reader::new("begin-transaction", data);
                    let ttl = r.u32()?;
                    Self::BeginTransaction {
                        encrypted_scope: r.rest().to_vec(),
                        ttl,
                    }
                }
                D2mPayloadType::CommitTransaction => Self::CommitTransaction,
                D2mPayloadType::DropDevice => {
                    Self::DropDevice(Reader::new("drop-device", data).u64()?)
                }
                other => {
                    return Err(ProtocolError::malformed(
                        "outbound message",
                        format!("{other:?} is server-to-client only"),
                    ))
                }
            };
            return Ok(message);
        }
        let message = match CspPayloadType::try_from(payload.payload_type) {
            Ok(CspPayloadType::EchoRequest) => Self::EchoRequest(payload.data),
            Ok(CspPayloadType::EchoReply) => Self::EchoReply(payload.data),
            Ok(CspPayloadType::OutgoingMessage) => Self::OutgoingMessage(payload.data),
            Ok(CspPayloadType::IncomingMessageAck) => Self::IncomingMessageAck(payload.data),
            Ok(CspPayloadType::UnblockIncomingMessages) => Self::UnblockIncomingMessages,
            _ => Self::CspContainer(payload),
        };
        Ok(message)
    }
}

// ============================================================================
// Binary helpers
// ============================================================================

/// Bounds-checked little-endian reader over a payload.
struct Reader<'a> {
    kind: &'static str,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(kind: &'static str, buf: &'a [u8]) -> Self {
        Self { kind, buf }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.buf.len() < N {
            return Err(ProtocolError::malformed(
                self.kind,
                format!("need {N} bytes, {} left", self.buf.len()),
            ));
        }
        let (head, tail) = self.buf.split_at(N);
        self.buf = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::malformed(
                self.kind,
                format!("cannot skip {n} bytes, {} left", self.buf.len()),
            ));
        }
        self.buf = &self.buf[n..];
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize Vec<u8> as a hex string.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect_layout() {
        let message = OutboundMessage::Reflect(Reflect {
            flags: 0,
            reflect_id: 0x0102_0304,
            envelope: vec![0xee],
        });
        let payload = message.to_payload();
        assert_eq!(payload.payload_type, 0x90);
        assert_eq!(payload.data, vec![8, 0, 0, 0, 0x04, 0x03, 0x02, 0x01, 0xee]);
        assert_eq!(OutboundMessage::decode(payload).unwrap(), message);
    }

    #[test]
    fn test_reflect_ack_decode() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&1_700_000_000_000u64.to_le_bytes());
        let decoded = InboundMessage::decode(FramePayload::new(0x91, data)).unwrap();
        assert_eq!(
            decoded,
            InboundMessage::ReflectAck(ReflectAck {
                reflect_id: 7,
                timestamp: 1_700_000_000_000,
            })
        );
    }

    #[test]
    fn test_reflected_with_extended_header() {
        let mut data = vec![18, 0];
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(&99u64.to_le_bytes());
        data.extend_from_slice(&[0xff, 0xff]); // unknown header extension
        data.extend_from_slice(b"envelope");

        match InboundMessage::decode(FramePayload::new(0x92, data)).unwrap() {
            InboundMessage::Reflected(r) => {
                assert_eq!(r.flags, 1);
                assert_eq!(r.reflected_id, 42);
                assert_eq!(r.timestamp, 99);
                assert_eq!(r.envelope, b"envelope");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_reflected_short_header_rejected() {
        let result = InboundMessage::decode(FramePayload::new(0x92, vec![4, 0, 0, 0]));
        assert!(matches!(result, Err(ProtocolError::Malformed { kind: "reflected", .. })));
    }

    #[test]
    fn test_truncated_ack_rejected() {
        let result = InboundMessage::decode(FramePayload::new(0x33, vec![1, 2, 3]));
        assert!(matches!(result, Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn test_server_error() {
        let mut data = vec![0u8];
        data.extend_from_slice(b"Another connection for the same identity");
        let decoded = InboundMessage::decode(FramePayload::new(0xe1, data)).unwrap();
        assert_eq!(
            decoded,
            InboundMessage::ServerError {
                reconnect_allowed: false,
                text: "Another connection for the same identity".into(),
            }
        );
    }

    #[test]
    fn test_unknown_csp_type_passes_through() {
        let payload = FramePayload::new(0x1a, vec![1, 2, 3]);
        assert_eq!(
            InboundMessage::decode(payload.clone()).unwrap(),
            InboundMessage::CspContainer(payload)
        );
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        // A Reflect is never sent by the server
        assert!(InboundMessage::decode(FramePayload::new(0x90, vec![8, 0, 0, 0, 0, 0, 0, 0])).is_err());
        // A ReflectAck is never sent by the client
        assert!(OutboundMessage::decode(FramePayload::new(0x91, vec![0; 16])).is_err());
    }

    #[test]
    fn test_inbound_device_group_roundtrip() {
        let messages = vec![
            InboundMessage::BeginTransactionAck,
            InboundMessage::CommitTransactionAck,
            InboundMessage::TransactionRejected(TransactionInfo {
                device_id: 0xdead_beef,
                encrypted_scope: vec![1, 2],
            }),
            InboundMessage::DropDeviceAck(12),
            InboundMessage::ReflectionQueueDry,
        ];
        for message in messages {
            let decoded = InboundMessage::decode(message.to_payload()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_begin_transaction_layout() {
        let message = OutboundMessage::BeginTransaction {
            encrypted_scope: vec![0xab],
            ttl: 30,
        };
        let payload = message.to_payload();
        assert_eq!(payload.data, vec![30, 0, 0, 0, 0xab]);
        assert_eq!(OutboundMessage::decode(payload).unwrap(), message);
    }

    #[test]
    fn test_outbound_json_uses_hex() {
        let message = OutboundMessage::OutgoingMessage(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("01020304"));
        let decoded: OutboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }
}
