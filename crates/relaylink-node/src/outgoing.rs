//! Persistent task sending one CSP message and awaiting its server ack.

use async_trait::async_trait;
use relaylink_protocol::{InboundMessage, OutboundMessage};
use relaylink_tasks::{MessageFilterInstruction, Persistence, Task, TaskCodec, TaskError};
use serde::{Deserialize, Serialize};

/// Sends `sender(8) ‖ receiver(8) ‖ message id(8) ‖ body` and completes
/// once the server acknowledged `receiver ‖ message id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessageTask {
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
}

impl OutgoingMessageTask {
    pub const KIND: &'static str = "outgoing-message";

    pub fn new(data: Vec<u8>) -> Result<Self, TaskError> {
        if data.len() < 24 {
            return Err(TaskError::Unexpected(anyhow::anyhow!(
                "outgoing message needs a 24 byte header, got {} bytes",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    /// The ack the server answers with.
    pub fn expected_ack(&self) -> &[u8] {
        &self.data[8..24]
    }
}

#[async_trait]
impl Task for OutgoingMessageTask {
    type Output = ();

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn invoke(&self, handle: &dyn TaskCodec) -> Result<(), TaskError> {
        handle
            .write(OutboundMessage::OutgoingMessage(self.data.clone()))
            .await?;
        let expected = self.expected_ack();
        let filter = |message: &InboundMessage| match message {
            InboundMessage::OutgoingMessageAck(ack) if ack.as_slice() == expected => {
                MessageFilterInstruction::Accept
            }
            _ => MessageFilterInstruction::BypassOrBacklog,
        };
        handle.read(&filter).await?;
        tracing::debug!(message_id = %hex::encode(&expected[8..]), "outgoing message acknowledged");
        Ok(())
    }

    fn persistence(&self) -> Persistence {
        Persistence::of(self)
    }
}

mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
