//! Default handling of inbound messages no task asked for.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use relaylink_protocol::{OutboundMessage, Reflected};
use relaylink_tasks::{IncomingMessageProcessor, TaskCodec, TaskError};

/// `sender identity(8) ‖ receiver identity(8) ‖ message id(8) ‖ ...`
const MESSAGE_HEADER_LEN: usize = 24;

/// Acknowledges incoming and reflected messages and logs server signals.
#[derive(Debug, Default)]
pub struct NodeMessageProcessor {
    incoming: AtomicU64,
    reflected: AtomicU64,
    alerts: AtomicU64,
}

impl NodeMessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incoming CSP messages acknowledged so far.
    pub fn incoming_count(&self) -> u64 {
        self.incoming.load(Ordering::Relaxed)
    }

    pub fn reflected_count(&self) -> u64 {
        self.reflected.load(Ordering::Relaxed)
    }

    pub fn alert_count(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }
}

/// Ack payload for an incoming message: sender identity and message id.
pub fn incoming_message_ack(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < MESSAGE_HEADER_LEN {
        return None;
    }
    let mut ack = Vec::with_capacity(16);
    ack.extend_from_slice(&data[0..8]);
    ack.extend_from_slice(&data[16..24]);
    Some(ack)
}

#[async_trait]
impl IncomingMessageProcessor for NodeMessageProcessor {
    async fn process_incoming_csp_message(
        &self,
        data: Vec<u8>,
        handle: &dyn TaskCodec,
    ) -> Result<(), TaskError> {
        let Some(ack) = incoming_message_ack(&data) else {
            tracing::warn!(len = data.len(), "dropping truncated incoming message");
            return Ok(());
        };
        tracing::debug!(
            sender = %String::from_utf8_lossy(&ack[..8]),
            message_id = %hex::encode(&ack[8..]),
            "incoming message"
        );
        handle.write(OutboundMessage::IncomingMessageAck(ack)).await?;
        self.incoming.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn process_incoming_reflected(
        &self,
        reflected: Reflected,
        handle: &dyn TaskCodec,
    ) -> Result<(), TaskError> {
        tracing::debug!(
            reflected_id = reflected.reflected_id,
            timestamp = reflected.timestamp,
            len = reflected.envelope.len(),
            "reflected message"
        );
        handle
            .write(OutboundMessage::ReflectedAck(reflected.reflected_id))
            .await?;
        self.reflected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn process_server_alert(&self, text: &str) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(text, "server alert");
    }

    fn process_server_error(&self, reconnect_allowed: bool, text: &str) {
        tracing::error!(reconnect_allowed, text, "server error");
    }
}
