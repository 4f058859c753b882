//! The capability a running task uses to talk to the server, and the seams
//! the engine needs from its surroundings.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaylink_protocol::{
    DeviceId, InboundMessage, OutboundMessage, Reflect, ReflectId, Reflected,
};
use tokio::sync::Mutex;

use crate::queue::IncomingMessageQueue;
use crate::TaskError;

/// What `read` does with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilterInstruction {
    /// Not wanted now: reflected messages are bypassed to the incoming
    /// message processor, everything else waits in the backlog.
    BypassOrBacklog,
    /// Remove the message and return it from `read`.
    Accept,
    /// Drop the message and fail the read with a protocol error.
    Reject,
}

/// Predicate passed to [`TaskCodec::read`].
pub type MessageFilter<'a> = &'a (dyn Fn(&InboundMessage) -> MessageFilterInstruction + Send + Sync);

/// Read/write/reflect access to the current server connection.
///
/// This is the only way a task may touch the connection.
#[async_trait]
pub trait TaskCodec: Send + Sync {
    /// Wait for the first message (backlog first, then new arrivals) the
    /// filter accepts.
    async fn read(&self, filter: MessageFilter<'_>) -> Result<InboundMessage, TaskError>;

    /// Send a message. Without a connection this waits until the runner stops.
    async fn write(&self, message: OutboundMessage) -> Result<(), TaskError>;

    fn next_reflect_id(&self) -> ReflectId;

    /// Reflect an envelope to the other devices of the group.
    async fn reflect(&self, envelope: Vec<u8>) -> Result<ReflectId, TaskError> {
        let reflect_id = self.next_reflect_id();
        self.write(OutboundMessage::Reflect(Reflect {
            flags: 0,
            reflect_id,
            envelope,
        }))
        .await?;
        Ok(reflect_id)
    }

    /// Wait for the `ReflectAck` of `reflect_id`; returns the mediator timestamp.
    async fn await_reflect_ack(&self, reflect_id: ReflectId) -> Result<u64, TaskError> {
        let message = self
            .read(&move |message: &InboundMessage| match message {
                InboundMessage::ReflectAck(ack) if ack.reflect_id == reflect_id => {
                    MessageFilterInstruction::Accept
                }
                _ => MessageFilterInstruction::BypassOrBacklog,
            })
            .await?;
        match message {
            InboundMessage::ReflectAck(ack) => Ok(ack.timestamp),
            other => Err(TaskError::Protocol(format!(
                "expected reflect-ack, got {}",
                other.kind()
            ))),
        }
    }

    async fn reflect_and_await_ack(&self, envelope: Vec<u8>) -> Result<u64, TaskError> {
        let reflect_id = self.reflect(envelope).await?;
        self.await_reflect_ack(reflect_id).await
    }

    /// Begin a device-group transaction and wait until it is in progress.
    ///
    /// While another device holds a transaction the mediator rejects ours;
    /// we then wait for that transaction to end and ask again.
    async fn begin_transaction(&self, encrypted_scope: Vec<u8>, ttl: u32) -> Result<(), TaskError> {
        loop {
            self.write(OutboundMessage::BeginTransaction {
                encrypted_scope: encrypted_scope.clone(),
                ttl,
            })
            .await?;
            let reply = self
                .read(&|message: &InboundMessage| match message {
                    InboundMessage::BeginTransactionAck | InboundMessage::TransactionRejected(_) => {
                        MessageFilterInstruction::Accept
                    }
                    _ => MessageFilterInstruction::BypassOrBacklog,
                })
                .await?;
            match reply {
                InboundMessage::BeginTransactionAck => {
                    tracing::info!("transaction in progress");
                    return Ok(());
                }
                InboundMessage::TransactionRejected(other) => {
                    tracing::info!(
                        device_id = other.device_id,
                        "transaction rejected, another device holds one"
                    );
                    self.read(&|message: &InboundMessage| match message {
                        InboundMessage::TransactionEnded(_) => MessageFilterInstruction::Accept,
                        _ => MessageFilterInstruction::BypassOrBacklog,
                    })
                    .await?;
                }
                other => {
                    return Err(TaskError::Protocol(format!(
                        "expected begin-transaction reply, got {}",
                        other.kind()
                    )))
                }
            }
        }
    }

    async fn commit_transaction(&self) -> Result<(), TaskError> {
        self.write(OutboundMessage::CommitTransaction).await?;
        self.read(&|message: &InboundMessage| match message {
            InboundMessage::CommitTransactionAck => MessageFilterInstruction::Accept,
            _ => MessageFilterInstruction::BypassOrBacklog,
        })
        .await?;
        tracing::info!("transaction committed");
        Ok(())
    }

    /// Remove `device_id` from the device group and wait for the ack.
    async fn drop_device(&self, device_id: DeviceId) -> Result<(), TaskError> {
        self.write(OutboundMessage::DropDevice(device_id)).await?;
        self.read(&move |message: &InboundMessage| match message {
            InboundMessage::DropDeviceAck(acked) if *acked == device_id => {
                MessageFilterInstruction::Accept
            }
            _ => MessageFilterInstruction::BypassOrBacklog,
        })
        .await?;
        tracing::info!(device_id, "device dropped");
        Ok(())
    }
}

/// A device-group transaction wrapped around part of a task.
pub struct Transaction<'a> {
    handle: &'a dyn TaskCodec,
    encrypted_scope: Vec<u8>,
    ttl: u32,
}

impl<'a> Transaction<'a> {
    /// `ttl` in seconds, 0 leaves it to the mediator.
    pub fn new(handle: &'a dyn TaskCodec, encrypted_scope: Vec<u8>, ttl: u32) -> Self {
        Self {
            handle,
            encrypted_scope,
            ttl,
        }
    }

    /// Begin, run `body`, commit. If `body` fails nothing is committed; the
    /// transaction ends with its ttl or the connection.
    pub async fn execute<T, F>(self, body: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, TaskError>>,
    {
        self.handle
            .begin_transaction(self.encrypted_scope, self.ttl)
            .await?;
        let output = body.await?;
        self.handle.commit_transaction().await?;
        Ok(output)
    }
}

/// The connection as seen by the engine.
pub trait ServerLink: Send + Sync {
    /// Hand a message to the transport. Fails if there is no connection.
    fn send_outbound(&self, message: OutboundMessage) -> Result<(), TaskError>;

    /// Close the connection and reconnect after `delay`. Must not block.
    fn restart_connection(&self, delay: Duration);
}

/// Handles inbound messages no task asked for.
#[async_trait]
pub trait IncomingMessageProcessor: Send + Sync {
    async fn process_incoming_csp_message(
        &self,
        data: Vec<u8>,
        handle: &dyn TaskCodec,
    ) -> Result<(), TaskError>;

    async fn process_incoming_reflected(
        &self,
        reflected: Reflected,
        handle: &dyn TaskCodec,
    ) -> Result<(), TaskError>;

    /// Called on receipt, outside the task queue.
    fn process_server_alert(&self, text: &str);

    /// Called on receipt, outside the task queue.
    fn process_server_error(&self, reconnect_allowed: bool, text: &str);

    async fn process_other(
        &self,
        message: InboundMessage,
        _handle: &dyn TaskCodec,
    ) -> Result<(), TaskError> {
        tracing::debug!(kind = message.kind(), "ignoring inbound message");
        Ok(())
    }
}

/// Hands out reflect ids: 0, 1, 2, ... wrapping at `u32::MAX`.
#[derive(Debug, Default)]
pub struct ReflectIdManager {
    next: AtomicU32,
}

impl ReflectIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ReflectId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// [`TaskCodec`] bound to one run of the executor.
pub(crate) struct RunnerCodec {
    pub(crate) link: Arc<dyn ServerLink>,
    pub(crate) incoming: Arc<Mutex<IncomingMessageQueue>>,
    pub(crate) processor: Arc<dyn IncomingMessageProcessor>,
    pub(crate) reflect_ids: Arc<ReflectIdManager>,
}

#[async_trait]
impl TaskCodec for RunnerCodec {
    async fn read(&self, filter: MessageFilter<'_>) -> Result<InboundMessage, TaskError> {
        let mut bypassed = Vec::new();
        let result = {
            let mut incoming = self.incoming.lock().await;
            incoming.read(filter, &mut bypassed).await
        };

        for reflected in bypassed {
            tracing::debug!(
                reflected_id = reflected.reflected_id,
                "processing bypassed reflected message"
            );
            if let Err(e) = self.processor.process_incoming_reflected(reflected, self).await {
                if e.is_network() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "bypassed reflected message failed");
            }
        }
        result
    }

    async fn write(&self, message: OutboundMessage) -> Result<(), TaskError> {
        let kind = message.kind();
        if let Err(e) = self.link.send_outbound(message) {
            tracing::debug!(kind, error = %e, "no connection, write waits for runner stop");
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn next_reflect_id(&self) -> ReflectId {
        self.reflect_ids.next_id()
    }
}
