//! Local task queue and the per-connection incoming message queue.

use std::collections::VecDeque;

use relaylink_protocol::{InboundMessage, Reflected};
use tokio::sync::mpsc;

use crate::codec::{MessageFilter, MessageFilterInstruction};
use crate::task::TaskQueueElement;
use crate::TaskError;

/// Scheduled tasks. The front element stays queued until it completes, so a
/// paused task is resumed first on the next connection.
pub(crate) struct LocalQueue {
    pub(crate) rx: mpsc::UnboundedReceiver<TaskQueueElement>,
    pub(crate) pending: VecDeque<TaskQueueElement>,
}

impl LocalQueue {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<TaskQueueElement>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    /// Move everything already scheduled into `pending`.
    pub(crate) fn drain_scheduled(&mut self) {
        while let Ok(element) = self.rx.try_recv() {
            self.pending.push_back(element);
        }
    }
}

/// Inbound messages of one connection plus the backlog of messages a
/// reading task did not want.
pub(crate) struct IncomingMessageQueue {
    pub(crate) rx: mpsc::UnboundedReceiver<InboundMessage>,
    pub(crate) backlog: VecDeque<InboundMessage>,
}

impl IncomingMessageQueue {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        Self {
            rx,
            backlog: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Next message for the executor when no task is running.
    pub(crate) fn try_next(&mut self) -> Result<Option<InboundMessage>, TaskError> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(message));
        }
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TaskError::ConnectionStopped),
        }
    }

    /// Return the first message `filter` accepts. Reflected messages the
    /// filter does not want are pushed to `bypassed`; the caller processes
    /// them once the read is over.
    pub(crate) async fn read(
        &mut self,
        filter: MessageFilter<'_>,
        bypassed: &mut Vec<Reflected>,
    ) -> Result<InboundMessage, TaskError> {
        let mut index = 0;
        while index < self.backlog.len() {
            match filter(&self.backlog[index]) {
                MessageFilterInstruction::Accept => {
                    if let Some(message) = self.backlog.remove(index) {
                        return Ok(message);
                    }
                }
                MessageFilterInstruction::Reject => {
                    let kind = self.backlog.remove(index).map(|m| m.kind()).unwrap_or("none");
                    return Err(rejected(kind));
                }
                MessageFilterInstruction::BypassOrBacklog => index += 1,
            }
        }

        loop {
            let message = self.rx.recv().await.ok_or(TaskError::ConnectionStopped)?;
            match filter(&message) {
                MessageFilterInstruction::Accept => return Ok(message),
                MessageFilterInstruction::Reject => return Err(rejected(message.kind())),
                MessageFilterInstruction::BypassOrBacklog => match message {
                    InboundMessage::Reflected(reflected) => bypassed.push(reflected),
                    other => {
                        tracing::trace!(kind = other.kind(), "backlogging inbound message");
                        self.backlog.push_back(other);
                    }
                },
            }
        }
    }
}

fn rejected(kind: &str) -> TaskError {
    TaskError::Protocol(format!("unexpected inbound message: {kind}"))
}
