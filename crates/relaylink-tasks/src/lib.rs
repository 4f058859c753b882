//! Relaylink Tasks -- serialized execution of protocol tasks against the server connection.
//!
//! - Exactly one task body runs at a time. Tasks run in scheduling order;
//!   inbound messages nobody asked for run first as incoming-message tasks.
//! - A task talks to the connection only through its [`TaskCodec`].
//! - Unexpected failures are retried up to `max_attempts`; protocol failures
//!   restart the connection with a doubling delay; a stopped connection
//!   pauses the task until the runner is started again.
//! - While a task waits inside `read`, reflected device-group messages are
//!   bypassed to the incoming message processor and everything else is
//!   backlogged in arrival order.
//! - Persistent tasks are archived and reloaded via a [`TaskRegistry`].
//! - Device-group transactions ([`Transaction`]) retry after a rejection
//!   once the competing transaction has ended.

use serde::{Deserialize, Serialize};

pub mod archive;
pub mod background;
pub mod codec;
pub mod manager;
mod queue;
mod runner;
pub mod task;

pub use archive::TaskRegistry;
pub use background::{BackgroundTask, BackgroundTaskHandle};
pub use codec::{
    IncomingMessageProcessor, MessageFilter, MessageFilterInstruction, ReflectIdManager, ServerLink,
    TaskCodec, Transaction,
};
pub use manager::TaskManager;
pub use task::{Persistence, Task, TaskHandle};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The server violated the protocol; the connection must be restarted.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Raised by the engine when the connection went away mid-task.
    #[error("connection stopped")]
    ConnectionStopped,
    #[error("task manager shut down")]
    Shutdown,
    #[error("unknown task kind: {0}")]
    UnknownKind(String),
    #[error("storage error: {0}")]
    Storage(#[from] relaylink_storage::StorageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl TaskError {
    /// Network errors end the current executor instead of counting as a
    /// failed attempt.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::ConnectionStopped)
    }
}

/// Task engine tuning, the `[tasks]` section of the node config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    /// Attempts before an unexpectedly failing task is surfaced to its caller.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    relaylink_protocol::DEFINES.max_task_attempts
}

fn default_reconnect_min_delay_ms() -> u64 {
    relaylink_protocol::DEFINES.task_reconnect_min_delay_ms
}

fn default_reconnect_max_delay_ms() -> u64 {
    relaylink_protocol::DEFINES.task_reconnect_max_delay_ms
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors() {
        assert!(TaskError::Protocol("x".into()).is_network());
        assert!(TaskError::ConnectionStopped.is_network());
        assert!(!TaskError::Shutdown.is_network());
        assert!(!TaskError::Unexpected(anyhow::anyhow!("boom")).is_network());
    }

    #[test]
    fn test_default_config() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.reconnect_min_delay_ms, 2_000);
        assert_eq!(config.reconnect_max_delay_ms, 512_000);
    }

    #[test]
    fn test_partial_config() {
        let config: TaskManagerConfig = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.reconnect_min_delay_ms, 2_000);
    }
}
