//! Relaylink Node -- library crate for the chat client node.
//!
//! Re-exports the connection, configuration and task modules so the binary
//! and the integration tests share one wiring.

pub mod config;
pub mod connection;
pub mod linking;
pub mod outgoing;
pub mod processor;

use std::path::PathBuf;

use relaylink_tasks::TaskRegistry;

/// Registry of every persistent task kind the node knows how to reload.
pub fn task_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register::<outgoing::OutgoingMessageTask>(outgoing::OutgoingMessageTask::KIND);
    registry
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
