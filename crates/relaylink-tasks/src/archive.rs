//! Reloading persistent tasks from the archive.

use std::collections::HashMap;

use relaylink_storage::ArchivedTask;
use serde::de::DeserializeOwned;

use crate::task::{Task, TaskQueueElement};
use crate::TaskError;

type Decoder = Box<dyn Fn(&str) -> Result<TaskQueueElement, TaskError> + Send + Sync>;

/// Maps archived task kinds to their decoders.
#[derive(Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `kind`, which must match what `T::kind` returns.
    pub fn register<T>(&mut self, kind: &'static str) -> &mut Self
    where
        T: Task + DeserializeOwned,
    {
        self.decoders.insert(
            kind,
            Box::new(|data: &str| {
                let task: T = serde_json::from_str(data)?;
                // Nobody awaits a reloaded task
                let (element, _handle) = TaskQueueElement::new(task);
                Ok(element)
            }),
        );
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub(crate) fn decode(&self, archived: &ArchivedTask) -> Result<TaskQueueElement, TaskError> {
        let decoder = self
            .decoders
            .get(archived.kind.as_str())
            .ok_or_else(|| TaskError::UnknownKind(archived.kind.clone()))?;
        let mut element = decoder(&archived.data)?;
        element.archive_id = Some(archived.id);
        Ok(element)
    }
}
