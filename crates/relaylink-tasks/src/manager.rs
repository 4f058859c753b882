//! Public face of the engine.

use std::sync::{Arc, OnceLock};

use relaylink_protocol::InboundMessage;
use relaylink_storage::TaskArchive;
use tokio::sync::mpsc;

use crate::archive::TaskRegistry;
use crate::background::{self, BackgroundJob, BackgroundTask, BackgroundTaskHandle};
use crate::codec::{IncomingMessageProcessor, ServerLink};
use crate::queue::LocalQueue;
use crate::runner::TaskRunner;
use crate::task::{Persistence, Task, TaskHandle, TaskQueueElement};
use crate::{TaskError, TaskManagerConfig};

/// Schedules tasks and drives them over whatever connection is current.
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    scheduled: mpsc::UnboundedSender<TaskQueueElement>,
    runner: TaskRunner,
    archive: Arc<dyn TaskArchive>,
    background: OnceLock<mpsc::UnboundedSender<BackgroundJob>>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, archive: Arc<dyn TaskArchive>) -> Self {
        let (scheduled, rx) = mpsc::unbounded_channel();
        let runner = TaskRunner::new(config, LocalQueue::new(rx), archive.clone());
        Self {
            inner: Arc::new(Inner {
                scheduled,
                runner,
                archive,
                background: OnceLock::new(),
            }),
        }
    }

    /// Queue a task. Never fails; problems surface through the handle.
    pub fn schedule<T: Task>(&self, task: T) -> TaskHandle<T::Output> {
        let kind = task.kind();
        let persistence = task.persistence();
        let (mut element, handle) = TaskQueueElement::new(task);

        if let Persistence::Persistent(data) = persistence {
            match self.inner.archive.add(kind, &data) {
                Ok(id) => element.archive_id = Some(id),
                Err(e) => tracing::warn!(kind, error = %e, "failed to archive task"),
            }
        }

        tracing::debug!(kind, "scheduling task");
        self.enqueue(element);
        handle
    }

    fn enqueue(&self, element: TaskQueueElement) {
        if let Err(e) = self.inner.scheduled.send(element) {
            // Dropping the element resolves its handle with `Shutdown`
            tracing::error!(kind = e.0.task.kind(), "task queue closed");
        }
    }

    /// Run blocking work off the caller's thread; see [`BackgroundTask`].
    pub fn schedule_background<B: BackgroundTask>(&self, task: B) -> BackgroundTaskHandle<B::Output> {
        let worker = self.inner.background.get_or_init(background::spawn_worker);
        background::schedule(worker, task)
    }

    /// Re-queue every archived task `registry` knows. Returns how many were
    /// queued; unknown or undecodable entries are left in the archive.
    pub fn load_archived(&self, registry: &TaskRegistry) -> Result<usize, TaskError> {
        let mut loaded = 0;
        for archived in self.inner.archive.load_all()? {
            match registry.decode(&archived) {
                Ok(element) => {
                    self.enqueue(element);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(id = archived.id, kind = %archived.kind, error = %e, "skipping archived task");
                }
            }
        }
        tracing::info!(loaded, "loaded archived tasks");
        Ok(loaded)
    }

    /// Start (or restart) executing tasks against a new connection.
    pub async fn start_running_tasks(
        &self,
        link: Arc<dyn ServerLink>,
        processor: Arc<dyn IncomingMessageProcessor>,
    ) {
        self.inner.runner.start(link, processor).await;
    }

    /// Stop executing; the running task is resumed on the next start.
    pub async fn pause_running_tasks(&self) {
        self.inner.runner.stop().await;
    }

    pub fn process_inbound_message(&self, message: InboundMessage) {
        self.inner.runner.process_inbound_message(message);
    }

    pub fn is_running(&self) -> bool {
        self.inner.runner.is_running()
    }
}
