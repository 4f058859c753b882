//! Task trait and the handle returned to whoever scheduled it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::codec::TaskCodec;
use crate::TaskError;

/// Whether a task survives a process restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    Ephemeral,
    /// Archived with this JSON state until it completes.
    Persistent(String),
}

impl Persistence {
    /// Serialize `state`; falls back to ephemeral if that fails.
    pub fn of<S: Serialize>(state: &S) -> Self {
        match serde_json::to_string(state) {
            Ok(json) => Self::Persistent(json),
            Err(e) => {
                tracing::warn!(error = %e, "task state not serializable, running ephemeral");
                Self::Ephemeral
            }
        }
    }
}

/// A unit of protocol work.
///
/// `invoke` may be called several times for the same task: after an
/// unexpected failure, and from scratch after every connection restart.
/// Implementations must be idempotent or resume from their own state.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Stable name used in logs and as the archive kind.
    fn kind(&self) -> &'static str;

    async fn invoke(&self, handle: &dyn TaskCodec) -> Result<Self::Output, TaskError>;

    fn persistence(&self) -> Persistence {
        Persistence::Ephemeral
    }

    /// Overrides the manager's attempt limit.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// Resolves once the task succeeded or failed permanently.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::Shutdown)))
    }
}

/// Type-erased task plus its completion channel.
#[async_trait]
pub(crate) trait ErasedTask: Send + Sync {
    fn kind(&self) -> &'static str;
    fn max_attempts(&self) -> Option<u32>;
    /// Run one attempt; on success the result is delivered to the handle.
    async fn run(&self, codec: &dyn TaskCodec) -> Result<(), TaskError>;
    fn complete_with_error(&self, error: TaskError);
    fn is_completed(&self) -> bool;
}

struct TypedTask<T: Task> {
    task: T,
    done: Mutex<Option<oneshot::Sender<Result<T::Output, TaskError>>>>,
}

impl<T: Task> TypedTask<T> {
    fn complete(&self, result: Result<T::Output, TaskError>) {
        let sender = match self.done.lock() {
            Ok(mut done) => done.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            // The caller may have dropped its handle
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl<T: Task> ErasedTask for TypedTask<T> {
    fn kind(&self) -> &'static str {
        self.task.kind()
    }

    fn max_attempts(&self) -> Option<u32> {
        self.task.max_attempts()
    }

    async fn run(&self, codec: &dyn TaskCodec) -> Result<(), TaskError> {
        let output = self.task.invoke(codec).await?;
        self.complete(Ok(output));
        Ok(())
    }

    fn complete_with_error(&self, error: TaskError) {
        self.complete(Err(error));
    }

    fn is_completed(&self) -> bool {
        match self.done.lock() {
            Ok(done) => done.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Entry of the local task queue.
pub(crate) struct TaskQueueElement {
    pub(crate) task: Box<dyn ErasedTask>,
    /// Set when the task is archived.
    pub(crate) archive_id: Option<i64>,
}

impl TaskQueueElement {
    pub(crate) fn new<T: Task>(task: T) -> (Self, TaskHandle<T::Output>) {
        let (tx, rx) = oneshot::channel();
        let element = Self {
            task: Box::new(TypedTask {
                task,
                done: Mutex::new(Some(tx)),
            }),
            archive_id: None,
        };
        (element, TaskHandle { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NoopCodec;

    struct Double(u32);

    #[async_trait]
    impl Task for Double {
        type Output = u32;

        fn kind(&self) -> &'static str {
            "double"
        }

        async fn invoke(&self, _handle: &dyn TaskCodec) -> Result<u32, TaskError> {
            Ok(self.0 * 2)
        }
    }

    #[tokio::test]
    async fn test_element_delivers_result() {
        let (element, handle) = TaskQueueElement::new(Double(21));
        assert!(!element.task.is_completed());
        element.task.run(&NoopCodec).await.unwrap();
        assert!(element.task.is_completed());
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_element_error_completes() {
        let (element, handle) = TaskQueueElement::new(Double(1));
        element.task.complete_with_error(TaskError::Protocol("gone".into()));
        assert!(element.task.is_completed());
        assert!(matches!(handle.await, Err(TaskError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_dropped_element_resolves_shutdown() {
        let (element, handle) = TaskQueueElement::new(Double(1));
        drop(element);
        assert!(matches!(handle.await, Err(TaskError::Shutdown)));
    }

    #[test]
    fn test_persistence_of() {
        #[derive(Serialize)]
        struct State {
            n: u32,
        }
        assert_eq!(
            Persistence::of(&State { n: 3 }),
            Persistence::Persistent(r#"{"n":3}"#.into())
        );
    }
}
