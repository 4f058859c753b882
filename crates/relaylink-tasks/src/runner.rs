//! Executor: runs one task at a time against the current connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaylink_protocol::InboundMessage;
use relaylink_storage::TaskArchive;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::codec::{IncomingMessageProcessor, ReflectIdManager, RunnerCodec, ServerLink};
use crate::queue::{IncomingMessageQueue, LocalQueue};
use crate::task::TaskQueueElement;
use crate::{TaskError, TaskManagerConfig};

struct InboundRoute {
    tx: mpsc::UnboundedSender<InboundMessage>,
    processor: Arc<dyn IncomingMessageProcessor>,
}

struct RunningExecutor {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the local queue across connections and the executor of the
/// current one.
pub(crate) struct TaskRunner {
    config: TaskManagerConfig,
    local: Arc<Mutex<LocalQueue>>,
    archive: Arc<dyn TaskArchive>,
    reflect_ids: Arc<ReflectIdManager>,
    reconnect_delay_ms: Arc<AtomicU64>,
    inbound: std::sync::Mutex<Option<InboundRoute>>,
    executor: Mutex<Option<RunningExecutor>>,
}

impl TaskRunner {
    pub(crate) fn new(
        config: TaskManagerConfig,
        local: LocalQueue,
        archive: Arc<dyn TaskArchive>,
    ) -> Self {
        let reconnect_delay_ms = Arc::new(AtomicU64::new(config.reconnect_min_delay_ms));
        Self {
            config,
            local: Arc::new(Mutex::new(local)),
            archive,
            reflect_ids: Arc::new(ReflectIdManager::new()),
            reconnect_delay_ms,
            inbound: std::sync::Mutex::new(None),
            executor: Mutex::new(None),
        }
    }

    fn route(&self) -> std::sync::MutexGuard<'_, Option<InboundRoute>> {
        match self.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.route().is_some()
    }

    /// Start executing against a fresh connection. Any previous executor is
    /// stopped and unprocessed inbound messages are discarded.
    pub(crate) async fn start(
        &self,
        link: Arc<dyn ServerLink>,
        processor: Arc<dyn IncomingMessageProcessor>,
    ) {
        let mut executor = self.executor.lock().await;
        if let Some(running) = executor.take() {
            running.shutdown().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let incoming = Arc::new(Mutex::new(IncomingMessageQueue::new(rx)));
        *self.route() = Some(InboundRoute {
            tx,
            processor: processor.clone(),
        });

        let executor_loop = ExecutorLoop {
            config: self.config.clone(),
            local: self.local.clone(),
            archive: self.archive.clone(),
            reconnect_delay_ms: self.reconnect_delay_ms.clone(),
            codec: RunnerCodec {
                link,
                incoming,
                processor,
                reflect_ids: self.reflect_ids.clone(),
            },
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx => tracing::debug!("task executor paused"),
                _ = executor_loop.run() => {}
            }
        });
        *executor = Some(RunningExecutor {
            stop: stop_tx,
            join,
        });
        tracing::info!("task runner started");
    }

    /// Pause execution. The running task is cancelled and stays queued.
    pub(crate) async fn stop(&self) {
        self.route().take();
        if let Some(running) = self.executor.lock().await.take() {
            running.shutdown().await;
            tracing::info!("task runner stopped");
        }
    }

    /// Route a message from the connection into the engine.
    pub(crate) fn process_inbound_message(&self, message: InboundMessage) {
        let route = self.route();
        let Some(route) = route.as_ref() else {
            tracing::debug!(kind = message.kind(), "no task runner active, dropping inbound message");
            return;
        };
        match message {
            InboundMessage::ServerAlert(text) => route.processor.process_server_alert(&text),
            InboundMessage::ServerError {
                reconnect_allowed,
                text,
            } => route.processor.process_server_error(reconnect_allowed, &text),
            message => {
                if let Err(e) = route.tx.send(message) {
                    tracing::debug!(kind = e.0.kind(), "executor gone, dropping inbound message");
                }
            }
        }
    }
}

impl RunningExecutor {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "task executor panicked");
        }
    }
}

// ============================================================================
// Executor loop
// ============================================================================

struct ExecutorLoop {
    config: TaskManagerConfig,
    local: Arc<Mutex<LocalQueue>>,
    archive: Arc<dyn TaskArchive>,
    reconnect_delay_ms: Arc<AtomicU64>,
    codec: RunnerCodec,
}

impl ExecutorLoop {
    async fn run(self) {
        loop {
            let executor = Executor {
                config: &self.config,
                local: self.local.clone().lock_owned().await,
                archive: self.archive.as_ref(),
                reconnect_delay_ms: &self.reconnect_delay_ms,
                codec: &self.codec,
            };
            match executor.run().await {
                Err(TaskError::ConnectionStopped) => {
                    tracing::info!("connection stopped, waiting for restart");
                    return;
                }
                Err(TaskError::Protocol(reason)) => {
                    let delay = self.reconnect_delay_ms.load(Ordering::Relaxed);
                    tracing::warn!(reason = %reason, delay_ms = delay, "protocol error, restarting connection");
                    self.codec.link.restart_connection(Duration::from_millis(delay));
                    let next = delay
                        .saturating_mul(2)
                        .min(self.config.reconnect_max_delay_ms);
                    self.reconnect_delay_ms.store(next, Ordering::Relaxed);
                    return;
                }
                Err(TaskError::Shutdown) => {
                    tracing::debug!("task manager dropped, executor exiting");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "task executor failed, restarting it");
                }
                Ok(()) => return,
            }
        }
    }
}

enum Next {
    Incoming(InboundMessage),
    Local,
}

struct Executor<'a> {
    config: &'a TaskManagerConfig,
    local: OwnedMutexGuard<LocalQueue>,
    archive: &'a dyn TaskArchive,
    reconnect_delay_ms: &'a AtomicU64,
    codec: &'a RunnerCodec,
}

impl Executor<'_> {
    /// Runs until a network error or until every task manager handle is gone.
    async fn run(mut self) -> Result<(), TaskError> {
        loop {
            match self.next().await? {
                Next::Incoming(message) => self.process_incoming(message).await?,
                Next::Local => self.run_front().await?,
            }
        }
    }

    /// Inbound messages first, then the local queue.
    async fn next(&mut self) -> Result<Next, TaskError> {
        loop {
            let mut incoming = self.codec.incoming.lock().await;
            if let Some(message) = incoming.try_next()? {
                return Ok(Next::Incoming(message));
            }
            self.local.drain_scheduled();
            if !self.local.pending.is_empty() {
                return Ok(Next::Local);
            }

            tokio::select! {
                element = self.local.rx.recv() => match element {
                    Some(element) => self.local.pending.push_back(element),
                    None => return Err(TaskError::Shutdown),
                },
                message = incoming.rx.recv() => match message {
                    Some(message) => return Ok(Next::Incoming(message)),
                    None => return Err(TaskError::ConnectionStopped),
                },
            }
        }
    }

    async fn run_front(&mut self) -> Result<(), TaskError> {
        let mut attempts = 0u32;
        loop {
            let Some(element) = self.local.pending.front() else {
                return Ok(());
            };
            if element.task.is_completed() {
                self.finish_front();
                return Ok(());
            }
            let kind = element.task.kind();
            let max_attempts = element
                .task
                .max_attempts()
                .unwrap_or(self.config.max_attempts)
                .max(1);

            attempts += 1;
            tracing::debug!(kind, attempt = attempts, "running task");
            let result = element.task.run(self.codec).await;
            match result {
                Ok(()) => {
                    tracing::debug!(kind, "task completed");
                    self.finish_front();
                    self.reconnect_delay_ms
                        .store(self.config.reconnect_min_delay_ms, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_network() => {
                    tracing::info!(kind, error = %e, "task interrupted");
                    return Err(e);
                }
                Err(e) if attempts >= max_attempts => {
                    tracing::error!(kind, attempts, error = %e, "task failed permanently");
                    if let Some(element) = self.finish_front() {
                        element.task.complete_with_error(e);
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(kind, attempt = attempts, max_attempts, error = %e, "task failed, retrying");
                }
            }
        }
    }

    /// Pop the front element and drop it from the archive.
    fn finish_front(&mut self) -> Option<TaskQueueElement> {
        let element = self.local.pending.pop_front()?;
        if let Some(id) = element.archive_id {
            if let Err(e) = self.archive.remove(id) {
                tracing::warn!(id, error = %e, "failed to remove archived task");
            }
        }
        Some(element)
    }

    async fn process_incoming(&mut self, message: InboundMessage) -> Result<(), TaskError> {
        let kind = message.kind();
        let processor = self.codec.processor.clone();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = match &message {
                InboundMessage::IncomingMessage(data) => {
                    processor
                        .process_incoming_csp_message(data.clone(), self.codec)
                        .await
                }
                InboundMessage::Reflected(reflected) => {
                    processor
                        .process_incoming_reflected(reflected.clone(), self.codec)
                        .await
                }
                other => processor.process_other(other.clone(), self.codec).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_network() => return Err(e),
                Err(e) if attempts >= self.config.max_attempts.max(1) => {
                    tracing::error!(kind, attempts, error = %e, "dropping inbound message");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(kind, attempt = attempts, error = %e, "inbound message failed, retrying");
                }
            }
        }
    }
}
