//! Blocking work that does not need the connection.
//!
//! `run_before` runs on the scheduling caller, `run_in_background` on a
//! blocking worker thread (one job at a time, in scheduling order) and
//! `run_after` inside the awaiting caller. The handle resolves after
//! `run_after` returned.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::TaskError;

pub trait BackgroundTask: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> &'static str;

    fn run_before(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn run_in_background(&mut self) -> anyhow::Result<Self::Output>;

    fn run_after(&mut self, _output: &Self::Output) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct BackgroundTaskHandle<T> {
    inner: Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send>>,
}

impl<T> Future for BackgroundTaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

pub(crate) type BackgroundJob = Box<dyn FnOnce() + Send>;

/// Runs queued jobs one after another on the blocking pool.
pub(crate) fn spawn_worker() -> mpsc::UnboundedSender<BackgroundJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::error!(error = %e, "background job panicked");
            }
        }
    });
    tx
}

pub(crate) fn schedule<B: BackgroundTask>(
    worker: &mpsc::UnboundedSender<BackgroundJob>,
    mut task: B,
) -> BackgroundTaskHandle<B::Output> {
    let kind = task.kind();
    if let Err(e) = task.run_before() {
        tracing::warn!(kind, error = %e, "background task rejected before running");
        return BackgroundTaskHandle {
            inner: Box::pin(std::future::ready(Err(TaskError::Unexpected(e)))),
        };
    }

    let (done_tx, done_rx) = oneshot::channel();
    let job: BackgroundJob = Box::new(move || {
        let output = task.run_in_background();
        let _ = done_tx.send((task, output));
    });
    if worker.send(job).is_err() {
        tracing::error!(kind, "background worker gone");
    }

    BackgroundTaskHandle {
        inner: Box::pin(async move {
            let (mut task, output) = done_rx.await.map_err(|_| {
                TaskError::Unexpected(anyhow::anyhow!("background task {kind} did not finish"))
            })?;
            let output = output?;
            task.run_after(&output)?;
            Ok(output)
        }),
    }
}
