//! Merges inbound bytes of all racing paths into one tagged stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaylink_protocol::DEFINES;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::path::RendezvousPath;
use crate::{PathId, RendezvousError, RendezvousProtocolError};

const EVENT_QUEUE: usize = 64;

#[derive(Debug)]
enum PathEvent {
    Chunk(PathId, Vec<u8>),
    Closed(PathId),
}

fn spawn_reader(path: Arc<dyn RendezvousPath>, tx: mpsc::Sender<PathEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = path.pid();
        loop {
            match path.read().await {
                Ok(Some(chunk)) => {
                    if tx.send(PathEvent::Chunk(pid, chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(pid, error = %e, "rendezvous path read failed");
                    path.close().await;
                    break;
                }
            }
        }
        let _ = tx.send(PathEvent::Closed(pid)).await;
    })
}

/// All candidate paths of one rendezvous, with one reader task each.
pub struct MultiplexedRendezvousPath {
    paths: HashMap<PathId, Arc<dyn RendezvousPath>>,
    readers: HashMap<PathId, JoinHandle<()>>,
    events: mpsc::Receiver<PathEvent>,
}

impl MultiplexedRendezvousPath {
    /// [`connect_within`](Self::connect_within) the default path timeout.
    pub async fn connect(paths: Vec<Arc<dyn RendezvousPath>>) -> Result<Self, RendezvousError> {
        let timeout = Duration::from_millis(DEFINES.rendezvous_connect_timeout_ms);
        Self::connect_within(paths, timeout).await
    }

    /// Connect every path concurrently. Paths that fail to connect within
    /// `timeout` are dropped; at least one must succeed.
    pub async fn connect_within(
        paths: Vec<Arc<dyn RendezvousPath>>,
        timeout: Duration,
    ) -> Result<Self, RendezvousError> {
        if paths.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no rendezvous paths",
            )
            .into());
        }

        let results = futures::future::join_all(paths.iter().map(|path| async move {
            match tokio::time::timeout(timeout, path.connect()).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()),
            }
        }))
        .await;
        let (tx, events) = mpsc::channel(EVENT_QUEUE);
        let mut connected = HashMap::new();
        let mut readers = HashMap::new();
        for (path, result) in paths.into_iter().zip(results) {
            let pid = path.pid();
            if let Err(e) = result {
                tracing::warn!(pid, error = %e, "rendezvous path failed to connect");
                continue;
            }
            readers.insert(pid, spawn_reader(path.clone(), tx.clone()));
            connected.insert(pid, path);
        }
        if connected.is_empty() {
            return Err(RendezvousError::AllPathsClosed);
        }
        tracing::info!(pids = ?connected.keys().collect::<Vec<_>>(), "rendezvous paths connected");

        Ok(Self {
            paths: connected,
            readers,
            events,
        })
    }

    /// Ids of the paths still open.
    pub fn pids(&self) -> Vec<PathId> {
        let mut pids: Vec<_> = self.paths.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Next chunk from any path.
    pub async fn read(&mut self) -> Result<(PathId, Vec<u8>), RendezvousError> {
        loop {
            if self.paths.is_empty() {
                return Err(RendezvousError::AllPathsClosed);
            }
            match self.events.recv().await {
                Some(PathEvent::Chunk(pid, chunk)) => {
                    if self.paths.contains_key(&pid) {
                        return Ok((pid, chunk));
                    }
                }
                Some(PathEvent::Closed(pid)) => {
                    tracing::debug!(pid, "rendezvous path closed by remote");
                    self.paths.remove(&pid);
                    self.readers.remove(&pid);
                }
                None => return Err(RendezvousError::AllPathsClosed),
            }
        }
    }

    /// Write to `pid`. Dropped silently if that path is gone while others
    /// remain.
    pub async fn write(&self, pid: PathId, data: &[u8]) -> Result<(), RendezvousError> {
        if self.paths.values().all(|path| path.is_closed()) {
            return Err(RendezvousError::AllPathsClosed);
        }
        let Some(path) = self.paths.get(&pid).filter(|path| !path.is_closed()) else {
            tracing::debug!(pid, "dropping write to closed rendezvous path");
            return Ok(());
        };
        path.write(data).await
    }

    /// Close one path and forget it. Unknown pids are ignored.
    pub async fn close_path(&mut self, pid: PathId) {
        if let Some(reader) = self.readers.remove(&pid) {
            reader.abort();
        }
        if let Some(path) = self.paths.remove(&pid) {
            path.close().await;
        }
    }

    /// Keep `pid`, close every other path and stop its reader.
    pub async fn into_nominated(mut self, pid: PathId) -> Result<NominatedPath, RendezvousError> {
        let path = self
            .paths
            .remove(&pid)
            .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?;
        let reader = self
            .readers
            .remove(&pid)
            .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?;
        self.close_all().await;
        Ok(NominatedPath {
            pid,
            path,
            reader,
            events: std::mem::replace(&mut self.events, mpsc::channel(1).1),
        })
    }

    /// Close every remaining path.
    pub async fn close_all(&mut self) {
        for reader in self.readers.values() {
            reader.abort();
        }
        futures::future::join_all(self.paths.values().map(|path| path.close())).await;
        self.readers.clear();
        self.paths.clear();
    }
}

impl Drop for MultiplexedRendezvousPath {
    fn drop(&mut self) {
        for reader in self.readers.values() {
            reader.abort();
        }
    }
}

/// The single surviving path after nomination.
pub struct NominatedPath {
    pid: PathId,
    path: Arc<dyn RendezvousPath>,
    reader: JoinHandle<()>,
    events: mpsc::Receiver<PathEvent>,
}

impl NominatedPath {
    pub fn pid(&self) -> PathId {
        self.pid
    }

    /// Next chunk, or `None` once the path closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.events.recv().await? {
                PathEvent::Chunk(pid, chunk) if pid == self.pid => return Some(chunk),
                PathEvent::Closed(pid) if pid == self.pid => return None,
                // leftovers of dropped paths
                _ => continue,
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), RendezvousError> {
        self.path.write(data).await
    }

    pub fn is_closed(&self) -> bool {
        self.path.is_closed()
    }

    pub async fn close(&self) {
        self.path.close().await;
    }
}

impl Drop for NominatedPath {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
