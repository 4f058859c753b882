//! Candidate rendezvous paths.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, OnceCell};

use crate::{PathId, RendezvousError};

const READ_CHUNK: usize = 16 * 1024;

/// A bidirectional byte pipe between two devices.
///
/// `read` yields `None` once the remote end hung up or the path was closed
/// locally. Closing is idempotent and wakes any pending `read`.
#[async_trait]
pub trait RendezvousPath: Send + Sync {
    fn pid(&self) -> PathId;

    /// Establish the underlying transport. Paths that are connected from
    /// construction return immediately.
    async fn connect(&self) -> Result<(), RendezvousError>;

    async fn read(&self) -> Result<Option<Vec<u8>>, RendezvousError>;

    async fn write(&self, data: &[u8]) -> Result<(), RendezvousError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the path is closed.
    async fn closed(&self);
}

/// Path over any async byte stream.
pub struct StreamPath<S> {
    pid: PathId,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: watch::Sender<bool>,
}

impl<S> StreamPath<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(pid: PathId, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            pid,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: watch::Sender::new(false),
        }
    }

    fn mark_closed(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }
}

#[async_trait]
impl<S> RendezvousPath for StreamPath<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn pid(&self) -> PathId {
        self.pid
    }

    async fn connect(&self) -> Result<(), RendezvousError> {
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, RendezvousError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        tokio::select! {
            _ = closed.changed() => Ok(None),
            n = reader.read(&mut buf) => {
                let n = match n {
                    Ok(n) => n,
                    Err(e) => {
                        self.mark_closed();
                        return Err(e.into());
                    }
                };
                if n == 0 {
                    tracing::debug!(pid = self.pid, "rendezvous path reached eof");
                    self.mark_closed();
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), RendezvousError> {
        if self.is_closed() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(pid = self.pid, error = %e, "shutdown of closed path failed");
        }
        tracing::debug!(pid = self.pid, "rendezvous path closed");
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        // Sender lives in self, so wait_for cannot fail here.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

enum Endpoint {
    Dial(SocketAddr),
    /// Accept the first incoming connection.
    Listen(TcpListener),
    Accepted,
}

/// TCP path, established on `connect` by dialing or by accepting.
pub struct TcpPath {
    pid: PathId,
    endpoint: Endpoint,
    inner: OnceCell<StreamPath<TcpStream>>,
}

impl TcpPath {
    pub fn new(pid: PathId, addr: SocketAddr) -> Self {
        Self {
            pid,
            endpoint: Endpoint::Dial(addr),
            inner: OnceCell::new(),
        }
    }

    /// Path whose `connect` waits for the peer to dial `listener`.
    pub fn listen(pid: PathId, listener: TcpListener) -> Self {
        Self {
            pid,
            endpoint: Endpoint::Listen(listener),
            inner: OnceCell::new(),
        }
    }

    /// Wrap an already accepted connection.
    pub fn from_stream(pid: PathId, stream: TcpStream) -> Self {
        Self {
            pid,
            endpoint: Endpoint::Accepted,
            inner: OnceCell::new_with(Some(StreamPath::new(pid, stream))),
        }
    }

    fn connected(&self) -> Result<&StreamPath<TcpStream>, RendezvousError> {
        self.inner
            .get()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected).into())
    }

    async fn establish(&self) -> Result<TcpStream, RendezvousError> {
        let stream = match &self.endpoint {
            Endpoint::Dial(addr) => {
                let stream = TcpStream::connect(*addr).await?;
                tracing::debug!(pid = self.pid, %addr, "rendezvous path connected");
                stream
            }
            Endpoint::Listen(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(pid = self.pid, %peer, "rendezvous path accepted");
                stream
            }
            Endpoint::Accepted => {
                return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into())
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl RendezvousPath for TcpPath {
    fn pid(&self) -> PathId {
        self.pid
    }

    async fn connect(&self) -> Result<(), RendezvousError> {
        self.inner
            .get_or_try_init(|| async {
                let stream = self.establish().await?;
                Ok::<_, RendezvousError>(StreamPath::new(self.pid, stream))
            })
            .await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, RendezvousError> {
        self.connected()?.read().await
    }

    async fn write(&self, data: &[u8]) -> Result<(), RendezvousError> {
        self.connected()?.write(data).await
    }

    async fn close(&self) {
        if let Some(path) = self.inner.get() {
            path.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.get().is_some_and(|path| path.is_closed())
    }

    async fn closed(&self) {
        match self.inner.get() {
            Some(path) => path.closed().await,
            None => std::future::pending().await,
        }
    }
}
