//! Test harness for in-process relaylink-node integration tests.
//!
//! Provides MockChatServer (CSP login plus frame exchange over real TCP) and
//! TestClientBuilder / TestClient (a ServerConnection with its task manager).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relaylink_crypto::{ClientIdentity, KeyPair, PublicKey};
use relaylink_node::connection::{
    ConnectionConfig, ConnectionState, ReconnectBackoff, ServerConnection,
};
use relaylink_node::processor::NodeMessageProcessor;
use relaylink_protocol::csp::LOGIN_BOX_LEN;
use relaylink_protocol::{
    CspServerSession, FrameCodec, InboundMessage, LoginExtensions, OutboundMessage, ServerKeys,
    DEFINES,
};
use relaylink_storage::{SqliteTaskArchive, TaskArchive};
use relaylink_tasks::{TaskManager, TaskManagerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

pub const WAIT: Duration = Duration::from_secs(10);

/// Something the test wants the server to do on the live connection.
enum ServerCommand {
    Push(InboundMessage),
    Disconnect,
}

struct ServerShared {
    keypair: KeyPair,
    client: (String, PublicKey),
    auto_ack: AtomicBool,
    hellos: AtomicUsize,
    logins: AtomicUsize,
    live: Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>,
    received: mpsc::UnboundedSender<OutboundMessage>,
}

/// Chat server speaking CSP to one client at a time.
pub struct MockChatServer {
    pub addr: SocketAddr,
    shared: Arc<ServerShared>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    accept: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl MockChatServer {
    /// Accepts logins from `client` only.
    pub async fn start(client: &ClientIdentity) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            keypair: KeyPair::generate(),
            client: (client.identity().to_string(), *client.public_key()),
            auto_ack: AtomicBool::new(true),
            hellos: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            live: Mutex::new(None),
            received: received_tx,
        });

        let accept_shared = shared.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = shared.serve(stream).await {
                        tracing::debug!(error = %e, "mock server connection ended");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            shared,
            received: tokio::sync::Mutex::new(received_rx),
            accept,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        *self.shared.keypair.public_key()
    }

    /// Answer `OutgoingMessage`s with their ack (on by default).
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Client hellos seen, including failed logins.
    pub fn hello_count(&self) -> usize {
        self.shared.hellos.load(Ordering::SeqCst)
    }

    pub fn login_count(&self) -> usize {
        self.shared.logins.load(Ordering::SeqCst)
    }

    pub fn push(&self, message: InboundMessage) {
        self.command(ServerCommand::Push(message));
    }

    /// Drop the live connection from the server side.
    pub fn disconnect(&self) {
        self.command(ServerCommand::Disconnect);
    }

    fn command(&self, command: ServerCommand) {
        let live = self.shared.live.lock().unwrap();
        live.as_ref()
            .expect("no client connected")
            .send(command)
            .expect("connection task gone");
    }

    /// Next message the client sent, skipping nothing.
    pub async fn next_received(&self) -> anyhow::Result<OutboundMessage> {
        let mut received = self.received.lock().await;
        tokio::time::timeout(WAIT, received.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("server gone"))
    }

    /// Skip client messages until one matches.
    pub async fn wait_received(
        &self,
        matches: impl Fn(&OutboundMessage) -> bool,
    ) -> anyhow::Result<OutboundMessage> {
        loop {
            let message = self.next_received().await?;
            if matches(&message) {
                return Ok(message);
            }
        }
    }

    /// True if the client sent nothing for `quiet`.
    pub async fn stays_quiet(&self, quiet: Duration) -> bool {
        let mut received = self.received.lock().await;
        tokio::time::timeout(quiet, received.recv()).await.is_err()
    }

    pub async fn wait_logins(&self, n: usize) -> anyhow::Result<()> {
        wait_until(|| self.login_count() >= n).await
    }

    pub fn shutdown(self) {
        self.accept.abort();
    }
}

impl ServerShared {
    async fn serve(self: Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let (identity, client_pk) = self.client.clone();
        let permanent = KeyPair::from_secret_bytes(self.keypair.secret_bytes());
        let mut session =
            CspServerSession::new(permanent, move |id| (id == identity).then_some(client_pk));

        let mut hello = vec![0u8; DEFINES.client_hello_len];
        stream.read_exact(&mut hello).await?;
        self.hellos.fetch_add(1, Ordering::SeqCst);
        stream.write_all(&session.handle_client_hello(&hello)?).await?;

        let mut login_box = vec![0u8; LOGIN_BOX_LEN];
        stream.read_exact(&mut login_box).await?;
        let extensions_len = session.handle_login_box(&login_box)?;
        let mut extensions_box = vec![0u8; extensions_len];
        stream.read_exact(&mut extensions_box).await?;
        session.handle_extensions_box(&extensions_box)?;

        let now = chrono::Utc::now().timestamp_millis() as u64;
        stream.write_all(&session.login_ack(now, 0)?).await?;

        let (tx, mut commands) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);
        self.logins.fetch_add(1, Ordering::SeqCst);

        let mut transport = Framed::new(stream, FrameCodec::default());
        loop {
            tokio::select! {
                frame = transport.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let message = OutboundMessage::decode(session.decrypt_box(&frame?)?)?;
                    if let (true, OutboundMessage::OutgoingMessage(data)) =
                        (self.auto_ack.load(Ordering::SeqCst), &message)
                    {
                        let ack = InboundMessage::OutgoingMessageAck(data[8..24].to_vec());
                        transport.send(session.encrypt_container(&ack.to_payload())?).await?;
                    }
                    let _ = self.received.send(message);
                }
                command = commands.recv() => match command {
                    Some(ServerCommand::Push(message)) => {
                        transport.send(session.encrypt_container(&message.to_payload())?).await?;
                    }
                    Some(ServerCommand::Disconnect) | None => return Ok(()),
                },
            }
        }
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until(condition: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for condition");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Wait until the connection publishes `state`.
pub async fn wait_state(
    states: &mut watch::Receiver<ConnectionState>,
    state: ConnectionState,
) -> anyhow::Result<()> {
    tokio::time::timeout(WAIT, states.wait_for(|current| *current == state)).await??;
    Ok(())
}

/// A client node wired to a [`MockChatServer`].
pub struct TestClient {
    pub connection: ServerConnection,
    pub tasks: TaskManager,
    pub processor: Arc<NodeMessageProcessor>,
    pub archive: Arc<dyn TaskArchive>,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn wait_authenticated(&self) -> anyhow::Result<()> {
        wait_state(&mut self.connection.subscribe(), ConnectionState::Authenticated).await
    }

    pub async fn shutdown(self) {
        self.connection.stop().await;
    }

    /// Stop and hand back the archive directory for a successor client.
    pub async fn stop_keep_archive(self) -> tempfile::TempDir {
        self.connection.stop().await;
        self._tempdir
    }
}

pub struct TestClientBuilder {
    identity: Arc<ClientIdentity>,
    server_addr: String,
    server_keys: ServerKeys,
    tempdir: Option<tempfile::TempDir>,
    start: bool,
}

#[allow(dead_code)]
impl TestClientBuilder {
    pub fn new(identity: Arc<ClientIdentity>, server: &MockChatServer) -> Self {
        Self {
            identity,
            server_addr: server.addr.to_string(),
            server_keys: ServerKeys {
                primary: server.public_key(),
                alternate: None,
            },
            tempdir: None,
            start: true,
        }
    }

    pub fn server_keys(mut self, keys: ServerKeys) -> Self {
        self.server_keys = keys;
        self
    }

    /// Reuse the archive directory of an earlier client.
    pub fn tempdir(mut self, dir: tempfile::TempDir) -> Self {
        self.tempdir = Some(dir);
        self
    }

    /// Build without starting the connection.
    pub fn stopped(mut self) -> Self {
        self.start = false;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestClient> {
        let tempdir = match self.tempdir {
            Some(dir) => dir,
            None => tempfile::tempdir()?,
        };
        let archive: Arc<dyn TaskArchive> =
            Arc::new(SqliteTaskArchive::open(&tempdir.path().join("tasks.db"))?);
        let tasks = TaskManager::new(TaskManagerConfig::default(), archive.clone());
        tasks.load_archived(&relaylink_node::task_registry())?;

        let processor = Arc::new(NodeMessageProcessor::new());
        let connection = ServerConnection::new(
            ConnectionConfig {
                addr: self.server_addr,
                server_keys: self.server_keys,
                extensions: LoginExtensions::default(),
                backoff: ReconnectBackoff {
                    base: 1,
                    saturation: 0,
                    max_secs: 1,
                },
            },
            self.identity,
            tasks.clone(),
            processor.clone(),
        );
        if self.start {
            connection.start().await;
        }

        Ok(TestClient {
            connection,
            tasks,
            processor,
            archive,
            _tempdir: tempdir,
        })
    }
}

/// A fresh identity for one test.
pub fn test_identity(name: &str) -> Arc<ClientIdentity> {
    Arc::new(ClientIdentity::generate(name).unwrap())
}

/// `sender ‖ receiver ‖ message id ‖ body` as the wire expects.
pub fn message_bytes(sender: &[u8; 8], receiver: &[u8; 8], id: u8, body: &[u8]) -> Vec<u8> {
    let mut data = sender.to_vec();
    data.extend_from_slice(receiver);
    data.extend_from_slice(&[id; 8]);
    data.extend_from_slice(body);
    data
}
