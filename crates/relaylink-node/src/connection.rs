//! Chat server connection -- TCP transport, CSP login and frame dispatch.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticated -> Disconnected
//! ```
//!
//! Each attempt gets a fresh [`CspSession`]. Once authenticated the task
//! manager is started against this connection; on any disconnect it is
//! paused (the running task keeps its place) and the loop reconnects with a
//! bounded exponential backoff.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relaylink_crypto::ClientIdentity;
use relaylink_protocol::{
    CspError, CspSession, FrameCodec, InboundMessage, LoginAck, LoginExtensions, LoginStep,
    OutboundMessage, ProtocolError, ServerKeys, DEFINES,
};
use relaylink_tasks::{IncomingMessageProcessor, ServerLink, TaskError, TaskManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Csp(#[from] CspError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed by server")]
    Closed,
    #[error("unexpected login step")]
    UnexpectedLoginStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// `min(base^min(attempts - 1, saturation), max_secs)` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub base: u64,
    pub saturation: u32,
    pub max_secs: u64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: DEFINES.reconnect_backoff_base,
            saturation: DEFINES.reconnect_backoff_saturation,
            max_secs: DEFINES.reconnect_backoff_max_secs,
        }
    }
}

impl ReconnectBackoff {
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(self.saturation);
        let secs = self.base.saturating_pow(exponent).min(self.max_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port` of the chat server.
    pub addr: String,
    pub server_keys: ServerKeys,
    pub extensions: LoginExtensions,
    pub backoff: ReconnectBackoff,
}

#[derive(Debug)]
enum Control {
    Restart(Duration),
    Stop,
}

/// Why a connection attempt ended.
#[derive(Debug)]
enum Disconnect {
    Stopped,
    Restart(Duration),
    Failed(ConnectionError),
}

type Transport = Framed<TcpStream, FrameCodec>;

struct Shared {
    config: ConnectionConfig,
    identity: Arc<ClientIdentity>,
    tasks: TaskManager,
    processor: Arc<dyn IncomingMessageProcessor>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundMessage>>>,
    control: mpsc::UnboundedSender<Control>,
    reconnect_allowed: AtomicBool,
}

/// Long-lived connection to the chat server.
pub struct ServerConnection {
    shared: Arc<Shared>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnection {
    pub fn new(
        config: ConnectionConfig,
        identity: Arc<ClientIdentity>,
        tasks: TaskManager,
        processor: Arc<dyn IncomingMessageProcessor>,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                identity,
                tasks,
                processor,
                state: watch::Sender::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                control,
                reconnect_allowed: AtomicBool::new(true),
            }),
            control_rx: Mutex::new(Some(control_rx)),
            join: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Listen for state changes. Every change is published once.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_reconnect_allowed(&self) -> bool {
        self.shared.reconnect_allowed.load(Ordering::SeqCst)
    }

    /// Spawn the connection loop. A connection can only be started once.
    pub async fn start(&self) {
        let Some(control_rx) = self.control_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            tracing::warn!("connection already started");
            return;
        };
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.run(control_rx).await });
        *self.join.lock().await = Some(handle);
    }

    /// Close the connection after `delay` and reconnect.
    pub fn restart(&self, delay: Duration) {
        self.shared.restart_connection(delay);
    }

    /// Disable reconnecting, close the socket and wait for the loop to end.
    pub async fn stop(&self) {
        self.shared.reconnect_allowed.store(false, Ordering::SeqCst);
        let _ = self.shared.control.send(Control::Stop);
        if let Some(handle) = self.join.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "connection loop panicked");
            }
        }
    }
}

impl ServerLink for Shared {
    fn send_outbound(&self, message: OutboundMessage) -> Result<(), TaskError> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TaskError::ConnectionStopped)?;
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TaskError::ConnectionStopped),
            None => Err(TaskError::ConnectionStopped),
        }
    }

    fn restart_connection(&self, delay: Duration) {
        tracing::info!(delay_ms = delay.as_millis() as u64, "connection restart requested");
        let _ = self.control.send(Control::Restart(delay));
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::info!(%state, "connection state changed");
        }
    }

    async fn run(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut attempts = 0u32;
        loop {
            let disconnect = self.connect_once(&mut control, &mut attempts).await;
            self.teardown().await;

            let delay = match disconnect {
                Disconnect::Stopped => break,
                Disconnect::Restart(delay) => delay,
                Disconnect::Failed(e) => {
                    attempts = attempts.saturating_add(1);
                    let delay = self.config.backoff.delay(attempts);
                    tracing::warn!(error = %e, attempts, delay_secs = delay.as_secs(), "connection failed");
                    delay
                }
            };
            if !self.reconnect_allowed.load(Ordering::SeqCst) {
                tracing::info!("reconnect disabled, connection loop ends");
                break;
            }

            if !wait_before_reconnect(&mut control, delay).await {
                break;
            }
        }
        tracing::info!("connection loop stopped");
    }

    /// One physical connection: connect, log in, then pump frames until it ends.
    async fn connect_once(
        self: &Arc<Self>,
        control: &mut mpsc::UnboundedReceiver<Control>,
        attempts: &mut u32,
    ) -> Disconnect {
        let established = tokio::select! {
            result = self.establish() => result,
            request = control.recv() => return Self::on_control(request),
        };
        let (session, stream) = match established {
            Ok(established) => established,
            Err(e) => return Disconnect::Failed(e),
        };

        *attempts = 0;
        let (tx, rx) = mpsc::unbounded_channel();
        match self.outbound.lock() {
            Ok(mut outbound) => *outbound = Some(tx),
            Err(_) => return Disconnect::Stopped,
        }
        self.set_state(ConnectionState::Authenticated);
        self.tasks
            .start_running_tasks(self.clone(), self.processor.clone())
            .await;

        let transport = Framed::new(stream, FrameCodec::default());
        match self.pump(session, transport, rx, control).await {
            Ok(disconnect) => disconnect,
            Err(e) => Disconnect::Failed(e),
        }
    }

    fn on_control(request: Option<Control>) -> Disconnect {
        match request {
            Some(Control::Restart(delay)) => Disconnect::Restart(delay),
            Some(Control::Stop) | None => Disconnect::Stopped,
        }
    }

    async fn establish(&self) -> Result<(CspSession, TcpStream), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        let mut stream = TcpStream::connect(&self.config.addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        self.set_state(ConnectionState::Connected);
        tracing::debug!(addr = %self.config.addr, "transport connected");

        let mut session = CspSession::new(
            self.identity.clone(),
            self.config.server_keys.clone(),
            self.config.extensions.clone(),
        );
        let ack = login(&mut session, &mut stream).await?;
        tracing::info!(
            identity = self.identity.identity(),
            queued_messages = ack.queued_messages,
            server_time_ms = ack.server_time_ms,
            "logged in"
        );
        Ok((session, stream))
    }

    async fn pump(
        &self,
        mut session: CspSession,
        mut transport: Transport,
        mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<Disconnect, ConnectionError> {
        loop {
            tokio::select! {
                frame = transport.next() => {
                    let frame = frame.ok_or(ConnectionError::Closed)??;
                    let payload = session.decrypt_box(&frame)?;
                    let message = InboundMessage::decode(payload)?;
                    self.dispatch(message, &mut session, &mut transport).await?;
                }
                Some(message) = outbound.recv() => {
                    send(&mut session, &mut transport, &message).await?;
                }
                request = control.recv() => return Ok(Self::on_control(request)),
            }
        }
    }

    async fn dispatch(
        &self,
        message: InboundMessage,
        session: &mut CspSession,
        transport: &mut Transport,
    ) -> Result<(), ConnectionError> {
        tracing::trace!(kind = message.kind(), "inbound message");
        match message {
            InboundMessage::EchoRequest(data) => {
                send(session, transport, &OutboundMessage::EchoReply(data)).await
            }
            InboundMessage::ServerError {
                reconnect_allowed,
                text,
            } => {
                if !reconnect_allowed {
                    tracing::warn!("server disallowed reconnecting");
                    self.reconnect_allowed.store(false, Ordering::SeqCst);
                }
                self.tasks
                    .process_inbound_message(InboundMessage::ServerError {
                        reconnect_allowed,
                        text,
                    });
                Ok(())
            }
            other => {
                self.tasks.process_inbound_message(other);
                Ok(())
            }
        }
    }

    async fn teardown(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        self.set_state(ConnectionState::Disconnected);
        self.tasks.pause_running_tasks().await;
    }
}

async fn send(
    session: &mut CspSession,
    transport: &mut Transport,
    message: &OutboundMessage,
) -> Result<(), ConnectionError> {
    tracing::trace!(kind = message.kind(), "outbound message");
    let sealed = session.encrypt_container(&message.to_payload())?;
    transport.send(sealed).await?;
    Ok(())
}

/// Sleep out `delay`. Restart requests arriving meanwhile can only push the
/// reconnect further out. Returns false if the loop should stop instead.
async fn wait_before_reconnect(
    control: &mut mpsc::UnboundedReceiver<Control>,
    delay: Duration,
) -> bool {
    let mut deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            request = control.recv() => match request {
                Some(Control::Restart(requested)) => {
                    deadline = deadline.max(tokio::time::Instant::now() + requested);
                }
                Some(Control::Stop) | None => return false,
            },
        }
    }
}

/// Run the CSP login over the raw stream.
async fn login(session: &mut CspSession, stream: &mut TcpStream) -> Result<LoginAck, ConnectionError> {
    let hello = session.start_login()?;
    stream.write_all(&hello).await?;

    let mut server_hello = vec![0u8; DEFINES.server_hello_len];
    stream.read_exact(&mut server_hello).await?;
    let LoginStep::SendLogin(login) = session.handle_login_message(&server_hello)? else {
        return Err(ConnectionError::UnexpectedLoginStep);
    };
    stream.write_all(&login).await?;

    let mut login_ack = vec![0u8; DEFINES.login_ack_len];
    stream.read_exact(&mut login_ack).await?;
    match session.handle_login_message(&login_ack)? {
        LoginStep::Done(ack) => Ok(ack),
        LoginStep::SendLogin(_) => Err(ConnectionError::UnexpectedLoginStep),
    }
}
