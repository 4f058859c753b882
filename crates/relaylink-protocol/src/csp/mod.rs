//! CSP session -- client side of the chat server login and frame encryption.
//!
//! ```text
//! Idle --start_login--> AwaitHello --server hello--> AwaitLoginAck --login ack--> Done
//! ```
//!
//! Any unexpected input moves the session to `Failed`; a session is never
//! reused across connections.

mod extensions;
pub mod server;

use std::fmt;
use std::sync::Arc;

use relaylink_crypto::{
    derive_key, mac_256, ClientIdentity, Cookie, CryptoError, KeyPair, NonceCounter, PublicKey,
    SharedKey, BOX_OVERHEAD, COOKIE_LENGTH, PUBLIC_KEY_LENGTH,
};

use crate::defines::{DEFINES, EXTENSION_MAGIC, IDENTITY_LEN};
use crate::payload::FramePayload;
use crate::ProtocolError;

pub use extensions::{
    LoginExtensions, FEATURE_MESSAGE_WITH_METADATA_BOX, FEATURE_RECEIVE_ECHO_REQUEST,
};
pub use server::CspServerSession;

const VOUCH_SALT: &[u8] = b"v2";
const VOUCH_PERSONAL: &[u8] = b"3ma-csp";

#[derive(Debug, thiserror::Error)]
pub enum CspError {
    #[error("{what} has invalid length: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("server hello could not be decrypted with the primary or alternate server key")]
    ServerHelloDecryption,
    #[error("client cookie mismatch in server hello")]
    CookieMismatch,
    #[error("client and server cookie are equal")]
    CookiesEqual,
    #[error("login ack could not be decrypted")]
    LoginAckDecryption,
    #[error("login could not be decrypted")]
    LoginDecryption,
    #[error("vouch mismatch")]
    VouchMismatch,
    #[error("unknown client identity: {0}")]
    UnknownIdentity(String),
    #[error("frame decryption failed")]
    FrameDecryption,
    #[error("malformed login extension: {0}")]
    MalformedExtension(String),
    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: CspState,
    },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Public view of the login state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CspState {
    Idle,
    AwaitHello,
    AwaitLoginAck,
    Done,
    Failed,
}

impl fmt::Display for CspState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitHello => "await-hello",
            Self::AwaitLoginAck => "await-login-ack",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Long-term chat server public keys. The alternate key is tried when the
/// server hello does not open with the primary one.
#[derive(Debug, Clone)]
pub struct ServerKeys {
    pub primary: PublicKey,
    pub alternate: Option<PublicKey>,
}

/// Decrypted login ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAck {
    /// Server time, milliseconds since the Unix epoch.
    pub server_time_ms: u64,
    /// Messages waiting on the server for this identity.
    pub queued_messages: u32,
}

impl LoginAck {
    pub const PLAINTEXT_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::PLAINTEXT_LEN] {
        let mut out = [0u8; Self::PLAINTEXT_LEN];
        out[4..12].copy_from_slice(&self.server_time_ms.to_le_bytes());
        out[12..16].copy_from_slice(&self.queued_messages.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CspError> {
        if bytes.len() != Self::PLAINTEXT_LEN {
            return Err(CspError::InvalidLength {
                what: "login ack",
                expected: Self::PLAINTEXT_LEN,
                got: bytes.len(),
            });
        }
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[4..12]);
        let mut queued = [0u8; 4];
        queued.copy_from_slice(&bytes[12..16]);
        Ok(Self {
            server_time_ms: u64::from_le_bytes(time),
            queued_messages: u32::from_le_bytes(queued),
        })
    }
}

/// Outcome of feeding one login message into the session.
#[derive(Debug)]
pub enum LoginStep {
    /// Send these bytes (login box + extensions box) and wait for the ack.
    SendLogin(Vec<u8>),
    /// Login complete.
    Done(LoginAck),
}

/// Keys and counters shared by both sides once the temporary keys are known.
pub(crate) struct Established {
    pub(crate) session_key: SharedKey,
    pub(crate) outgoing: NonceCounter,
    pub(crate) incoming: NonceCounter,
}

impl Established {
    pub(crate) fn seal_payload(&mut self, payload: &FramePayload) -> Result<Vec<u8>, CspError> {
        let nonce = self.outgoing.next_nonce()?;
        Ok(self.session_key.seal(&nonce, &payload.encode())?)
    }

    pub(crate) fn open_payload(&mut self, frame: &[u8]) -> Result<FramePayload, CspError> {
        let nonce = self.incoming.next_nonce()?;
        let plaintext = self
            .session_key
            .open(&nonce, frame)
            .map_err(|_| CspError::FrameDecryption)?;
        Ok(FramePayload::decode(&plaintext)?)
    }
}

enum State {
    Idle,
    AwaitHello {
        client_temp: KeyPair,
        client_nonce: NonceCounter,
    },
    AwaitLoginAck(Established),
    Done(Established),
    Failed,
}

/// Client side of one CSP connection.
pub struct CspSession {
    identity: Arc<ClientIdentity>,
    server_keys: ServerKeys,
    extensions: LoginExtensions,
    state: State,
}

impl CspSession {
    pub fn new(
        identity: Arc<ClientIdentity>,
        server_keys: ServerKeys,
        extensions: LoginExtensions,
    ) -> Self {
        Self {
            identity,
            server_keys,
            extensions,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> CspState {
        match self.state {
            State::Idle => CspState::Idle,
            State::AwaitHello { .. } => CspState::AwaitHello,
            State::AwaitLoginAck(_) => CspState::AwaitLoginAck,
            State::Done(_) => CspState::Done,
            State::Failed => CspState::Failed,
        }
    }

    pub fn is_login_done(&self) -> bool {
        matches!(self.state, State::Done(_))
    }

    /// Length of the next login message expected from the server.
    pub fn expected_message_len(&self) -> Option<usize> {
        match self.state {
            State::AwaitHello { .. } => Some(DEFINES.server_hello_len),
            State::AwaitLoginAck(_) => Some(DEFINES.login_ack_len),
            _ => None,
        }
    }

    /// Create the temporary key pair and client cookie; returns the client hello.
    pub fn start_login(&mut self) -> Result<Vec<u8>, CspError> {
        if !matches!(self.state, State::Idle) {
            return Err(self.invalid_state("start_login"));
        }
        tracing::debug!("starting csp login");

        let client_temp = KeyPair::generate();
        let client_cookie = Cookie::random();

        let mut hello = Vec::with_capacity(DEFINES.client_hello_len);
        hello.extend_from_slice(client_temp.public_key().as_bytes());
        hello.extend_from_slice(client_cookie.as_bytes());

        self.state = State::AwaitHello {
            client_temp,
            client_nonce: NonceCounter::new(client_cookie),
        };
        Ok(hello)
    }

    /// Feed the next login message (server hello or login ack).
    pub fn handle_login_message(&mut self, message: &[u8]) -> Result<LoginStep, CspError> {
        let result = match std::mem::replace(&mut self.state, State::Failed) {
            State::AwaitHello {
                client_temp,
                client_nonce,
            } => self
                .process_server_hello(&client_temp, client_nonce, message)
                .map(|(established, login)| {
                    self.state = State::AwaitLoginAck(established);
                    LoginStep::SendLogin(login)
                }),
            State::AwaitLoginAck(mut established) => {
                Self::process_login_ack(&mut established, message).map(|ack| {
                    self.state = State::Done(established);
                    LoginStep::Done(ack)
                })
            }
            previous => {
                self.state = previous;
                let error = self.invalid_state("handle_login_message");
                self.state = State::Failed;
                Err(error)
            }
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "csp login failed");
        }
        result
    }

    /// Encrypt an outgoing payload. Only valid once the login is done.
    pub fn encrypt_container(&mut self, payload: &FramePayload) -> Result<Vec<u8>, CspError> {
        match &mut self.state {
            State::Done(established) => established.seal_payload(payload),
            _ => Err(self.invalid_state("encrypt_container")),
        }
    }

    /// Decrypt an incoming frame box. Only valid once the login is done.
    pub fn decrypt_box(&mut self, frame: &[u8]) -> Result<FramePayload, CspError> {
        match &mut self.state {
            State::Done(established) => established.open_payload(frame),
            _ => Err(self.invalid_state("decrypt_box")),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> CspError {
        let state = self.state();
        tracing::error!(operation, %state, "csp operation called in wrong state");
        CspError::InvalidState { operation, state }
    }

    fn process_server_hello(
        &self,
        client_temp: &KeyPair,
        mut client_nonce: NonceCounter,
        message: &[u8],
    ) -> Result<(Established, Vec<u8>), CspError> {
        if message.len() != DEFINES.server_hello_len {
            return Err(CspError::InvalidLength {
                what: "server hello",
                expected: DEFINES.server_hello_len,
                got: message.len(),
            });
        }

        let (cookie_bytes, hello_box) = message.split_at(COOKIE_LENGTH);
        let server_cookie = Cookie::from_slice(cookie_bytes)?;
        if server_cookie == *client_nonce.cookie() {
            return Err(CspError::CookiesEqual);
        }
        let mut server_nonce = NonceCounter::new(server_cookie);

        let nonce = server_nonce.next_nonce()?;
        let mut server_permanent = self.server_keys.primary;
        let hello = match client_temp.shared_key(&server_permanent).open(&nonce, hello_box) {
            Ok(hello) => hello,
            Err(_) => {
                let alternate = self
                    .server_keys
                    .alternate
                    .ok_or(CspError::ServerHelloDecryption)?;
                tracing::debug!("server hello did not open with primary key, trying alternate");
                server_permanent = alternate;
                client_temp
                    .shared_key(&server_permanent)
                    .open(&nonce, hello_box)
                    .map_err(|_| CspError::ServerHelloDecryption)?
            }
        };

        let (temp_key_bytes, echoed_cookie) = hello.split_at(PUBLIC_KEY_LENGTH);
        if echoed_cookie != client_nonce.cookie().as_bytes() {
            return Err(CspError::CookieMismatch);
        }
        let server_temp = PublicKey::from_slice(temp_key_bytes)?;
        let session_key = client_temp.shared_key(&server_temp);
        tracing::info!("server hello successful");

        // Login data uses client SN 1, the extensions box client SN 2
        let login_nonce = client_nonce.next_nonce()?;
        let extensions_nonce = client_nonce.next_nonce()?;
        let extensions_box = session_key.seal(&extensions_nonce, &self.extensions.encode()?)?;
        let vouch = self.vouch(&server_permanent, &server_temp, &server_cookie, client_temp)?;

        let login = build_login_data(
            &self.identity.identity_bytes(),
            extensions_box.len(),
            &server_cookie,
            &vouch,
        )?;
        let mut frame = session_key.seal(&login_nonce, &login)?;
        frame.extend_from_slice(&extensions_box);
        tracing::debug!(len = frame.len(), "sending login");

        Ok((
            Established {
                session_key,
                outgoing: client_nonce,
                incoming: server_nonce,
            },
            frame,
        ))
    }

    fn process_login_ack(
        established: &mut Established,
        message: &[u8],
    ) -> Result<LoginAck, CspError> {
        if message.len() != DEFINES.login_ack_len {
            return Err(CspError::InvalidLength {
                what: "login ack",
                expected: DEFINES.login_ack_len,
                got: message.len(),
            });
        }
        let nonce = established.incoming.next_nonce()?;
        let plaintext = established
            .session_key
            .open(&nonce, message)
            .map_err(|_| CspError::LoginAckDecryption)?;
        let ack = LoginAck::decode(&plaintext)?;
        tracing::info!(queued = ack.queued_messages, "login ack received");
        Ok(ack)
    }

    fn vouch(
        &self,
        server_permanent: &PublicKey,
        server_temp: &PublicKey,
        server_cookie: &Cookie,
        client_temp: &KeyPair,
    ) -> Result<[u8; 32], CspError> {
        compute_vouch(
            &self.identity.shared_key(server_permanent),
            &self.identity.shared_key(server_temp),
            server_cookie,
            client_temp.public_key(),
        )
    }
}

impl fmt::Debug for CspSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CspSession")
            .field("identity", &self.identity.identity())
            .field("state", &self.state())
            .finish()
    }
}

/// Vouch MAC over `server_cookie || client_temp_pk`, keyed by the long-term
/// and ephemeral shared secrets.
pub(crate) fn compute_vouch(
    permanent_shared: &SharedKey,
    temp_shared: &SharedKey,
    server_cookie: &Cookie,
    client_temp_pk: &PublicKey,
) -> Result<[u8; 32], CspError> {
    let mut secret = [0u8; 64];
    secret[..32].copy_from_slice(permanent_shared.as_bytes());
    secret[32..].copy_from_slice(temp_shared.as_bytes());
    let vouch_key = zeroize::Zeroizing::new(derive_key(&secret, VOUCH_SALT, VOUCH_PERSONAL)?);
    zeroize::Zeroize::zeroize(&mut secret);
    Ok(mac_256(
        &vouch_key[..],
        &[server_cookie.as_bytes(), client_temp_pk.as_bytes()],
    )?)
}

fn build_login_data(
    identity: &[u8; IDENTITY_LEN],
    extensions_box_len: usize,
    server_cookie: &Cookie,
    vouch: &[u8; 32],
) -> Result<Vec<u8>, CspError> {
    let box_len = u16::try_from(extensions_box_len)
        .map_err(|_| CspError::MalformedExtension("extensions box too long".into()))?;

    let mut login = Vec::with_capacity(DEFINES.login_len);
    login.extend_from_slice(identity);
    login.extend_from_slice(EXTENSION_MAGIC.as_bytes());
    login.extend_from_slice(&box_len.to_le_bytes());
    login.extend_from_slice(server_cookie.as_bytes());
    login.extend_from_slice(&[0u8; 24]);
    login.extend_from_slice(vouch);
    login.extend_from_slice(&[0u8; 16]);

    if login.len() != DEFINES.login_len {
        return Err(CspError::InvalidLength {
            what: "login data",
            expected: DEFINES.login_len,
            got: login.len(),
        });
    }
    Ok(login)
}

/// Boxed login data length.
pub const LOGIN_BOX_LEN: usize = 128 + BOX_OVERHEAD;
