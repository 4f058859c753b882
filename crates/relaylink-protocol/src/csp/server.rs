//! Server side of the CSP login, used by the in-process chat server in tests.

use relaylink_crypto::{Cookie, KeyPair, NonceCounter, PublicKey, COOKIE_LENGTH, PUBLIC_KEY_LENGTH};

use crate::csp::{
    compute_vouch, CspError, Established, LoginAck, LoginExtensions, LOGIN_BOX_LEN,
};
use crate::defines::{DEFINES, EXTENSION_MAGIC, IDENTITY_LEN};
use crate::payload::FramePayload;

type KeyLookup = Box<dyn Fn(&str) -> Option<PublicKey> + Send + Sync>;

enum ServerState {
    AwaitClientHello,
    AwaitLogin {
        server_temp: KeyPair,
        client_temp_pk: PublicKey,
        established: Established,
    },
    AwaitExtensions {
        extensions_box_len: usize,
        established: Established,
    },
    LoginReceived(Established),
    Done(Established),
    Failed,
}

/// Chat server half of one CSP connection.
pub struct CspServerSession {
    permanent: KeyPair,
    lookup: KeyLookup,
    identity: Option<String>,
    extensions: Option<LoginExtensions>,
    state: ServerState,
}

impl CspServerSession {
    /// `lookup` resolves a client identity to its long-term public key.
    pub fn new(
        permanent: KeyPair,
        lookup: impl Fn(&str) -> Option<PublicKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            permanent,
            lookup: Box::new(lookup),
            identity: None,
            extensions: None,
            state: ServerState::AwaitClientHello,
        }
    }

    pub fn client_identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn client_extensions(&self) -> Option<&LoginExtensions> {
        self.extensions.as_ref()
    }

    /// Answer a client hello with a server hello.
    pub fn handle_client_hello(&mut self, hello: &[u8]) -> Result<Vec<u8>, CspError> {
        if !matches!(self.state, ServerState::AwaitClientHello) {
            return Err(self.unexpected("handle_client_hello"));
        }
        if hello.len() != DEFINES.client_hello_len {
            return Err(CspError::InvalidLength {
                what: "client hello",
                expected: DEFINES.client_hello_len,
                got: hello.len(),
            });
        }
        let client_temp_pk = PublicKey::from_slice(&hello[..PUBLIC_KEY_LENGTH])?;
        let client_cookie = Cookie::from_slice(&hello[PUBLIC_KEY_LENGTH..])?;

        let mut server_cookie = Cookie::random();
        while server_cookie == client_cookie {
            server_cookie = Cookie::random();
        }
        let server_temp = KeyPair::generate();
        let mut server_nonce = NonceCounter::new(server_cookie);

        let mut plaintext = Vec::with_capacity(PUBLIC_KEY_LENGTH + COOKIE_LENGTH);
        plaintext.extend_from_slice(server_temp.public_key().as_bytes());
        plaintext.extend_from_slice(client_cookie.as_bytes());
        let sealed = self
            .permanent
            .shared_key(&client_temp_pk)
            .seal(&server_nonce.next_nonce()?, &plaintext)?;

        let mut out = server_cookie.as_bytes().to_vec();
        out.extend_from_slice(&sealed);

        self.state = ServerState::AwaitLogin {
            established: Established {
                session_key: server_temp.shared_key(&client_temp_pk),
                outgoing: server_nonce,
                incoming: NonceCounter::new(client_cookie),
            },
            server_temp,
            client_temp_pk,
        };
        Ok(out)
    }

    /// Open the login box and verify the vouch. Returns the extensions box length.
    pub fn handle_login_box(&mut self, login_box: &[u8]) -> Result<usize, CspError> {
        let ServerState::AwaitLogin {
            server_temp,
            client_temp_pk,
            mut established,
        } = std::mem::replace(&mut self.state, ServerState::Failed)
        else {
            return Err(self.unexpected("handle_login_box"));
        };
        if login_box.len() != LOGIN_BOX_LEN {
            return Err(CspError::InvalidLength {
                what: "login box",
                expected: LOGIN_BOX_LEN,
                got: login_box.len(),
            });
        }

        let nonce = established.incoming.next_nonce()?;
        let login = established
            .session_key
            .open(&nonce, login_box)
            .map_err(|_| CspError::LoginDecryption)?;

        let identity = String::from_utf8_lossy(&login[..IDENTITY_LEN]).into_owned();
        let mut offset = IDENTITY_LEN;
        if &login[offset..offset + EXTENSION_MAGIC.len()] != EXTENSION_MAGIC.as_bytes() {
            return Err(CspError::MalformedExtension("missing extension indicator".into()));
        }
        offset += EXTENSION_MAGIC.len();
        let extensions_box_len = u16::from_le_bytes([login[offset], login[offset + 1]]) as usize;
        offset += 2;

        let server_cookie = Cookie::from_slice(&login[offset..offset + COOKIE_LENGTH])?;
        if server_cookie != *established.outgoing.cookie() {
            return Err(CspError::CookieMismatch);
        }
        offset += COOKIE_LENGTH + DEFINES.reserved1_len;
        let vouch = &login[offset..offset + DEFINES.vouch_len];

        let client_pk = (self.lookup)(&identity)
            .ok_or_else(|| CspError::UnknownIdentity(identity.clone()))?;
        let expected = compute_vouch(
            &self.permanent.shared_key(&client_pk),
            &server_temp.shared_key(&client_pk),
            &server_cookie,
            &client_temp_pk,
        )?;
        if vouch != expected {
            return Err(CspError::VouchMismatch);
        }

        tracing::debug!(identity = %identity, "client login verified");
        self.identity = Some(identity);
        self.state = ServerState::AwaitExtensions {
            extensions_box_len,
            established,
        };
        Ok(extensions_box_len)
    }

    pub fn handle_extensions_box(&mut self, extensions_box: &[u8]) -> Result<(), CspError> {
        let ServerState::AwaitExtensions {
            extensions_box_len,
            mut established,
        } = std::mem::replace(&mut self.state, ServerState::Failed)
        else {
            return Err(self.unexpected("handle_extensions_box"));
        };
        if extensions_box.len() != extensions_box_len {
            return Err(CspError::InvalidLength {
                what: "extensions box",
                expected: extensions_box_len,
                got: extensions_box.len(),
            });
        }
        let nonce = established.incoming.next_nonce()?;
        let plaintext = established
            .session_key
            .open(&nonce, extensions_box)
            .map_err(|_| CspError::LoginDecryption)?;
        self.extensions = Some(LoginExtensions::decode(&plaintext)?);
        self.state = ServerState::LoginReceived(established);
        Ok(())
    }

    /// Seal the login ack; afterwards frames can be exchanged.
    pub fn login_ack(&mut self, server_time_ms: u64, queued_messages: u32) -> Result<Vec<u8>, CspError> {
        let ServerState::LoginReceived(mut established) =
            std::mem::replace(&mut self.state, ServerState::Failed)
        else {
            return Err(self.unexpected("login_ack"));
        };
        let ack = LoginAck {
            server_time_ms,
            queued_messages,
        };
        let nonce = established.outgoing.next_nonce()?;
        let sealed = established.session_key.seal(&nonce, &ack.encode())?;
        self.state = ServerState::Done(established);
        Ok(sealed)
    }

    pub fn encrypt_container(&mut self, payload: &FramePayload) -> Result<Vec<u8>, CspError> {
        match &mut self.state {
            ServerState::Done(established) => established.seal_payload(payload),
            _ => Err(self.unexpected("encrypt_container")),
        }
    }

    pub fn decrypt_box(&mut self, frame: &[u8]) -> Result<FramePayload, CspError> {
        match &mut self.state {
            ServerState::Done(established) => established.open_payload(frame),
            _ => Err(self.unexpected("decrypt_box")),
        }
    }

    fn unexpected(&self, operation: &'static str) -> CspError {
        use crate::csp::CspState;

        let state = match self.state {
            ServerState::AwaitClientHello => CspState::Idle,
            ServerState::AwaitLogin { .. }
            | ServerState::AwaitExtensions { .. }
            | ServerState::LoginReceived(_) => CspState::AwaitLoginAck,
            ServerState::Done(_) => CspState::Done,
            ServerState::Failed => CspState::Failed,
        };
        CspError::InvalidState { operation, state }
    }
}
