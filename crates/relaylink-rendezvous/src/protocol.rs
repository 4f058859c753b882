//! Rendezvous protocol state machine, free of I/O.
//!
//! Feed bytes received on a path with [`RendezvousProtocol::add_chunks`], then
//! call [`RendezvousProtocol::process_frame`] until it returns `None`. Every
//! [`PathProcessResult`] must be acted on:
//!
//! - `outgoing_frame`: write it to the same path.
//! - `AwaitingNominate`: the nominator nominates the path.
//! - `Nominated`: drop every other path; ULP data may now flow.
//! - `incoming_ulp_data`: hand it to the upper layer (only after nomination).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relaylink_crypto::{KeyPair, SharedKey};
use relaylink_protocol::DEFINES;

use crate::frame::{FrameDecoder, OutgoingFrame};
use crate::keys::{DirectionalKeys, TAG_LEN};
use crate::messages::{self, Auth, AuthHello, Challenge, Hello};
use crate::{
    AuthenticationKey, PathId, RendezvousPathHash, RendezvousProtocolError, RendezvousRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStateUpdate {
    /// Handshake done; the path waits for nomination.
    AwaitingNominate { measured_rtt: Duration },
    /// The path carries ULP data from now on.
    Nominated { rph: RendezvousPathHash },
}

#[derive(Debug, Default)]
pub struct PathProcessResult {
    pub state_update: Option<PathStateUpdate>,
    pub outgoing_frame: Option<OutgoingFrame>,
    pub incoming_ulp_data: Option<Vec<u8>>,
}

struct Context {
    role: RendezvousRole,
    is_nominator: bool,
    ak: AuthenticationKey,
}

enum PathState {
    /// Only seen while moving between states.
    Invalid,
    /// RID: waiting for the RRD's `Hello`.
    AwaitingHello { keys: DirectionalKeys },
    /// RRD: sent `Hello`, waiting for `AuthHello`.
    AwaitingAuthHello {
        keys: DirectionalKeys,
        sent_at: Instant,
        local_challenge: Challenge,
        local_etk: KeyPair,
    },
    /// RID: sent `AuthHello`, waiting for `Auth`.
    AwaitingAuth {
        sent_at: Instant,
        keys: DirectionalKeys,
        local_challenge: Challenge,
        etk: SharedKey,
    },
    AwaitingNominate {
        keys: DirectionalKeys,
        rph: RendezvousPathHash,
    },
    Nominated { keys: DirectionalKeys },
    Closed,
}

impl PathState {
    fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::AwaitingHello { .. } => "awaiting-hello",
            Self::AwaitingAuthHello { .. } => "awaiting-auth-hello",
            Self::AwaitingAuth { .. } => "awaiting-auth",
            Self::AwaitingNominate { .. } => "awaiting-nominate",
            Self::Nominated { .. } => "nominated",
            Self::Closed => "closed",
        }
    }
}

/// Protocol state of one candidate path.
struct PathProtocol {
    pid: PathId,
    decoder: FrameDecoder,
    state: PathState,
}

impl PathProtocol {
    fn new_initiator(ctx: &Context, pid: PathId) -> Result<Self, RendezvousProtocolError> {
        Ok(Self {
            pid,
            decoder: FrameDecoder::new(),
            state: PathState::AwaitingHello {
                keys: DirectionalKeys::authentication(&ctx.ak, ctx.role, pid)?,
            },
        })
    }

    fn new_responder(
        ctx: &Context,
        pid: PathId,
    ) -> Result<(Self, OutgoingFrame), RendezvousProtocolError> {
        let mut keys = DirectionalKeys::authentication(&ctx.ak, ctx.role, pid)?;
        let local_challenge = Challenge::random();
        let local_etk = KeyPair::generate();
        let mut hello = Hello {
            challenge: local_challenge,
            etk: *local_etk.public_key(),
        }
        .encode();
        keys.outgoing.encrypt(&mut hello)?;

        let path = Self {
            pid,
            decoder: FrameDecoder::new(),
            state: PathState::AwaitingAuthHello {
                keys,
                sent_at: Instant::now(),
                local_challenge,
                local_etk,
            },
        };
        Ok((path, OutgoingFrame(hello)))
    }

    fn max_frame_length(&self) -> usize {
        if matches!(self.state, PathState::Nominated { .. }) {
            DEFINES.rendezvous_max_frame_after_nomination
        } else {
            DEFINES.rendezvous_max_frame_before_nomination
        }
    }

    fn add_chunks(&mut self, chunks: &[&[u8]]) -> Result<(), RendezvousProtocolError> {
        let Some(length) = self.decoder.add_chunks(chunks) else {
            return Ok(());
        };
        if length > self.max_frame_length() {
            self.state = PathState::Closed;
            return Err(RendezvousProtocolError::OversizedFrame(length));
        }
        Ok(())
    }

    fn process_next(
        &mut self,
        ctx: &Context,
    ) -> Result<Option<PathProcessResult>, RendezvousProtocolError> {
        // Frames queued behind the head are only length-checked here
        let frame = match self.decoder.next_frame(self.max_frame_length()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "rendezvous path closed due to error");
                self.state = PathState::Closed;
                return Err(e);
            }
        };
        self.process_frame(ctx, frame).map(Some)
    }

    fn process_frame(
        &mut self,
        ctx: &Context,
        frame: Vec<u8>,
    ) -> Result<PathProcessResult, RendezvousProtocolError> {
        tracing::trace!(pid = self.pid, state = self.state.name(), len = frame.len(), "processing rendezvous frame");
        let result = self.transition(ctx, frame);
        if let Err(e) = &result {
            tracing::warn!(pid = self.pid, error = %e, "rendezvous path closed due to error");
            self.state = PathState::Closed;
        }
        result
    }

    fn transition(
        &mut self,
        ctx: &Context,
        mut frame: Vec<u8>,
    ) -> Result<PathProcessResult, RendezvousProtocolError> {
        if let PathState::Nominated { keys } = &mut self.state {
            keys.incoming.decrypt(&mut frame)?;
            return Ok(PathProcessResult {
                incoming_ulp_data: Some(frame),
                ..Default::default()
            });
        }

        let (state, result) = match std::mem::replace(&mut self.state, PathState::Invalid) {
            PathState::AwaitingHello { mut keys } => {
                keys.incoming.decrypt(&mut frame)?;
                let hello = Hello::decode(&frame)?;

                let local_challenge = Challenge::random();
                let local_etk = KeyPair::generate();
                let mut auth_hello = AuthHello {
                    response: hello.challenge,
                    challenge: local_challenge,
                    etk: *local_etk.public_key(),
                }
                .encode();
                keys.outgoing.encrypt(&mut auth_hello)?;

                (
                    PathState::AwaitingAuth {
                        sent_at: Instant::now(),
                        keys,
                        local_challenge,
                        etk: local_etk.shared_key(&hello.etk),
                    },
                    PathProcessResult {
                        outgoing_frame: Some(OutgoingFrame(auth_hello)),
                        ..Default::default()
                    },
                )
            }

            PathState::AwaitingAuthHello {
                mut keys,
                sent_at,
                local_challenge,
                local_etk,
            } => {
                let measured_rtt = sent_at.elapsed();
                keys.incoming.decrypt(&mut frame)?;
                let auth_hello = AuthHello::decode(&frame)?;
                if auth_hello.response != local_challenge {
                    return Err(RendezvousProtocolError::InvalidMessage {
                        message: "auth-hello",
                        reason: "challenge response does not match".into(),
                    });
                }

                let mut auth = Auth {
                    response: auth_hello.challenge,
                }
                .encode();
                keys.outgoing.encrypt(&mut auth)?;

                let etk = local_etk.shared_key(&auth_hello.etk);
                let (keys, rph) = DirectionalKeys::transport(&ctx.ak, &etk, ctx.role, self.pid)?;
                (
                    PathState::AwaitingNominate { keys, rph },
                    PathProcessResult {
                        state_update: Some(PathStateUpdate::AwaitingNominate { measured_rtt }),
                        outgoing_frame: Some(OutgoingFrame(auth)),
                        incoming_ulp_data: None,
                    },
                )
            }

            PathState::AwaitingAuth {
                sent_at,
                mut keys,
                local_challenge,
                etk,
            } => {
                let measured_rtt = sent_at.elapsed();
                keys.incoming.decrypt(&mut frame)?;
                let auth = Auth::decode(&frame)?;
                if auth.response != local_challenge {
                    return Err(RendezvousProtocolError::InvalidMessage {
                        message: "auth",
                        reason: "challenge response does not match".into(),
                    });
                }

                let (keys, rph) = DirectionalKeys::transport(&ctx.ak, &etk, ctx.role, self.pid)?;
                (
                    PathState::AwaitingNominate { keys, rph },
                    PathProcessResult {
                        state_update: Some(PathStateUpdate::AwaitingNominate { measured_rtt }),
                        ..Default::default()
                    },
                )
            }

            PathState::AwaitingNominate { mut keys, rph } => {
                if ctx.is_nominator {
                    return Err(RendezvousProtocolError::UnexpectedFrame);
                }
                keys.incoming.decrypt(&mut frame)?;
                messages::decode_nominate(&frame)?;
                (
                    PathState::Nominated { keys },
                    PathProcessResult {
                        state_update: Some(PathStateUpdate::Nominated { rph }),
                        ..Default::default()
                    },
                )
            }

            PathState::Closed => return Err(RendezvousProtocolError::PathClosed(self.pid)),
            PathState::Invalid | PathState::Nominated { .. } => {
                return Err(RendezvousProtocolError::UnexpectedFrame)
            }
        };

        self.state = state;
        tracing::debug!(pid = self.pid, state = self.state.name(), "rendezvous path state changed");
        Ok(result)
    }

    fn nominate(&mut self) -> Result<PathProcessResult, RendezvousProtocolError> {
        if !matches!(self.state, PathState::AwaitingNominate { .. }) {
            return Err(RendezvousProtocolError::InvalidStateForNomination(
                self.state.name(),
            ));
        }
        let PathState::AwaitingNominate { mut keys, rph } =
            std::mem::replace(&mut self.state, PathState::Invalid)
        else {
            return Err(RendezvousProtocolError::InvalidStateForNomination("invalid"));
        };

        let mut nominate = Vec::new();
        if let Err(e) = keys.outgoing.encrypt(&mut nominate) {
            self.state = PathState::Closed;
            return Err(e);
        }
        self.state = PathState::Nominated { keys };
        tracing::debug!(pid = self.pid, "nominated rendezvous path");
        Ok(PathProcessResult {
            state_update: Some(PathStateUpdate::Nominated { rph }),
            outgoing_frame: Some(OutgoingFrame(nominate)),
            incoming_ulp_data: None,
        })
    }

    fn create_ulp_frame(
        &mut self,
        mut data: Vec<u8>,
    ) -> Result<PathProcessResult, RendezvousProtocolError> {
        let PathState::Nominated { keys } = &mut self.state else {
            return Err(RendezvousProtocolError::NominationRequired);
        };
        let length = data.len() + TAG_LEN;
        if length > DEFINES.rendezvous_max_frame_after_nomination {
            return Err(RendezvousProtocolError::OversizedFrame(length));
        }
        keys.outgoing.encrypt(&mut data)?;
        Ok(PathProcessResult {
            outgoing_frame: Some(OutgoingFrame(data)),
            ..Default::default()
        })
    }
}

enum ProtocolState {
    /// Handshake and nomination phase.
    Racing(HashMap<PathId, PathProtocol>),
    /// ULP phase on the single nominated path.
    Nominated { pid: PathId, path: PathProtocol },
}

/// Rendezvous over a set of racing paths.
pub struct RendezvousProtocol {
    ctx: Context,
    state: ProtocolState,
}

impl std::fmt::Debug for RendezvousProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousProtocol")
            .field("role", &self.ctx.role)
            .field("is_nominator", &self.ctx.is_nominator)
            .field("nominated", &self.nominated_path())
            .finish()
    }
}

impl RendezvousProtocol {
    /// Set up every path in `pids`. For the responder the returned frames
    /// (one `Hello` per path) must be written immediately.
    pub fn new(
        role: RendezvousRole,
        is_nominator: bool,
        ak: AuthenticationKey,
        pids: &[PathId],
    ) -> Result<(Self, Vec<(PathId, OutgoingFrame)>), RendezvousProtocolError> {
        tracing::debug!(?role, is_nominator, ?pids, "creating rendezvous protocol");
        let ctx = Context {
            role,
            is_nominator,
            ak,
        };
        let mut paths = HashMap::with_capacity(pids.len());
        let mut outgoing = Vec::new();
        for &pid in pids {
            let path = match role {
                RendezvousRole::Initiator => PathProtocol::new_initiator(&ctx, pid)?,
                RendezvousRole::Responder => {
                    let (path, hello) = PathProtocol::new_responder(&ctx, pid)?;
                    outgoing.push((pid, hello));
                    path
                }
            };
            paths.insert(pid, path);
        }
        Ok((
            Self {
                ctx,
                state: ProtocolState::Racing(paths),
            },
            outgoing,
        ))
    }

    pub fn role(&self) -> RendezvousRole {
        self.ctx.role
    }

    pub fn is_nominator(&self) -> bool {
        self.ctx.is_nominator
    }

    pub fn nominated_path(&self) -> Option<PathId> {
        match &self.state {
            ProtocolState::Nominated { pid, .. } => Some(*pid),
            ProtocolState::Racing(_) => None,
        }
    }

    /// Buffer bytes received on `pid`.
    pub fn add_chunks(&mut self, pid: PathId, chunks: &[&[u8]]) -> Result<(), RendezvousProtocolError> {
        self.lookup_path(pid)?.add_chunks(chunks)
    }

    /// Process the next buffered complete frame of `pid`, if any.
    pub fn process_frame(
        &mut self,
        pid: PathId,
    ) -> Result<Option<PathProcessResult>, RendezvousProtocolError> {
        let ctx = &self.ctx;
        let path = match &mut self.state {
            ProtocolState::Racing(paths) => paths
                .get_mut(&pid)
                .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?,
            ProtocolState::Nominated {
                pid: nominated,
                path,
            } if *nominated == pid => path,
            ProtocolState::Nominated { .. } => {
                return Err(RendezvousProtocolError::UnknownOrDroppedPath(pid))
            }
        };
        let Some(result) = path.process_next(ctx)? else {
            return Ok(None);
        };

        let nominated = matches!(result.state_update, Some(PathStateUpdate::Nominated { .. }));
        if nominated {
            if let ProtocolState::Racing(paths) = &mut self.state {
                let path = paths
                    .remove(&pid)
                    .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?;
                tracing::debug!(pid, dropped = ?paths.keys().collect::<Vec<_>>(), "remote nominated path");
                self.state = ProtocolState::Nominated { pid, path };
            }
        }
        Ok(Some(result))
    }

    /// Nominate `pid`. Only the nominator may do this, once.
    pub fn nominate_path(&mut self, pid: PathId) -> Result<PathProcessResult, RendezvousProtocolError> {
        if !self.ctx.is_nominator {
            return Err(RendezvousProtocolError::NominateNotAllowed);
        }
        let paths = match &mut self.state {
            ProtocolState::Racing(paths) => paths,
            ProtocolState::Nominated { pid, .. } => {
                return Err(RendezvousProtocolError::NominationAlreadyDone(*pid))
            }
        };
        let path = paths
            .get_mut(&pid)
            .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?;
        let result = path.nominate()?;
        let path = paths
            .remove(&pid)
            .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid))?;
        tracing::debug!(pid, dropped = ?paths.keys().collect::<Vec<_>>(), "local nominated path");
        self.state = ProtocolState::Nominated { pid, path };
        Ok(result)
    }

    /// Encrypt ULP data for the nominated path.
    pub fn create_ulp_frame(&mut self, data: Vec<u8>) -> Result<PathProcessResult, RendezvousProtocolError> {
        match &mut self.state {
            ProtocolState::Racing(_) => Err(RendezvousProtocolError::NominationRequired),
            ProtocolState::Nominated { path, .. } => path.create_ulp_frame(data),
        }
    }

    fn lookup_path(&mut self, pid: PathId) -> Result<&mut PathProtocol, RendezvousProtocolError> {
        match &mut self.state {
            ProtocolState::Racing(paths) => paths
                .get_mut(&pid)
                .ok_or(RendezvousProtocolError::UnknownOrDroppedPath(pid)),
            ProtocolState::Nominated {
                pid: nominated,
                path,
            } => {
                if *nominated != pid {
                    return Err(RendezvousProtocolError::UnknownOrDroppedPath(pid));
                }
                Ok(path)
            }
        }
    }
}
