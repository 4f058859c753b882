//! Rendezvous over real paths: race, nominate, then carry ULP data.

use std::sync::Arc;
use std::time::Duration;

use relaylink_protocol::DEFINES;

use crate::multiplexed::{MultiplexedRendezvousPath, NominatedPath};
use crate::path::RendezvousPath;
use crate::protocol::{PathProcessResult, PathStateUpdate, RendezvousProtocol};
use crate::{
    AuthenticationKey, PathId, RendezvousError, RendezvousPathHash, RendezvousProtocolError,
    RendezvousRole,
};

/// Established rendezvous on a single nominated path.
pub struct RendezvousConnection {
    protocol: RendezvousProtocol,
    path: NominatedPath,
    rph: RendezvousPathHash,
}

impl std::fmt::Debug for RendezvousConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousConnection")
            .field("pid", &self.path.pid())
            .field("rph", &self.rph)
            .finish()
    }
}

impl RendezvousConnection {
    /// Connect all `paths`, run the handshake on each and settle on one.
    /// A path failing the handshake is dropped; once none are left every
    /// path is closed and the last error returned.
    pub async fn connect(
        role: RendezvousRole,
        is_nominator: bool,
        ak: AuthenticationKey,
        paths: Vec<Arc<dyn RendezvousPath>>,
    ) -> Result<Self, RendezvousError> {
        let timeout = Duration::from_millis(DEFINES.rendezvous_connect_timeout_ms);
        Self::connect_within(role, is_nominator, ak, paths, timeout).await
    }

    /// Like [`connect`](Self::connect), giving up on paths that are not
    /// connected within `connect_timeout`.
    pub async fn connect_within(
        role: RendezvousRole,
        is_nominator: bool,
        ak: AuthenticationKey,
        paths: Vec<Arc<dyn RendezvousPath>>,
        connect_timeout: Duration,
    ) -> Result<Self, RendezvousError> {
        let mut multiplexed =
            MultiplexedRendezvousPath::connect_within(paths, connect_timeout).await?;
        let negotiated = negotiate(role, is_nominator, ak, &mut multiplexed).await;
        let (protocol, pid, rph) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!(error = %e, "rendezvous failed, closing all paths");
                multiplexed.close_all().await;
                return Err(e);
            }
        };
        let path = multiplexed.into_nominated(pid).await?;
        tracing::info!(pid, rph = %rph.to_hex(), "rendezvous established");
        Ok(Self { protocol, path, rph })
    }

    pub fn pid(&self) -> PathId {
        self.path.pid()
    }

    pub fn rph(&self) -> &RendezvousPathHash {
        &self.rph
    }

    /// Send ULP data to the remote device.
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), RendezvousError> {
        let result = self.protocol.create_ulp_frame(data)?;
        if let Some(frame) = result.outgoing_frame {
            self.path.write(&frame.encode()).await?;
        }
        Ok(())
    }

    /// Receive the next ULP message, `None` once the path closed.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>, RendezvousError> {
        let pid = self.path.pid();
        loop {
            while let Some(result) = self.protocol.process_frame(pid)? {
                if let Some(data) = result.incoming_ulp_data {
                    return Ok(Some(data));
                }
            }
            let Some(chunk) = self.path.read().await else {
                return Ok(None);
            };
            self.protocol.add_chunks(pid, &[&chunk])?;
        }
    }

    pub async fn close(self) {
        self.path.close().await;
    }
}

async fn write_frame(
    multiplexed: &MultiplexedRendezvousPath,
    pid: PathId,
    result: &mut PathProcessResult,
) -> Result<(), RendezvousError> {
    if let Some(frame) = result.outgoing_frame.take() {
        multiplexed.write(pid, &frame.encode()).await?;
    }
    Ok(())
}

type Negotiated = (RendezvousProtocol, PathId, RendezvousPathHash);

async fn negotiate(
    role: RendezvousRole,
    is_nominator: bool,
    ak: AuthenticationKey,
    multiplexed: &mut MultiplexedRendezvousPath,
) -> Result<Negotiated, RendezvousError> {
    let (mut protocol, hellos) = RendezvousProtocol::new(role, is_nominator, ak, &multiplexed.pids())?;
    for (pid, hello) in hellos {
        multiplexed.write(pid, &hello.encode()).await?;
    }

    // Error of the most recently dropped path, reported once none are left
    let mut last_error = None;
    loop {
        let (pid, chunk) = match multiplexed.read().await {
            Ok(read) => read,
            Err(RendezvousError::AllPathsClosed) => {
                return Err(last_error.map_or(RendezvousError::AllPathsClosed, Into::into))
            }
            Err(e) => return Err(e),
        };
        match advance_path(&mut protocol, multiplexed, pid, &chunk).await {
            Ok(Some((pid, rph))) => return Ok((protocol, pid, rph)),
            Ok(None) => {}
            Err(RendezvousError::Protocol(e)) => {
                tracing::warn!(pid, error = %e, "dropping rendezvous path");
                multiplexed.close_path(pid).await;
                if multiplexed.pids().is_empty() {
                    return Err(e.into());
                }
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Feed one chunk of `pid` through the protocol. Protocol errors concern
/// only that path.
async fn advance_path(
    protocol: &mut RendezvousProtocol,
    multiplexed: &MultiplexedRendezvousPath,
    pid: PathId,
    chunk: &[u8],
) -> Result<Option<(PathId, RendezvousPathHash)>, RendezvousError> {
    protocol.add_chunks(pid, &[chunk])?;

    while let Some(mut result) = protocol.process_frame(pid)? {
        write_frame(multiplexed, pid, &mut result).await?;
        if result.incoming_ulp_data.is_some() {
            return Err(RendezvousProtocolError::UnexpectedFrame.into());
        }

        match result.state_update {
            Some(PathStateUpdate::AwaitingNominate { measured_rtt }) => {
                tracing::debug!(pid, ?measured_rtt, "rendezvous path ready for nomination");
                if protocol.is_nominator() {
                    let mut nominated = protocol.nominate_path(pid)?;
                    write_frame(multiplexed, pid, &mut nominated).await?;
                    if let Some(PathStateUpdate::Nominated { rph }) = nominated.state_update {
                        return Ok(Some((pid, rph)));
                    }
                }
            }
            Some(PathStateUpdate::Nominated { rph }) => return Ok(Some((pid, rph))),
            None => {}
        }
    }
    Ok(None)
}
