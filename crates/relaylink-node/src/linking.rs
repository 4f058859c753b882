//! Device linking -- rendezvous with another device over TCP paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaylink_rendezvous::{
    AuthenticationKey, PathId, RendezvousConnection, RendezvousError, RendezvousPath,
    RendezvousRole, TcpPath,
};
use relaylink_tasks::{Task, TaskCodec, TaskError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// How this device reaches its candidate paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Dial,
    /// Accept one connection per path address. Addresses the peer never
    /// dials are dropped after the connect timeout.
    Listen,
}

/// First ULP message exchanged by both devices after nomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingHello {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingOutcome {
    pub pid: PathId,
    /// Hex RPH both users compare out of band.
    pub rph: String,
    pub remote_label: String,
}

/// Ephemeral task running one device-linking rendezvous.
pub struct DeviceLinkingTask {
    pub role: RendezvousRole,
    pub is_nominator: bool,
    pub ak: AuthenticationKey,
    pub paths: Vec<(PathId, SocketAddr)>,
    pub mode: PathMode,
    pub label: String,
    pub connect_timeout: Duration,
}

impl DeviceLinkingTask {
    async fn open_paths(&self) -> Result<Vec<Arc<dyn RendezvousPath>>, RendezvousError> {
        match self.mode {
            PathMode::Dial => Ok(self
                .paths
                .iter()
                .map(|&(pid, addr)| Arc::new(TcpPath::new(pid, addr)) as Arc<dyn RendezvousPath>)
                .collect()),
            PathMode::Listen => {
                let mut paths: Vec<Arc<dyn RendezvousPath>> = Vec::with_capacity(self.paths.len());
                for &(pid, addr) in &self.paths {
                    let listener = TcpListener::bind(addr).await?;
                    tracing::info!(pid, %addr, "waiting for rendezvous path");
                    paths.push(Arc::new(TcpPath::listen(pid, listener)));
                }
                Ok(paths)
            }
        }
    }

    /// Rendezvous, then swap [`LinkingHello`]s over the nominated path.
    pub async fn run(&self) -> Result<LinkingOutcome, RendezvousError> {
        let paths = self.open_paths().await?;
        let mut connection = RendezvousConnection::connect_within(
            self.role,
            self.is_nominator,
            self.ak.clone(),
            paths,
            self.connect_timeout,
        )
        .await?;

        let hello = LinkingHello {
            label: self.label.clone(),
        };
        let encoded = serde_json::to_vec(&hello).map_err(std::io::Error::other)?;
        connection.send(encoded).await?;
        let remote = connection
            .receive()
            .await?
            .ok_or(RendezvousError::AllPathsClosed)?;
        let remote: LinkingHello = serde_json::from_slice(&remote).map_err(std::io::Error::other)?;

        let outcome = LinkingOutcome {
            pid: connection.pid(),
            rph: connection.rph().to_hex(),
            remote_label: remote.label,
        };
        tracing::info!(pid = outcome.pid, rph = %outcome.rph, remote = %outcome.remote_label, "device linked");
        connection.close().await;
        Ok(outcome)
    }
}

#[async_trait]
impl Task for DeviceLinkingTask {
    type Output = LinkingOutcome;

    fn kind(&self) -> &'static str {
        "device-linking"
    }

    async fn invoke(&self, _handle: &dyn TaskCodec) -> Result<LinkingOutcome, TaskError> {
        self.run()
            .await
            .map_err(|e| TaskError::Unexpected(anyhow::Error::new(e).context("device linking failed")))
    }

    // Listening paths are single use.
    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_link_two_devices_over_tcp() {
        let ak = AuthenticationKey::random();
        let addrs = vec![(1, free_addr().await), (2, free_addr().await)];

        let responder = DeviceLinkingTask {
            role: RendezvousRole::Responder,
            is_nominator: false,
            ak: ak.clone(),
            paths: addrs.clone(),
            mode: PathMode::Listen,
            label: "desktop".into(),
            connect_timeout: Duration::from_secs(5),
        };
        let initiator = DeviceLinkingTask {
            role: RendezvousRole::Initiator,
            is_nominator: true,
            ak,
            paths: addrs,
            mode: PathMode::Dial,
            label: "phone".into(),
            connect_timeout: Duration::from_secs(5),
        };

        let responder = tokio::spawn(async move { responder.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let initiator = initiator.run().await.unwrap();
        let responder = responder.await.unwrap().unwrap();

        assert_eq!(initiator.pid, responder.pid);
        assert_eq!(initiator.rph, responder.rph);
        assert_eq!(initiator.rph.len(), 64);
        assert_eq!(initiator.remote_label, "desktop");
        assert_eq!(responder.remote_label, "phone");
    }

    #[tokio::test]
    async fn test_no_paths_fails() {
        let task = DeviceLinkingTask {
            role: RendezvousRole::Initiator,
            is_nominator: true,
            ak: AuthenticationKey::random(),
            paths: Vec::new(),
            mode: PathMode::Dial,
            label: "phone".into(),
            connect_timeout: Duration::from_secs(5),
        };
        assert!(matches!(task.run().await, Err(RendezvousError::Io(_))));
        assert_eq!(task.max_attempts(), Some(1));
    }
}
