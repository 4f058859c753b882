//! Configuration types for relaylink-node.
//! Parsed from ~/.relaylink/config.toml.

use anyhow::Context;
use relaylink_crypto::{PublicKey, COOKIE_LENGTH};
use relaylink_protocol::{LoginExtensions, ServerKeys, DEFINES};
use relaylink_rendezvous::{AuthenticationKey, RendezvousRole};
use relaylink_tasks::TaskManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::connection::ReconnectBackoff;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tasks: TaskManagerConfig,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub linking: LinkingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    #[serde(default = "default_archive")]
    pub archive: String,
    /// Overrides the default `relaylink;<version>;<os>` client info.
    #[serde(default)]
    pub client_info: Option<String>,
    #[serde(default)]
    pub device_id: Option<u64>,
    /// Hex, 16 bytes.
    #[serde(default)]
    pub device_cookie: Option<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            archive: default_archive(),
            client_info: None,
            device_id: None,
            device_cookie: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_addr")]
    pub addr: String,
    /// Long-term chat server public key, hex.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Tried when the server hello does not open with `public_key`.
    #[serde(default)]
    pub alternate_public_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            public_key: None,
            alternate_public_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
    #[serde(default = "default_backoff_saturation")]
    pub backoff_saturation: u32,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_saturation: default_backoff_saturation(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Initiator,
    Responder,
}

impl From<LinkRole> for RendezvousRole {
    fn from(role: LinkRole) -> Self {
        match role {
            LinkRole::Initiator => RendezvousRole::Initiator,
            LinkRole::Responder => RendezvousRole::Responder,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPathEntry {
    pub pid: u32,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingSection {
    #[serde(default = "default_link_role")]
    pub role: LinkRole,
    #[serde(default = "default_true")]
    pub nominator: bool,
    /// Accept connections on the path addresses instead of dialing them.
    #[serde(default)]
    pub listen: bool,
    /// Shared out of band, hex.
    #[serde(default)]
    pub authentication_key: Option<String>,
    #[serde(default = "default_device_label")]
    pub device_label: String,
    /// Paths not connected (or accepted) by then are left out of the race.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub paths: Vec<LinkPathEntry>,
}

impl Default for LinkingSection {
    fn default() -> Self {
        Self {
            role: default_link_role(),
            nominator: true,
            listen: false,
            authentication_key: None,
            device_label: default_device_label(),
            connect_timeout_ms: default_connect_timeout_ms(),
            paths: Vec::new(),
        }
    }
}

// Default value functions
fn default_identity_key() -> String {
    "~/.relaylink/identity.json".into()
}
fn default_archive() -> String {
    "~/.relaylink/tasks.db".into()
}
fn default_server_addr() -> String {
    "127.0.0.1:5222".into()
}
fn default_backoff_base() -> u64 {
    DEFINES.reconnect_backoff_base
}
fn default_backoff_saturation() -> u32 {
    DEFINES.reconnect_backoff_saturation
}
fn default_backoff_max_secs() -> u64 {
    DEFINES.reconnect_backoff_max_secs
}
fn default_connect_timeout_ms() -> u64 {
    DEFINES.rendezvous_connect_timeout_ms
}
fn default_link_role() -> LinkRole {
    LinkRole::Initiator
}
fn default_true() -> bool {
    true
}
fn default_device_label() -> String {
    "relaylink".into()
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn server_keys(&self) -> anyhow::Result<ServerKeys> {
        let primary = self
            .server
            .public_key
            .as_deref()
            .context("server.public_key is not configured")?;
        let primary = PublicKey::from_hex(primary).context("invalid server.public_key")?;
        let alternate = self
            .server
            .alternate_public_key
            .as_deref()
            .map(PublicKey::from_hex)
            .transpose()
            .context("invalid server.alternate_public_key")?;
        Ok(ServerKeys { primary, alternate })
    }

    pub fn login_extensions(&self) -> anyhow::Result<LoginExtensions> {
        let mut extensions = LoginExtensions::default();
        if let Some(info) = &self.client.client_info {
            extensions.client_info = info.clone();
        }
        extensions.device_id = self.client.device_id;
        if let Some(cookie) = &self.client.device_cookie {
            let bytes = hex::decode(cookie).context("invalid client.device_cookie")?;
            let cookie: [u8; COOKIE_LENGTH] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("client.device_cookie must be {COOKIE_LENGTH} bytes"))?;
            extensions.device_cookie = Some(cookie);
        }
        Ok(extensions)
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            base: self.connection.backoff_base,
            saturation: self.connection.backoff_saturation,
            max_secs: self.connection.backoff_max_secs,
        }
    }

    pub fn authentication_key(&self) -> anyhow::Result<Option<AuthenticationKey>> {
        self.linking
            .authentication_key
            .as_deref()
            .map(AuthenticationKey::from_hex)
            .transpose()
            .context("invalid linking.authentication_key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.server.addr, "127.0.0.1:5222");
        assert_eq!(cfg.tasks.max_attempts, 5);
        assert_eq!(cfg.connection.backoff_max_secs, 10);
        assert_eq!(cfg.linking.role, LinkRole::Initiator);
        assert!(cfg.server_keys().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[client]
identity_key = "/tmp/identity.json"
device_id = 42
device_cookie = "00112233445566778899aabbccddeeff"

[server]
addr = "chat.example.org:5222"
public_key = "4545454545454545454545454545454545454545454545454545454545454545"
alternate_public_key = "5454545454545454545454545454545454545454545454545454545454545454"

[tasks]
max_attempts = 3

[connection]
backoff_max_secs = 30

[linking]
role = "responder"
nominator = false
listen = true

[[linking.paths]]
pid = 1
addr = "127.0.0.1:7001"

[[linking.paths]]
pid = 2
addr = "127.0.0.1:7002"
"#;

        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.addr, "chat.example.org:5222");
        assert_eq!(cfg.tasks.max_attempts, 3);
        assert_eq!(cfg.tasks.reconnect_min_delay_ms, 2_000);
        assert_eq!(cfg.connection.backoff_max_secs, 30);
        assert_eq!(cfg.connection.backoff_base, 2);
        assert_eq!(cfg.linking.role, LinkRole::Responder);
        assert_eq!(cfg.linking.paths.len(), 2);
        assert_eq!(cfg.linking.paths[1].pid, 2);

        let keys = cfg.server_keys().unwrap();
        assert_eq!(keys.primary.as_bytes(), &[0x45; 32]);
        assert_eq!(keys.alternate.unwrap().as_bytes(), &[0x54; 32]);

        let extensions = cfg.login_extensions().unwrap();
        assert_eq!(extensions.device_id, Some(42));
        assert_eq!(extensions.device_cookie.unwrap()[1], 0x11);
    }

    #[test]
    fn test_invalid_device_cookie() {
        let mut cfg = NodeConfig::default();
        cfg.client.device_cookie = Some("abcd".into());
        assert!(cfg.login_extensions().is_err());
    }

    #[test]
    fn test_serialise_default() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[client]"));
        assert!(toml_str.contains("identity_key"));
        let parsed: NodeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.linking.device_label, "relaylink");
        assert_eq!(parsed.linking.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(cfg.client.archive, "~/.relaylink/tasks.db");
    }
}
