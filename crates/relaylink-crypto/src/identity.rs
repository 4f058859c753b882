//! Client identity -- 8-character identity string plus long-term X25519 key pair.

use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use crate::nacl::{KeyPair, PublicKey, SharedKey};
use crate::CryptoError;

pub const IDENTITY_LENGTH: usize = 8;

/// Identity as stored on disk.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    identity: String,
    secret_key: String,
}

/// Client identity wrapping the long-term key pair.
#[derive(Debug)]
pub struct ClientIdentity {
    identity: String,
    keypair: KeyPair,
}

impl ClientIdentity {
    pub fn new(identity: &str, keypair: KeyPair) -> Result<Self, CryptoError> {
        validate_identity(identity)?;
        Ok(Self {
            identity: identity.to_string(),
            keypair,
        })
    }

    /// Generate a fresh key pair for `identity`.
    pub fn generate(identity: &str) -> Result<Self, CryptoError> {
        Self::new(identity, KeyPair::generate())
    }

    /// Load identity from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(std::fs::read_to_string(path)?);
        let file: IdentityFile = serde_json::from_str(&raw)?;
        let secret = Zeroizing::new(hex::decode(file.secret_key.trim())?);
        let secret: [u8; 32] =
            secret
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    got: secret.len(),
                })?;
        Self::new(&file.identity, KeyPair::from_secret_bytes(secret))
    }

    /// Load identity from path, or generate and persist one for `identity`.
    pub fn load_or_create(path: &Path, identity: &str) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let created = Self::generate(identity)?;
            created.save(path)?;
            Ok(created)
        }
    }

    /// Write the identity file (mode 0600 on unix).
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            identity: self.identity.clone(),
            secret_key: hex::encode(self.keypair.secret_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_string_pretty(&file)?);
        std::fs::write(path, json.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Identity as the 8 ASCII bytes sent during login.
    pub fn identity_bytes(&self) -> [u8; IDENTITY_LENGTH] {
        let mut out = [0u8; IDENTITY_LENGTH];
        out.copy_from_slice(self.identity.as_bytes());
        out
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// NaCl shared key between the long-term key and `remote`.
    pub fn shared_key(&self, remote: &PublicKey) -> SharedKey {
        self.keypair.shared_key(remote)
    }
}

fn validate_identity(identity: &str) -> Result<(), CryptoError> {
    let valid = identity.len() == IDENTITY_LENGTH
        && identity
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_uppercase() || c.is_ascii_digit() || (i == 0 && c == '*'));
    if valid {
        Ok(())
    } else {
        Err(CryptoError::IdentityError(format!(
            "invalid identity {identity:?}: expected 8 characters A-Z or 0-9"
        )))
    }
}
