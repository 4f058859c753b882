//! Login extensions: `type u8 || length u16 LE || value`, concatenated.

use relaylink_crypto::COOKIE_LENGTH;

use crate::csp::CspError;
use crate::DeviceId;

const CLIENT_INFO: u8 = 0x00;
const CSP_DEVICE_ID: u8 = 0x01;
const SUPPORTED_FEATURES: u8 = 0x02;
const DEVICE_COOKIE: u8 = 0x03;

/// Feature bit: messages carry a metadata box.
pub const FEATURE_MESSAGE_WITH_METADATA_BOX: u8 = 0b0000_0001;
/// Feature bit: client answers echo requests sent by the server.
pub const FEATURE_RECEIVE_ECHO_REQUEST: u8 = 0b0000_0010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginExtensions {
    /// Free-form client description, e.g. `"relaylink;0.1.0;linux"`.
    pub client_info: String,
    /// Only sent when the device is part of a device group.
    pub device_id: Option<DeviceId>,
    pub features: u8,
    pub device_cookie: Option<[u8; COOKIE_LENGTH]>,
}

impl Default for LoginExtensions {
    fn default() -> Self {
        Self {
            client_info: format!("relaylink;{};{}", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
            device_id: None,
            features: FEATURE_MESSAGE_WITH_METADATA_BOX | FEATURE_RECEIVE_ECHO_REQUEST,
            device_cookie: None,
        }
    }
}

impl LoginExtensions {
    pub fn encode(&self) -> Result<Vec<u8>, CspError> {
        let mut out = Vec::new();
        push_extension(&mut out, CLIENT_INFO, self.client_info.as_bytes())?;
        if let Some(device_id) = self.device_id {
            push_extension(&mut out, CSP_DEVICE_ID, &device_id.to_le_bytes())?;
        }
        push_extension(&mut out, SUPPORTED_FEATURES, &[self.features])?;
        if let Some(cookie) = &self.device_cookie {
            push_extension(&mut out, DEVICE_COOKIE, cookie)?;
        }
        Ok(out)
    }

    /// Parse extensions sent by a client. Unknown types are skipped.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, CspError> {
        let mut extensions = Self {
            client_info: String::new(),
            device_id: None,
            features: 0,
            device_cookie: None,
        };

        while !bytes.is_empty() {
            if bytes.len() < 3 {
                return Err(CspError::MalformedExtension("truncated header".into()));
            }
            let kind = bytes[0];
            let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
            let Some(value) = bytes.get(3..3 + len) else {
                return Err(CspError::MalformedExtension(format!(
                    "extension {kind:#04x} claims {len} bytes"
                )));
            };

            match kind {
                CLIENT_INFO => extensions.client_info = String::from_utf8_lossy(value).into_owned(),
                CSP_DEVICE_ID => {
                    let id: [u8; 8] = value.try_into().map_err(|_| {
                        CspError::MalformedExtension("device id must be 8 bytes".into())
                    })?;
                    extensions.device_id = Some(u64::from_le_bytes(id));
                }
                SUPPORTED_FEATURES => extensions.features = value.first().copied().unwrap_or(0),
                DEVICE_COOKIE => {
                    let cookie = value.try_into().map_err(|_| {
                        CspError::MalformedExtension("device cookie must be 16 bytes".into())
                    })?;
                    extensions.device_cookie = Some(cookie);
                }
                other => tracing::debug!(kind = other, "skipping unknown login extension"),
            }
            bytes = &bytes[3 + len..];
        }
        Ok(extensions)
    }
}

fn push_extension(out: &mut Vec<u8>, kind: u8, value: &[u8]) -> Result<(), CspError> {
    let len = u16::try_from(value.len())
        .map_err(|_| CspError::MalformedExtension(format!("extension {kind:#04x} too long")))?;
    out.push(kind);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}
