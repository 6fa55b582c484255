use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Correlation id the store expects on every call: 12 uppercase hex digits,
/// shaped like a network interface address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guid(String);

impl Guid {
    /// Accepts 12 hex digits, with or without `:` separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex: String = raw.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Guid(hex.to_ascii_uppercase()))
        } else {
            None
        }
    }

    /// Stable per host: the first six bytes of SHA-256 over the machine id
    /// (or host name). Falls back to a random id when neither is readable.
    pub fn for_host() -> Self {
        match host_identifier() {
            Some(seed) => Self::from_seed(seed.as_bytes()),
            None => {
                tracing::debug!("no stable host identifier, using a random guid");
                Self::from_seed(uuid::Uuid::new_v4().as_bytes())
            }
        }
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Sha256::digest(seed);
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&digest[..6]);
        if bytes.iter().all(|b| *b == 0) {
            bytes[5] = 1;
        }
        Guid(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn host_identifier() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}
