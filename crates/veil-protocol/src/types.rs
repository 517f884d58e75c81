use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Relay identity: hex of the first 16 bytes of SHA-256(public key).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    /// Derive the identity of a relay from its serialized public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.0.len() > 12 { &self.0[..12] } else { &self.0 };
        write!(f, "RelayId({short}...)")
    }
}

/// Role a relay can take in a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    /// First hop: sees the client, not the destination.
    Entry,
    /// Interior hop: sees neither end.
    Middle,
    /// Last hop: sees the destination, not the client.
    Exit,
    /// Willing to serve in any position.
    Any,
}

impl RelayRole {
    /// Whether a relay offering `self` can fill a `wanted` slot.
    pub fn satisfies(self, wanted: RelayRole) -> bool {
        self == RelayRole::Any || self == wanted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayRole::Entry => "entry",
            RelayRole::Middle => "middle",
            RelayRole::Exit => "exit",
            RelayRole::Any => "any",
        }
    }
}

impl fmt::Display for RelayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelayRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(RelayRole::Entry),
            "middle" => Ok(RelayRole::Middle),
            "exit" => Ok(RelayRole::Exit),
            "any" => Ok(RelayRole::Any),
            other => Err(format!("unknown relay role: {other}")),
        }
    }
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
