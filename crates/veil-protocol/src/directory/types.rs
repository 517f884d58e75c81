use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::types::{now_ms, RelayId, RelayRole};
use crate::VeilError;

/// Everything the client knows about one relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayNodeInfo {
    pub id: RelayId,
    /// Serialized hybrid public key.
    pub public_key: Vec<u8>,
    pub endpoint: String,
    pub roles: Vec<RelayRole>,
    pub region: String,
    /// Always within [0, 1].
    pub trust_score: f64,
    /// Bytes per second.
    pub bandwidth: u64,
    pub latency_ms: u64,
    pub online: bool,
    /// Unix ms.
    pub last_seen: u64,
    pub version: String,
    pub signature: Option<Vec<u8>>,
}

impl RelayNodeInfo {
    /// A freshly seen, online relay. The id is derived from `public_key`.
    pub fn new(public_key: Vec<u8>, endpoint: impl Into<String>, roles: Vec<RelayRole>) -> Self {
        Self {
            id: RelayId::from_public_key(&public_key),
            public_key,
            endpoint: endpoint.into(),
            roles,
            region: String::new(),
            trust_score: 0.5,
            bandwidth: 0,
            latency_ms: 0,
            online: true,
            last_seen: now_ms(),
            version: String::new(),
            signature: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust_score = trust.clamp(0.0, 1.0);
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.bandwidth = bytes_per_sec;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Whether this relay can fill a `role` slot (`any` fills every slot).
    pub fn has_role(&self, role: RelayRole) -> bool {
        self.roles.iter().any(|r| r.satisfies(role))
    }
}

// ── Wire format ───────────────────────────────────────────────────────

/// Response body of a directory endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct RelayListResponse {
    pub relays: Vec<serde_json::Value>,
}

/// One relay as published by a directory endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord {
    pub id: String,
    /// Base64 (standard alphabet).
    pub public_key: String,
    pub endpoint: String,
    pub roles: Vec<String>,
    pub region: String,
    pub trust_score: f64,
    pub bandwidth: u64,
    pub latency: u64,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub signature: Option<String>,
}

fn default_online() -> bool {
    true
}

impl TryFrom<RelayRecord> for RelayNodeInfo {
    type Error = VeilError;

    fn try_from(record: RelayRecord) -> Result<Self, Self::Error> {
        let public_key = BASE64
            .decode(&record.public_key)
            .map_err(|e| VeilError::InvalidRelayRecord(format!("publicKey: {e}")))?;
        if public_key.is_empty() {
            return Err(VeilError::InvalidRelayRecord("empty publicKey".into()));
        }

        let id = RelayId::from_public_key(&public_key);
        if id.as_str() != record.id {
            return Err(VeilError::InvalidRelayRecord(format!(
                "id {} does not match public key",
                record.id
            )));
        }

        if !(0.0..=1.0).contains(&record.trust_score) {
            return Err(VeilError::InvalidRelayRecord(format!(
                "trustScore {} out of range",
                record.trust_score
            )));
        }

        if record.endpoint.is_empty() {
            return Err(VeilError::InvalidRelayRecord("empty endpoint".into()));
        }

        let roles = record
            .roles
            .iter()
            .map(|r| r.parse::<RelayRole>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(VeilError::InvalidRelayRecord)?;
        if roles.is_empty() {
            return Err(VeilError::InvalidRelayRecord("no roles".into()));
        }

        let signature = record
            .signature
            .map(|s| BASE64.decode(s))
            .transpose()
            .map_err(|e| VeilError::InvalidRelayRecord(format!("signature: {e}")))?;

        Ok(RelayNodeInfo {
            id,
            public_key,
            endpoint: record.endpoint,
            roles,
            region: record.region,
            trust_score: record.trust_score,
            bandwidth: record.bandwidth,
            latency_ms: record.latency,
            online: record.online,
            last_seen: record.last_seen.unwrap_or_else(now_ms),
            version: record.version,
            signature,
        })
    }
}

impl From<&RelayNodeInfo> for RelayRecord {
    fn from(info: &RelayNodeInfo) -> Self {
        Self {
            id: info.id.to_string(),
            public_key: BASE64.encode(&info.public_key),
            endpoint: info.endpoint.clone(),
            roles: info.roles.iter().map(|r| r.to_string()).collect(),
            region: info.region.clone(),
            trust_score: info.trust_score,
            bandwidth: info.bandwidth,
            latency: info.latency_ms,
            online: info.online,
            last_seen: Some(info.last_seen),
            version: info.version.clone(),
            signature: info.signature.as_ref().map(|s| BASE64.encode(s)),
        }
    }
}

/// Snapshot counts of the relay cache. `any` relays count toward every role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub total: usize,
    pub online: usize,
    pub bootstrap: usize,
    pub entry: usize,
    pub middle: usize,
    pub exit: usize,
}
