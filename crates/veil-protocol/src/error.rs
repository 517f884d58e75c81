use crate::types::RelayRole;

/// Protocol-level errors for Veil.
///
/// Wraps transport errors and adds protocol, crypto, circuit and
/// directory variants.
#[derive(Debug, thiserror::Error)]
pub enum VeilError {
    #[error("transport error: {0}")]
    Transport(#[from] veil_transport::TransportError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {request_id} timed out")]
    RequestTimeout { request_id: u32 },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: String, got: String },

    #[error("relay reported error: {0}")]
    RelayError(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("decryption failed: authentication error")]
    Decryption,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown circuit: {0}")]
    UnknownCircuit(String),

    #[error("circuit {circuit_id} is not ready ({state})")]
    CircuitNotReady { circuit_id: String, state: String },

    #[error("circuit path is empty")]
    EmptyPath,

    #[error("invalid hop count: {0}")]
    InvalidHopCount(usize),

    #[error("no relay available for role {role}")]
    NoRelayAvailable { role: RelayRole },

    #[error("unknown relay: {0}")]
    UnknownRelay(String),

    #[error("invalid relay record: {0}")]
    InvalidRelayRecord(String),

    #[error("directory unavailable: {0}")]
    Directory(String),
}

impl From<serde_json::Error> for VeilError {
    fn from(e: serde_json::Error) -> Self {
        VeilError::Directory(format!("bad json: {e}"))
    }
}

impl From<reqwest::Error> for VeilError {
    fn from(e: reqwest::Error) -> Self {
        VeilError::Directory(e.to_string())
    }
}
