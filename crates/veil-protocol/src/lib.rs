//! Veil protocol layer.
//!
//! Relay directory, hybrid post-quantum handshake and layered onion
//! circuits on top of `veil-transport` (WebSocket binary frames).
//!
//! Wire format: fixed binary header, big-endian lengths (see [`message`]).
//! Crypto: ML-KEM-768 + X25519 key agreement, ChaCha20-Poly1305 layers.

pub mod client;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod message;
pub mod onion;
pub mod types;

pub use client::{
    CircuitInbound, CircuitState, ClientConfig, ConnectionState, OnionCircuit, RelayClient,
    RelayConnection,
};
pub use crypto::{HybridCrypto, HybridKem, SharedSecret};
pub use directory::{
    BootstrapRegion, DirectoryConfig, DirectorySource, DirectoryStats, HttpDirectorySource,
    RelayDirectory, RelayNodeInfo, SelectionCriteria,
};
pub use error::VeilError;
pub use message::{MessageType, RelayMessage, TransportCipher, PROTOCOL_VERSION};
pub use onion::LayerKeys;
pub use types::{now_ms, RelayId, RelayRole};
