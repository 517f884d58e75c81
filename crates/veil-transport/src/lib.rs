//! Veil transport layer.
//!
//! Duplex, message-oriented, binary-safe connections to onion relays,
//! addressed by endpoint URL. The protocol layer only sees frames; the
//! connector decides how they travel (WebSocket in production, channels
//! in tests).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use veil_transport::{Connector, TransportConfig, WsConnector};
//!
//! # async fn example() -> Result<(), veil_transport::TransportError> {
//! let connector = WsConnector::new(TransportConfig::new());
//! let (tx, mut rx) = connector.connect("wss://relay.example.net/onion").await?.split();
//!
//! tx.send(vec![0x30, 0, 0, 0, 1, 0, 0, 0, 0, 0]).await?;
//! if let Some(frame) = rx.recv().await {
//!     println!("got {} bytes", frame.len());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
mod websocket;

pub use config::TransportConfig;
pub use connection::{
    connect_with_timeout, duplex_pair, Connector, Duplex, FrameReceiver, FrameSender,
};
pub use error::TransportError;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryConnector, MemoryListener};
pub use websocket::WsConnector;
