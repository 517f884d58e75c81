//! In-memory connector for tests.
//!
//! A [`MemoryConnector`] resolves endpoints against listeners registered
//! with [`MemoryConnector::listen`]. Connecting to an endpoint nobody
//! listens on fails like an unreachable host.

use crate::config::TransportConfig;
use crate::connection::{duplex_pair, Connector, Duplex};
use crate::TransportError;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Server side of a memory endpoint. Yields one [`Duplex`] per connect.
#[derive(Debug)]
pub struct MemoryListener {
    endpoint: String,
    incoming: mpsc::UnboundedReceiver<Duplex>,
}

impl MemoryListener {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> Option<Duplex> {
        self.incoming.recv().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Duplex>>>>,
    config: TransportConfig,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `endpoint`, replacing any previous one.
    pub fn listen(&self, endpoint: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(endpoint.to_string(), tx);
        MemoryListener {
            endpoint: endpoint.to_string(),
            incoming: rx,
        }
    }

    /// Make `endpoint` unreachable for future connects.
    pub fn unlisten(&self, endpoint: &str) {
        self.listeners.lock().remove(endpoint);
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, TransportError> {
        let listener = self.listeners.lock().get(endpoint).cloned();
        let Some(listener) = listener else {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: anyhow::anyhow!("no listener"),
            });
        };

        let (local, remote) = duplex_pair(
            endpoint,
            self.config.channel_buffer,
            self.config.max_frame_size,
        );
        listener.send(remote).map_err(|_| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source: anyhow::anyhow!("listener dropped"),
        })?;
        Ok(local)
    }
}
