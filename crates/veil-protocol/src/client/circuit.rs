use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::connection::RelayConnection;
use crate::crypto::{HybridCrypto, SharedSecret};
use crate::directory::RelayNodeInfo;
use crate::onion::{peel_onion, wrap_onion, LayerKeys};
use crate::types::now_ms;
use crate::VeilError;

/// Lifecycle of an [`OnionCircuit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Ready,
    Error,
    Closed,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Building => "building",
            CircuitState::Ready => "ready",
            CircuitState::Error => "error",
            CircuitState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One established hop: the relay and the secrets agreed with it.
pub(crate) struct CircuitHop {
    pub(crate) relay: RelayNodeInfo,
    /// Held only so the secret is wiped when the hop is dropped.
    _shared_secret: SharedSecret,
    pub(crate) keys: LayerKeys,
}

impl CircuitHop {
    pub(crate) fn new(relay: RelayNodeInfo, shared_secret: SharedSecret, keys: LayerKeys) -> Self {
        Self {
            relay,
            _shared_secret: shared_secret,
            keys,
        }
    }
}

/// A layered path through one or more relays.
///
/// Hops are ordered entry first. Secrets are wiped when the circuit is
/// closed, and again on drop.
pub struct OnionCircuit {
    id: String,
    connection: Arc<RelayConnection>,
    hops: Mutex<Vec<CircuitHop>>,
    state: Mutex<CircuitState>,
    created_at: u64,
    destination: Option<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl std::fmt::Debug for OnionCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionCircuit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("hops", &self.hop_count())
            .field("destination", &self.destination)
            .finish()
    }
}

impl OnionCircuit {
    pub(crate) fn new(
        id: String,
        connection: Arc<RelayConnection>,
        destination: Option<String>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            connection,
            hops: Mutex::new(Vec::new()),
            state: Mutex::new(CircuitState::Building),
            created_at: now_ms(),
            destination,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    pub fn hop_count(&self) -> usize {
        self.hops.lock().len()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Relays of the established hops, entry first.
    pub fn path(&self) -> Vec<RelayNodeInfo> {
        self.hops.lock().iter().map(|h| h.relay.clone()).collect()
    }

    pub(crate) fn connection(&self) -> &Arc<RelayConnection> {
        &self.connection
    }

    /// Move to `next` unless the circuit is already closed.
    pub(crate) fn set_state(&self, next: CircuitState) {
        let mut state = self.state.lock();
        if *state != CircuitState::Closed {
            *state = next;
        }
    }

    pub(crate) fn push_hop(&self, hop: CircuitHop) {
        self.hops.lock().push(hop);
    }

    /// Wrap `data` in one layer per established hop.
    pub(crate) fn wrap<C: HybridCrypto>(&self, crypto: &C, data: &[u8]) -> Result<Vec<u8>, VeilError> {
        let hops = self.hops.lock();
        wrap_onion(crypto, data, hops.iter().map(|h| &h.keys))
    }

    /// Peel one layer per established hop.
    pub(crate) fn peel<C: HybridCrypto>(&self, crypto: &C, data: &[u8]) -> Result<Vec<u8>, VeilError> {
        let hops = self.hops.lock();
        peel_onion(crypto, data, hops.iter().map(|h| &h.keys))
    }

    pub(crate) fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound.lock().take()
    }

    /// Wipe every hop's secrets and mark the circuit closed.
    pub(crate) fn close(&self) {
        // Dropping a hop zeroizes its secret and layer keys.
        self.hops.lock().clear();
        *self.state.lock() = CircuitState::Closed;
    }
}

/// Inbound data for one circuit, delivered with every layer peeled.
pub struct CircuitInbound<C: HybridCrypto> {
    circuit: Arc<OnionCircuit>,
    crypto: Arc<C>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl<C: HybridCrypto> CircuitInbound<C> {
    pub(crate) fn new(
        circuit: Arc<OnionCircuit>,
        crypto: Arc<C>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self { circuit, crypto, rx }
    }

    pub fn circuit_id(&self) -> &str {
        self.circuit.id()
    }

    /// Next payload. `None` once the circuit or its connection is gone;
    /// a payload that fails to peel yields `Err(Decryption)`.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>, VeilError>> {
        let data = self.rx.recv().await?;
        Some(self.circuit.peel(self.crypto.as_ref(), &data))
    }
}
