//! Relay client: connections, handshake and onion circuits.
//!
//! ```text
//! RelayClient
//!   ├── connections: RelayId → RelayConnection (reader task, heartbeat)
//!   └── circuits:    circuit id → OnionCircuit (hops, layer keys)
//! ```
//!
//! A circuit is anchored on the connection to its entry relay. Losing that
//! connection closes every circuit built on it.

pub mod circuit;
pub mod config;
pub mod connection;

pub use circuit::{CircuitInbound, CircuitState, OnionCircuit};
pub use config::{ClientConfig, MAX_RELAY_PAYLOAD};
pub use connection::{ConnectionState, RelayConnection};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use veil_transport::{connect_with_timeout, Connector};

use crate::crypto::{derive_session_key, HybridCrypto, HybridKem};
use crate::directory::RelayNodeInfo;
use crate::message::{MessageType, RelayMessage, PROTOCOL_VERSION, SUCCESS_MARKER};
use crate::onion::derive_layer_keys;
use crate::types::RelayId;
use crate::VeilError;

use circuit::CircuitHop;

/// Bytes of randomness in a circuit id (hex encoded on the wire).
const CIRCUIT_ID_BYTES: usize = 16;

struct ClientInner<C: HybridCrypto> {
    config: ClientConfig,
    crypto: Arc<C>,
    connector: Arc<dyn Connector>,
    keypair: C::KeyPair,
    connections: Mutex<HashMap<RelayId, Arc<RelayConnection>>>,
    circuits: Mutex<HashMap<String, Arc<OnionCircuit>>>,
    next_serial: AtomicU64,
}

impl<C: HybridCrypto> ClientInner<C> {
    /// Called from a connection's teardown. Ignores connections that have
    /// already been replaced in the table.
    fn connection_lost(&self, relay_id: &RelayId, serial: u64) {
        {
            let mut connections = self.connections.lock();
            if connections.get(relay_id).map(|c| c.serial()) == Some(serial) {
                connections.remove(relay_id);
            }
        }

        let orphaned: Vec<Arc<OnionCircuit>> = {
            let mut circuits = self.circuits.lock();
            let ids: Vec<String> = circuits
                .iter()
                .filter(|(_, c)| c.connection().serial() == serial)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| circuits.remove(id)).collect()
        };
        for circuit in &orphaned {
            circuit.close();
        }
        if !orphaned.is_empty() {
            tracing::info!(
                relay = %relay_id,
                circuits = orphaned.len(),
                "entry connection lost, circuits closed"
            );
        }
    }
}

/// Builds and drives onion circuits over relay connections.
///
/// Cheap to clone; clones share connections and circuits.
pub struct RelayClient<C: HybridCrypto = HybridKem> {
    inner: Arc<ClientInner<C>>,
}

impl<C: HybridCrypto> Clone for RelayClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: HybridCrypto> std::fmt::Debug for RelayClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("connections", &self.inner.connections.lock().len())
            .field("circuits", &self.inner.circuits.lock().len())
            .finish()
    }
}

impl<C: HybridCrypto> RelayClient<C> {
    /// Create a client with a fresh hybrid keypair.
    pub fn new(
        config: ClientConfig,
        crypto: Arc<C>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, VeilError> {
        let keypair = crypto.generate_keypair()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                crypto,
                connector,
                keypair,
                connections: Mutex::new(HashMap::new()),
                circuits: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Connect and handshake with `relay`, reusing a ready connection.
    pub async fn connect(&self, relay: &RelayNodeInfo) -> Result<Arc<RelayConnection>, VeilError> {
        let existing = self.inner.connections.lock().get(&relay.id).cloned();
        if let Some(existing) = existing.filter(|c| c.is_ready()) {
            return Ok(existing);
        }

        let config = &self.inner.config;
        let duplex = connect_with_timeout(
            self.inner.connector.as_ref(),
            &relay.endpoint,
            config.connect_timeout,
        )
        .await?;
        let (sender, receiver) = duplex.split();

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(RelayConnection::new(
            serial,
            relay.id.clone(),
            relay.endpoint.clone(),
            sender,
            config.request_timeout,
        ));
        connection.start_reader(receiver);
        connection.set_state(ConnectionState::Handshaking);

        if let Err(e) = self.handshake(&connection).await {
            tracing::warn!(relay = %relay.id, endpoint = %relay.endpoint, "handshake failed: {e}");
            connection.fail();
            return Err(e);
        }

        let weak: Weak<ClientInner<C>> = Arc::downgrade(&self.inner);
        let relay_id = relay.id.clone();
        connection.set_on_close(Box::new(move |serial| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(&relay_id, serial);
            }
        }));
        connection.set_state(ConnectionState::Ready);
        connection.start_heartbeat(config.heartbeat_interval, config.heartbeat_timeout);

        if !connection.is_ready() {
            // Transport dropped between handshake and registration.
            return Err(VeilError::ConnectionClosed);
        }
        // A concurrent connect may have registered first; keep exactly one.
        let registered = {
            let mut connections = self.inner.connections.lock();
            match connections.get(&relay.id) {
                Some(other) if other.is_ready() => Some(Arc::clone(other)),
                _ => {
                    connections.insert(relay.id.clone(), Arc::clone(&connection));
                    None
                }
            }
        };
        if let Some(other) = registered {
            tracing::debug!(relay = %relay.id, "relay already connected, dropping duplicate");
            connection.close();
            return Ok(other);
        }

        tracing::info!(relay = %relay.id, endpoint = %relay.endpoint, "relay connection ready");
        Ok(connection)
    }

    async fn handshake(&self, connection: &RelayConnection) -> Result<(), VeilError> {
        let crypto = self.inner.crypto.as_ref();
        let public_key = crypto.public_key(&self.inner.keypair);

        let mut hello = vec![PROTOCOL_VERSION];
        hello.extend_from_slice(&crypto.serialize_public_key(&public_key));

        let reply = connection.request(MessageType::Hello, None, hello).await?;
        expect_type(&reply, MessageType::HelloResponse)?;

        let (&version, ciphertext) = reply
            .payload
            .split_first()
            .ok_or_else(|| VeilError::MalformedFrame("empty HELLO_RESPONSE".into()))?;
        if version != PROTOCOL_VERSION {
            return Err(VeilError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let ciphertext = crypto.deserialize_ciphertext(ciphertext)?;
        let secret = crypto.decapsulate(&ciphertext, &self.inner.keypair)?;
        connection.install_session_key(derive_session_key(secret)?)
    }

    /// State of the live connection to `relay_id`, if any.
    pub fn connection_state(&self, relay_id: &RelayId) -> Option<ConnectionState> {
        self.inner.connections.lock().get(relay_id).map(|c| c.state())
    }

    pub fn active_connections(&self) -> Vec<RelayId> {
        let mut ids: Vec<RelayId> = self.inner.connections.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── Circuits ────────────────────────────────────────────────────

    /// Build a circuit through `path`, entry first.
    ///
    /// On failure the half-built circuit is destroyed and the error that
    /// stopped the build is returned.
    pub async fn build_circuit(
        &self,
        path: &[RelayNodeInfo],
        destination: Option<String>,
    ) -> Result<Arc<OnionCircuit>, VeilError> {
        let entry = path.first().ok_or(VeilError::EmptyPath)?;
        let connection = self.connect(entry).await?;

        let circuit_id = hex::encode(self.inner.crypto.random_bytes(CIRCUIT_ID_BYTES));
        let inbound = connection.register_circuit(&circuit_id);
        let circuit = Arc::new(OnionCircuit::new(
            circuit_id.clone(),
            connection,
            destination,
            inbound,
        ));
        self.inner
            .circuits
            .lock()
            .insert(circuit_id.clone(), Arc::clone(&circuit));

        tracing::debug!(circuit = %circuit_id, hops = path.len(), "building circuit");
        match self.establish(&circuit, path).await {
            Ok(()) => {
                circuit.set_state(CircuitState::Ready);
                if circuit.state() != CircuitState::Ready {
                    return Err(VeilError::ConnectionClosed);
                }
                tracing::info!(circuit = %circuit_id, hops = path.len(), "circuit ready");
                Ok(circuit)
            }
            Err(e) => {
                tracing::warn!(circuit = %circuit_id, "circuit build failed: {e}");
                circuit.set_state(CircuitState::Error);
                self.destroy_circuit(&circuit_id).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, circuit: &OnionCircuit, path: &[RelayNodeInfo]) -> Result<(), VeilError> {
        let Some((entry, rest)) = path.split_first() else {
            return Err(VeilError::EmptyPath);
        };
        self.create_circuit_hop(circuit, entry).await?;
        for relay in rest {
            self.extend_circuit(circuit, relay).await?;
        }
        Ok(())
    }

    /// First hop: key agreement with the entry relay.
    async fn create_circuit_hop(
        &self,
        circuit: &OnionCircuit,
        relay: &RelayNodeInfo,
    ) -> Result<(), VeilError> {
        let crypto = self.inner.crypto.as_ref();
        let public_key = crypto.deserialize_public_key(&relay.public_key)?;
        let (ciphertext, secret) = crypto.encapsulate(&public_key)?;

        let reply = circuit
            .connection()
            .request(
                MessageType::CreateCircuit,
                Some(circuit.id()),
                crypto.serialize_ciphertext(&ciphertext),
            )
            .await?;
        expect_type(&reply, MessageType::CircuitCreated)?;
        expect_success(&reply.payload)?;

        let keys = derive_layer_keys(&secret, circuit.id(), 0)?;
        circuit.push_hop(CircuitHop::new(relay.clone(), secret, keys));
        tracing::debug!(circuit = %circuit.id(), relay = %relay.id, "entry hop created");
        Ok(())
    }

    /// Extend the circuit by one hop, tunnelled through the existing ones.
    async fn extend_circuit(
        &self,
        circuit: &OnionCircuit,
        relay: &RelayNodeInfo,
    ) -> Result<(), VeilError> {
        let crypto = self.inner.crypto.as_ref();
        let public_key = crypto.deserialize_public_key(&relay.public_key)?;
        let (ciphertext, secret) = crypto.encapsulate(&public_key)?;

        let endpoint = relay.endpoint.as_bytes();
        let endpoint_len = u16::try_from(endpoint.len()).map_err(|_| {
            VeilError::InvalidRelayRecord(format!("endpoint too long: {} bytes", endpoint.len()))
        })?;
        let ciphertext = crypto.serialize_ciphertext(&ciphertext);
        let mut payload = Vec::with_capacity(2 + endpoint.len() + ciphertext.len());
        payload.extend_from_slice(&endpoint_len.to_be_bytes());
        payload.extend_from_slice(endpoint);
        payload.extend_from_slice(&ciphertext);

        let wrapped = circuit.wrap(crypto, &payload)?;
        let reply = circuit
            .connection()
            .request(MessageType::ExtendCircuit, Some(circuit.id()), wrapped)
            .await?;
        expect_type(&reply, MessageType::CircuitExtended)?;
        let confirmation = circuit.peel(crypto, &reply.payload)?;
        expect_success(&confirmation)?;

        let hop_index = circuit.hop_count();
        let keys = derive_layer_keys(&secret, circuit.id(), hop_index)?;
        circuit.push_hop(CircuitHop::new(relay.clone(), secret, keys));
        tracing::debug!(circuit = %circuit.id(), relay = %relay.id, hop = hop_index, "circuit extended");
        Ok(())
    }

    /// Send `data` through a ready circuit and wait for the entry's ack.
    pub async fn send_through_circuit(&self, circuit_id: &str, data: &[u8]) -> Result<(), VeilError> {
        let circuit = self.ready_circuit(circuit_id)?;
        let max = self.inner.config.max_payload;
        if data.len() > max {
            return Err(VeilError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }

        let wrapped = circuit.wrap(self.inner.crypto.as_ref(), data)?;
        let reply = circuit
            .connection()
            .request(MessageType::RelayData, Some(circuit_id), wrapped)
            .await?;
        expect_type(&reply, MessageType::RelayAck)
    }

    fn ready_circuit(&self, circuit_id: &str) -> Result<Arc<OnionCircuit>, VeilError> {
        let circuit = self
            .circuit(circuit_id)
            .ok_or_else(|| VeilError::UnknownCircuit(circuit_id.to_string()))?;
        match circuit.state() {
            CircuitState::Ready => Ok(circuit),
            state => Err(VeilError::CircuitNotReady {
                circuit_id: circuit_id.to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Take the inbound stream of a circuit. Only the first call gets it.
    pub fn take_inbound(&self, circuit_id: &str) -> Option<CircuitInbound<C>> {
        let circuit = self.circuit(circuit_id)?;
        let rx = circuit.take_inbound()?;
        Some(CircuitInbound::new(circuit, Arc::clone(&self.inner.crypto), rx))
    }

    /// Tear a circuit down. Unknown ids are ignored.
    pub async fn destroy_circuit(&self, circuit_id: &str) {
        let Some(circuit) = self.inner.circuits.lock().remove(circuit_id) else {
            return;
        };

        let connection = circuit.connection();
        if connection.is_ready() {
            if let Err(e) = connection
                .notify(MessageType::DestroyCircuit, Some(circuit_id), Vec::new())
                .await
            {
                tracing::debug!(circuit = %circuit_id, "DESTROY_CIRCUIT not delivered: {e}");
            }
        }
        connection.unregister_circuit(circuit_id);
        circuit.close();
        tracing::info!(circuit = %circuit_id, "circuit destroyed");
    }

    /// Destroy every circuit and close every connection.
    pub async fn cleanup(&self) {
        for circuit_id in self.active_circuits() {
            self.destroy_circuit(&circuit_id).await;
        }
        let connections: Vec<Arc<RelayConnection>> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.close();
        }
    }

    pub fn circuit(&self, circuit_id: &str) -> Option<Arc<OnionCircuit>> {
        self.inner.circuits.lock().get(circuit_id).cloned()
    }

    pub fn circuit_state(&self, circuit_id: &str) -> Option<CircuitState> {
        self.circuit(circuit_id).map(|c| c.state())
    }

    pub fn circuit_hop_count(&self, circuit_id: &str) -> Option<usize> {
        self.circuit(circuit_id).map(|c| c.hop_count())
    }

    pub fn active_circuits(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.circuits.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn expect_type(reply: &RelayMessage, expected: MessageType) -> Result<(), VeilError> {
    if reply.msg_type == expected {
        Ok(())
    } else {
        Err(VeilError::UnexpectedReply {
            expected: expected.to_string(),
            got: reply.msg_type.to_string(),
        })
    }
}

fn expect_success(payload: &[u8]) -> Result<(), VeilError> {
    if payload == [SUCCESS_MARKER] {
        Ok(())
    } else {
        Err(VeilError::UnexpectedReply {
            expected: "success marker".into(),
            got: hex::encode(payload),
        })
    }
}
