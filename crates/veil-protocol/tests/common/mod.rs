//! In-memory relay network for integration tests.
//!
//! Every relay listens on a `mem://` endpoint with its own hybrid keypair.
//! Only entry relays see client connections; extension is simulated by the
//! shared circuit registry, so the entry "forwards" by peeling the client's
//! layers and decapsulating with the next relay's key.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use veil_protocol::crypto::{derive_session_key, HybridKeyPair};
use veil_protocol::onion::{derive_layer_keys, peel_onion, wrap_onion};
use veil_protocol::{
    HybridCrypto, HybridKem, LayerKeys, MessageType, RelayMessage, RelayNodeInfo, RelayRole,
    TransportCipher, PROTOCOL_VERSION,
};
use veil_transport::{Duplex, FrameSender, MemoryConnector};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Hop index whose extension the network refuses with ERROR.
    pub fail_extend_at: Option<usize>,
    /// Send every RELAY_DATA payload back down the circuit.
    pub echo: bool,
    /// Version byte put in HELLO_RESPONSE.
    pub hello_version: u8,
    /// Never answer HEARTBEAT.
    pub ignore_heartbeats: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            fail_extend_at: None,
            echo: false,
            hello_version: PROTOCOL_VERSION,
            ignore_heartbeats: false,
        }
    }
}

#[derive(Default)]
struct Records {
    destroyed: Vec<String>,
    delivered: Vec<(String, Vec<u8>)>,
    hellos: usize,
}

struct SimState {
    kem: HybridKem,
    options: SimOptions,
    keypairs: HashMap<String, HybridKeyPair>,
    circuits: Mutex<HashMap<String, Vec<LayerKeys>>>,
    records: Mutex<Records>,
    shutdown: watch::Sender<bool>,
}

pub struct SimNetwork {
    pub connector: MemoryConnector,
    pub relays: Vec<RelayNodeInfo>,
    state: Arc<SimState>,
}

impl SimNetwork {
    /// Start one relay per `(role, region)`.
    pub fn start(layout: &[(RelayRole, &str)], options: SimOptions) -> Self {
        let kem = HybridKem::new();
        let connector = MemoryConnector::new();
        let mut keypairs = HashMap::new();
        let mut relays = Vec::new();

        for (i, (role, region)) in layout.iter().enumerate() {
            let endpoint = format!("mem://relay-{i}");
            let keypair = kem.generate_keypair().unwrap();
            let public_key = kem.serialize_public_key(&kem.public_key(&keypair));
            relays.push(
                RelayNodeInfo::new(public_key, &endpoint, vec![*role])
                    .with_region(*region)
                    .with_trust(0.9)
                    .with_bandwidth(8 * 1024 * 1024)
                    .with_latency(40),
            );
            keypairs.insert(endpoint, keypair);
        }

        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(SimState {
            kem,
            options,
            keypairs,
            circuits: Mutex::new(HashMap::new()),
            records: Mutex::new(Records::default()),
            shutdown,
        });

        for relay in &relays {
            let mut listener = connector.listen(&relay.endpoint);
            let state = Arc::clone(&state);
            let endpoint = relay.endpoint.clone();
            tokio::spawn(async move {
                while let Some(duplex) = listener.accept().await {
                    tokio::spawn(serve(Arc::clone(&state), endpoint.clone(), duplex));
                }
            });
        }

        Self {
            connector,
            relays,
            state,
        }
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(self.connector.clone())
    }

    /// Drop every live relay connection.
    pub fn disconnect_all(&self) {
        let _ = self.state.shutdown.send(true);
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.records.lock().destroyed.clone()
    }

    pub fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.state.records.lock().delivered.clone()
    }

    pub fn hellos(&self) -> usize {
        self.state.records.lock().hellos
    }

    /// Hops the network holds for `circuit_id`.
    pub fn circuit_hops(&self, circuit_id: &str) -> Option<usize> {
        self.state.circuits.lock().get(circuit_id).map(Vec::len)
    }

    /// Layer keys the network derived, entry first.
    pub fn layer_keys(&self, circuit_id: &str) -> Vec<LayerKeys> {
        self.state
            .circuits
            .lock()
            .get(circuit_id)
            .cloned()
            .unwrap_or_default()
    }
}

async fn serve(state: Arc<SimState>, endpoint: String, duplex: Duplex) {
    let (tx, mut rx) = duplex.split();
    let mut shutdown = state.shutdown.subscribe();
    let mut cipher: Option<TransportCipher> = None;

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let plain = match &cipher {
            Some(c) => c.open(&frame).unwrap(),
            None => frame,
        };
        let msg = RelayMessage::decode(&plain).unwrap();

        if msg.msg_type == MessageType::Hello {
            let (reply, session) = state.hello(&msg);
            tx.send(reply.encode().unwrap()).await.unwrap();
            cipher = Some(session);
            continue;
        }

        let Some(cipher) = cipher.as_ref() else {
            panic!("{endpoint}: {} before HELLO", msg.msg_type);
        };
        for reply in state.handle(&endpoint, msg) {
            send_sealed(&tx, cipher, &reply).await;
        }
    }
}

async fn send_sealed(tx: &FrameSender, cipher: &TransportCipher, msg: &RelayMessage) {
    let nonce: [u8; 16] = rand_nonce();
    let _ = tx.send(cipher.seal(&msg.encode().unwrap(), nonce)).await;
}

fn rand_nonce() -> [u8; 16] {
    let bytes = HybridKem::new().random_bytes(16);
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&bytes);
    nonce
}

impl SimState {
    fn hello(&self, msg: &RelayMessage) -> (RelayMessage, TransportCipher) {
        assert_eq!(msg.payload[0], PROTOCOL_VERSION);
        self.records.lock().hellos += 1;

        let client_key = self.kem.deserialize_public_key(&msg.payload[1..]).unwrap();
        let (ciphertext, secret) = self.kem.encapsulate(&client_key).unwrap();
        let session = TransportCipher::new(derive_session_key(secret).unwrap());

        let mut payload = vec![self.options.hello_version];
        payload.extend_from_slice(&self.kem.serialize_ciphertext(&ciphertext));
        let reply = RelayMessage::new(MessageType::HelloResponse, msg.request_id).with_payload(payload);
        (reply, session)
    }

    fn handle(&self, endpoint: &str, msg: RelayMessage) -> Vec<RelayMessage> {
        let id = msg.request_id;
        let circuit_id = msg.circuit_id.clone().unwrap_or_default();
        match msg.msg_type {
            MessageType::CreateCircuit => {
                let secret = self.decapsulate(endpoint, &msg.payload);
                let keys = derive_layer_keys(&secret, &circuit_id, 0).unwrap();
                self.circuits.lock().insert(circuit_id.clone(), vec![keys]);
                vec![RelayMessage::new(MessageType::CircuitCreated, id)
                    .with_circuit(circuit_id)
                    .with_payload(vec![0x01])]
            }
            MessageType::ExtendCircuit => vec![self.extend(id, &circuit_id, &msg.payload)],
            MessageType::RelayData => {
                let hops = self.layer_keys(&circuit_id);
                let plain = peel_onion(&self.kem, &msg.payload, &hops).unwrap();
                self.records
                    .lock()
                    .delivered
                    .push((circuit_id.clone(), plain.clone()));

                let mut replies = vec![RelayMessage::new(MessageType::RelayAck, id)
                    .with_circuit(circuit_id.clone())];
                if self.options.echo {
                    let wrapped = wrap_onion(&self.kem, &plain, &hops).unwrap();
                    replies.push(
                        RelayMessage::new(MessageType::RelayData, 0)
                            .with_circuit(circuit_id)
                            .with_payload(wrapped),
                    );
                }
                replies
            }
            MessageType::DestroyCircuit => {
                self.circuits.lock().remove(&circuit_id);
                self.records.lock().destroyed.push(circuit_id);
                Vec::new()
            }
            MessageType::Heartbeat if self.options.ignore_heartbeats => Vec::new(),
            MessageType::Heartbeat => vec![RelayMessage::new(MessageType::HeartbeatAck, id)],
            other => vec![RelayMessage::new(MessageType::Error, id)
                .with_payload(format!("unexpected {other}").into_bytes())],
        }
    }

    fn extend(&self, id: u32, circuit_id: &str, payload: &[u8]) -> RelayMessage {
        let hops = self.layer_keys(circuit_id);
        let hop_index = hops.len();
        if self.options.fail_extend_at == Some(hop_index) {
            return RelayMessage::new(MessageType::Error, id)
                .with_circuit(circuit_id)
                .with_payload(b"next hop unreachable".to_vec());
        }

        let plain = peel_onion(&self.kem, payload, &hops).unwrap();
        let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
        let next = std::str::from_utf8(&plain[2..2 + len]).unwrap().to_string();
        let secret = self.decapsulate(&next, &plain[2 + len..]);
        let keys = derive_layer_keys(&secret, circuit_id, hop_index).unwrap();

        // Confirmation is wrapped by the hops that existed before this one.
        let confirmation = wrap_onion(&self.kem, &[0x01], &hops).unwrap();
        self.circuits
            .lock()
            .entry(circuit_id.to_string())
            .or_default()
            .push(keys);
        RelayMessage::new(MessageType::CircuitExtended, id)
            .with_circuit(circuit_id)
            .with_payload(confirmation)
    }

    fn decapsulate(&self, endpoint: &str, ciphertext: &[u8]) -> veil_protocol::SharedSecret {
        let keypair = &self.keypairs[endpoint];
        let ciphertext = self.kem.deserialize_ciphertext(ciphertext).unwrap();
        self.kem.decapsulate(&ciphertext, keypair).unwrap()
    }

    fn layer_keys(&self, circuit_id: &str) -> Vec<LayerKeys> {
        self.circuits
            .lock()
            .get(circuit_id)
            .cloned()
            .unwrap_or_default()
    }
}
