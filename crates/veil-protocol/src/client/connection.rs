//! One live connection to a relay.
//!
//! A single reader task owns the inbound half and is the only place
//! pending requests get completed. Requests are correlated by id, so
//! replies may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use veil_transport::{FrameReceiver, FrameSender};
use zeroize::Zeroizing;

use crate::message::{MessageType, RelayMessage, TransportCipher, TRANSPORT_NONCE_BYTES};
use crate::types::{now_ms, RelayId};
use crate::VeilError;

/// Lifecycle of a [`RelayConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Error,
    Closed,
}

impl ConnectionState {
    fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }
}

type Reply = Result<RelayMessage, VeilError>;
type CloseHook = Box<dyn FnOnce(u64) + Send>;

pub struct RelayConnection {
    serial: u64,
    relay_id: RelayId,
    endpoint: String,
    state: Mutex<ConnectionState>,
    sender: Mutex<Option<FrameSender>>,
    cipher: OnceLock<TransportCipher>,
    /// `None` once the connection is torn down.
    pending: Mutex<Option<HashMap<u32, oneshot::Sender<Reply>>>>,
    next_request_id: AtomicU32,
    last_activity: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    circuit_sinks: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    on_close: Mutex<Option<CloseHook>>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("serial", &self.serial)
            .field("relay_id", &self.relay_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayConnection {
    pub(crate) fn new(
        serial: u64,
        relay_id: RelayId,
        endpoint: String,
        sender: FrameSender,
        request_timeout: Duration,
    ) -> Self {
        Self {
            serial,
            relay_id,
            endpoint,
            state: Mutex::new(ConnectionState::Connecting),
            sender: Mutex::new(Some(sender)),
            cipher: OnceLock::new(),
            pending: Mutex::new(Some(HashMap::new())),
            next_request_id: AtomicU32::new(1),
            last_activity: AtomicU64::new(now_ms()),
            request_timeout,
            reader: Mutex::new(None),
            heartbeat: Mutex::new(None),
            circuit_sinks: Mutex::new(HashMap::new()),
            on_close: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn relay_id(&self) -> &RelayId {
        &self.relay_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Unix ms of the last frame sent or received.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub(crate) fn set_on_close(&self, hook: CloseHook) {
        *self.on_close.lock() = Some(hook);
    }

    /// Install the session key. Frames sent from now on are obfuscated.
    pub(crate) fn install_session_key(&self, key: Zeroizing<[u8; 32]>) -> Result<(), VeilError> {
        self.cipher
            .set(TransportCipher::new(key))
            .map_err(|_| VeilError::Crypto("session key already set".into()))
    }

    pub(crate) fn register_circuit(&self, circuit_id: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.circuit_sinks.lock().insert(circuit_id.to_string(), tx);
        rx
    }

    pub(crate) fn unregister_circuit(&self, circuit_id: &str) {
        self.circuit_sinks.lock().remove(circuit_id);
    }

    // ── Sending ─────────────────────────────────────────────────────

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_message(&self, msg: &RelayMessage) -> Result<(), VeilError> {
        let frame = msg.encode()?;
        let frame = match self.cipher.get() {
            Some(cipher) => {
                let mut nonce = [0u8; TRANSPORT_NONCE_BYTES];
                OsRng.fill_bytes(&mut nonce);
                cipher.seal(&frame, nonce)
            }
            None => frame,
        };

        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(VeilError::ConnectionClosed)?;
        sender.send(frame).await?;
        self.last_activity.store(now_ms(), Ordering::Relaxed);
        tracing::debug!(
            relay = %self.relay_id,
            msg_type = %msg.msg_type,
            request_id = msg.request_id,
            "sent frame"
        );
        Ok(())
    }

    /// Send without waiting for a reply.
    pub(crate) async fn notify(
        &self,
        msg_type: MessageType,
        circuit_id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), VeilError> {
        let msg = RelayMessage {
            msg_type,
            request_id: self.next_request_id(),
            circuit_id: circuit_id.map(String::from),
            payload,
        };
        self.send_message(&msg).await
    }

    /// Send a request and wait for the reply with the same id.
    ///
    /// An ERROR reply surfaces as [`VeilError::RelayError`].
    pub async fn request(
        &self,
        msg_type: MessageType,
        circuit_id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<RelayMessage, VeilError> {
        self.request_with_timeout(msg_type, circuit_id, payload, self.request_timeout)
            .await
    }

    pub(crate) async fn request_with_timeout(
        &self,
        msg_type: MessageType,
        circuit_id: Option<&str>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<RelayMessage, VeilError> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(request_id, tx);
            }
            None => return Err(VeilError::ConnectionClosed),
        }

        let msg = RelayMessage {
            msg_type,
            request_id,
            circuit_id: circuit_id.map(String::from),
            payload,
        };
        if let Err(e) = self.send_message(&msg).await {
            self.forget(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) if reply.msg_type == MessageType::Error => Err(
                VeilError::RelayError(String::from_utf8_lossy(&reply.payload).into_owned()),
            ),
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(VeilError::ConnectionClosed),
            Err(_) => {
                self.forget(request_id);
                Err(VeilError::RequestTimeout { request_id })
            }
        }
    }

    fn forget(&self, request_id: u32) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&request_id);
        }
    }

    // ── Receiving ───────────────────────────────────────────────────

    pub(crate) fn start_reader(self: &Arc<Self>, mut receiver: FrameReceiver) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                conn.handle_frame(frame).await;
            }
            if let Some(conn) = weak.upgrade() {
                tracing::info!(relay = %conn.relay_id, "relay connection closed by transport");
                conn.teardown(ConnectionState::Closed);
            }
        });
        *self.reader.lock() = Some(handle);
    }

    async fn handle_frame(&self, frame: Vec<u8>) {
        let decoded = match self.cipher.get() {
            Some(cipher) => cipher.open(&frame).and_then(|f| RelayMessage::decode(&f)),
            None => RelayMessage::decode(&frame),
        };
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(relay = %self.relay_id, "dropping bad frame: {e}");
                return;
            }
        };
        self.last_activity.store(now_ms(), Ordering::Relaxed);
        tracing::debug!(
            relay = %self.relay_id,
            msg_type = %msg.msg_type,
            request_id = msg.request_id,
            "received frame"
        );

        match msg.msg_type {
            MessageType::Heartbeat => {
                let ack = RelayMessage::new(MessageType::HeartbeatAck, msg.request_id);
                if let Err(e) = self.send_message(&ack).await {
                    tracing::debug!(relay = %self.relay_id, "heartbeat ack failed: {e}");
                }
            }
            MessageType::RelayData => self.route_to_circuit(msg),
            MessageType::Unrecognized(code) => tracing::debug!(
                relay = %self.relay_id,
                code,
                request_id = msg.request_id,
                "unrecognized frame dropped"
            ),
            _ => {
                let waiter = self
                    .pending
                    .lock()
                    .as_mut()
                    .and_then(|pending| pending.remove(&msg.request_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(msg));
                    }
                    None => tracing::debug!(
                        relay = %self.relay_id,
                        msg_type = %msg.msg_type,
                        request_id = msg.request_id,
                        "unsolicited frame dropped"
                    ),
                }
            }
        }
    }

    fn route_to_circuit(&self, msg: RelayMessage) {
        let Some(circuit_id) = msg.circuit_id else {
            tracing::debug!(relay = %self.relay_id, "RELAY_DATA without circuit dropped");
            return;
        };
        let sinks = self.circuit_sinks.lock();
        match sinks.get(&circuit_id) {
            Some(sink) => {
                let _ = sink.send(msg.payload);
            }
            None => tracing::debug!(circuit = %circuit_id, "RELAY_DATA for unknown circuit dropped"),
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    pub(crate) fn start_heartbeat(self: &Arc<Self>, interval: Duration, ack_timeout: Duration) {
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                if !conn.is_ready() {
                    return;
                }
                match conn
                    .request_with_timeout(MessageType::Heartbeat, None, Vec::new(), ack_timeout)
                    .await
                {
                    Ok(reply) if reply.msg_type == MessageType::HeartbeatAck => {}
                    Ok(reply) => tracing::warn!(
                        relay = %conn.relay_id,
                        "heartbeat answered with {}",
                        reply.msg_type
                    ),
                    Err(e) => tracing::warn!(relay = %conn.relay_id, "heartbeat failed: {e}"),
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.teardown(ConnectionState::Closed);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Mark the connection failed and tear it down.
    pub(crate) fn fail(&self) {
        self.teardown(ConnectionState::Error);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn teardown(&self, final_state: ConnectionState) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = final_state;
        }

        let pending = self.pending.lock().take().unwrap_or_default();
        let failed = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(VeilError::ConnectionClosed));
        }

        self.sender.lock().take();
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
        self.circuit_sinks.lock().clear();

        tracing::info!(
            relay = %self.relay_id,
            state = ?final_state,
            failed_requests = failed,
            "relay connection torn down"
        );

        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook(self.serial);
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
        }
    }
}
