//! Relay wire format.
//!
//! ```text
//! type:1 | request_id:4 BE | circuit_id_len:1 | circuit_id (UTF-8) | payload_len:4 BE | payload
//! ```
//!
//! After the handshake every frame travels inside a [`TransportCipher`]
//! envelope: `nonce:16 ‖ frame XOR keystream`.
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::VeilError;

/// Protocol version carried in HELLO / HELLO_RESPONSE.
pub const PROTOCOL_VERSION: u8 = 1;

/// One-byte success marker in CIRCUIT_CREATED / CIRCUIT_EXTENDED.
pub const SUCCESS_MARKER: u8 = 0x01;

/// Obfuscation nonce length.
pub const TRANSPORT_NONCE_BYTES: usize = 16;

/// Fixed bytes around the variable fields: type, request id, two lengths.
const HEADER_BYTES: usize = 1 + 4 + 1 + 4;

/// Relay message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    HelloResponse,
    CreateCircuit,
    CircuitCreated,
    ExtendCircuit,
    CircuitExtended,
    DestroyCircuit,
    RelayData,
    RelayAck,
    Heartbeat,
    HeartbeatAck,
    Error,
    /// A code this implementation does not know.
    Unrecognized(u8),
}

impl MessageType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => MessageType::Hello,
            0x02 => MessageType::HelloResponse,
            0x10 => MessageType::CreateCircuit,
            0x11 => MessageType::CircuitCreated,
            0x12 => MessageType::ExtendCircuit,
            0x13 => MessageType::CircuitExtended,
            0x14 => MessageType::DestroyCircuit,
            0x20 => MessageType::RelayData,
            0x21 => MessageType::RelayAck,
            0x30 => MessageType::Heartbeat,
            0x31 => MessageType::HeartbeatAck,
            0xFF => MessageType::Error,
            other => MessageType::Unrecognized(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MessageType::Hello => 0x01,
            MessageType::HelloResponse => 0x02,
            MessageType::CreateCircuit => 0x10,
            MessageType::CircuitCreated => 0x11,
            MessageType::ExtendCircuit => 0x12,
            MessageType::CircuitExtended => 0x13,
            MessageType::DestroyCircuit => 0x14,
            MessageType::RelayData => 0x20,
            MessageType::RelayAck => 0x21,
            MessageType::Heartbeat => 0x30,
            MessageType::HeartbeatAck => 0x31,
            MessageType::Error => 0xFF,
            MessageType::Unrecognized(code) => code,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::HelloResponse => "HELLO_RESPONSE",
            MessageType::CreateCircuit => "CREATE_CIRCUIT",
            MessageType::CircuitCreated => "CIRCUIT_CREATED",
            MessageType::ExtendCircuit => "EXTEND_CIRCUIT",
            MessageType::CircuitExtended => "CIRCUIT_EXTENDED",
            MessageType::DestroyCircuit => "DESTROY_CIRCUIT",
            MessageType::RelayData => "RELAY_DATA",
            MessageType::RelayAck => "RELAY_ACK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::Error => "ERROR",
            MessageType::Unrecognized(code) => return write!(f, "UNRECOGNIZED(0x{code:02x})"),
        };
        f.write_str(name)
    }
}

/// A single framed relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub msg_type: MessageType,
    pub request_id: u32,
    /// Empty on the wire when `None`.
    pub circuit_id: Option<String>,
    pub payload: Vec<u8>,
}

impl RelayMessage {
    pub fn new(msg_type: MessageType, request_id: u32) -> Self {
        Self {
            msg_type,
            request_id,
            circuit_id: None,
            payload: Vec::new(),
        }
    }

    pub fn with_circuit(mut self, circuit_id: impl Into<String>) -> Self {
        self.circuit_id = Some(circuit_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, VeilError> {
        let circuit = self.circuit_id.as_deref().unwrap_or("").as_bytes();
        if circuit.len() > u8::MAX as usize {
            return Err(VeilError::MalformedFrame(format!(
                "circuit id is {} bytes (max 255)",
                circuit.len()
            )));
        }
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            VeilError::MalformedFrame(format!("payload is {} bytes", self.payload.len()))
        })?;

        let mut out = Vec::with_capacity(HEADER_BYTES + circuit.len() + self.payload.len());
        out.push(self.msg_type.code());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.push(circuit.len() as u8);
        out.extend_from_slice(circuit);
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, VeilError> {
        let mut reader = Reader::new(data);

        let msg_type = MessageType::from_code(reader.u8("type")?);
        let request_id = u32::from_be_bytes(reader.array("request id")?);

        let circuit_len = reader.u8("circuit id length")? as usize;
        let circuit_bytes = reader.take(circuit_len, "circuit id")?;
        let circuit_id = if circuit_bytes.is_empty() {
            None
        } else {
            let s = std::str::from_utf8(circuit_bytes)
                .map_err(|_| VeilError::MalformedFrame("circuit id is not UTF-8".into()))?;
            Some(s.to_string())
        };

        let payload_len = u32::from_be_bytes(reader.array("payload length")?) as usize;
        let payload = reader.take(payload_len, "payload")?.to_vec();

        if reader.remaining() != 0 {
            return Err(VeilError::MalformedFrame(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }

        Ok(Self {
            msg_type,
            request_id,
            circuit_id,
            payload,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], VeilError> {
        if self.remaining() < len {
            return Err(VeilError::MalformedFrame(format!(
                "truncated {field}: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, field: &str) -> Result<u8, VeilError> {
        Ok(self.take(1, field)?[0])
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], VeilError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }
}

// ── Transport obfuscation ─────────────────────────────────────────────

/// XOR keystream envelope keyed by the connection's session key.
///
/// Not authenticated. Confidentiality of relayed data comes from the
/// onion layers.
pub struct TransportCipher {
    key: Zeroizing<[u8; 32]>,
}

impl TransportCipher {
    pub fn new(session_key: Zeroizing<[u8; 32]>) -> Self {
        Self { key: session_key }
    }

    /// `nonce ‖ frame XOR keystream(nonce)`.
    pub fn seal(&self, frame: &[u8], nonce: [u8; TRANSPORT_NONCE_BYTES]) -> Vec<u8> {
        let mut out = Vec::with_capacity(TRANSPORT_NONCE_BYTES + frame.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(frame);
        self.apply_keystream(&nonce, &mut out[TRANSPORT_NONCE_BYTES..]);
        out
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, VeilError> {
        if data.len() < TRANSPORT_NONCE_BYTES {
            return Err(VeilError::MalformedFrame(format!(
                "obfuscated frame is {} bytes, shorter than its nonce",
                data.len()
            )));
        }
        let (nonce, body) = data.split_at(TRANSPORT_NONCE_BYTES);
        let mut frame = body.to_vec();
        self.apply_keystream(nonce, &mut frame);
        Ok(frame)
    }

    /// Block i = SHA-256(key ‖ nonce ‖ i as u32 BE).
    fn apply_keystream(&self, nonce: &[u8], buf: &mut [u8]) {
        for (i, chunk) in buf.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.key.as_slice());
            hasher.update(nonce);
            hasher.update((i as u32).to_be_bytes());
            let block = hasher.finalize();
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }
}

impl std::fmt::Debug for TransportCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportCipher([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_exact_layout() {
        let msg = RelayMessage::new(MessageType::RelayData, 0x0102_0304)
            .with_circuit("ab")
            .with_payload(vec![0xAA, 0xBB, 0xCC]);
        let bytes = msg.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x20, // type
                0x01, 0x02, 0x03, 0x04, // request id
                0x02, b'a', b'b', // circuit id
                0x00, 0x00, 0x00, 0x03, // payload length
                0xAA, 0xBB, 0xCC,
            ]
        );
    }

    #[test]
    fn empty_circuit_decodes_as_none() {
        let bytes = RelayMessage::new(MessageType::Heartbeat, 9).encode().unwrap();
        assert_eq!(bytes.len(), HEADER_BYTES);
        let msg = RelayMessage::decode(&bytes).unwrap();
        assert_eq!(msg.circuit_id, None);
        assert_eq!(msg.msg_type, MessageType::Heartbeat);
        assert_eq!(msg.request_id, 9);
    }

    #[test]
    fn unknown_code_is_unrecognized() {
        let mut bytes = RelayMessage::new(MessageType::Hello, 1).encode().unwrap();
        bytes[0] = 0x42;
        let msg = RelayMessage::decode(&bytes).unwrap();
        assert_eq!(msg.msg_type, MessageType::Unrecognized(0x42));
        assert_eq!(msg.msg_type.code(), 0x42);
    }

    #[test]
    fn every_known_code_maps_back() {
        for code in [
            0x01, 0x02, 0x10, 0x11, 0x12, 0x13, 0x14, 0x20, 0x21, 0x30, 0x31, 0xFF,
        ] {
            let t = MessageType::from_code(code);
            assert!(!matches!(t, MessageType::Unrecognized(_)));
            assert_eq!(t.code(), code);
        }
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let bytes = RelayMessage::new(MessageType::RelayData, 1)
            .with_circuit("abc")
            .with_payload(vec![1, 2, 3, 4])
            .encode()
            .unwrap();
        for cut in 0..bytes.len() {
            assert!(
                matches!(
                    RelayMessage::decode(&bytes[..cut]),
                    Err(VeilError::MalformedFrame(_))
                ),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut bytes = RelayMessage::new(MessageType::RelayAck, 1).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            RelayMessage::decode(&bytes),
            Err(VeilError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_circuit_id_rejected() {
        let msg = RelayMessage::new(MessageType::DestroyCircuit, 1).with_circuit("x".repeat(256));
        assert!(matches!(msg.encode(), Err(VeilError::MalformedFrame(_))));

        let ok = RelayMessage::new(MessageType::DestroyCircuit, 1).with_circuit("x".repeat(255));
        assert!(ok.encode().is_ok());
    }

    #[test]
    fn non_utf8_circuit_id_rejected() {
        let bytes = vec![0x14, 0, 0, 0, 1, 2, 0xFF, 0xFE, 0, 0, 0, 0];
        assert!(matches!(
            RelayMessage::decode(&bytes),
            Err(VeilError::MalformedFrame(_))
        ));
    }

    #[test]
    fn cipher_open_reverses_seal() {
        let cipher = TransportCipher::new(Zeroizing::new([3u8; 32]));
        let frame: Vec<u8> = (0..100u8).collect();
        let sealed = cipher.seal(&frame, [9u8; TRANSPORT_NONCE_BYTES]);

        assert_eq!(&sealed[..TRANSPORT_NONCE_BYTES], &[9u8; TRANSPORT_NONCE_BYTES]);
        assert_ne!(&sealed[TRANSPORT_NONCE_BYTES..], &frame[..]);
        assert_eq!(cipher.open(&sealed).unwrap(), frame);
    }

    #[test]
    fn cipher_keystream_matches_definition() {
        let key = [5u8; 32];
        let nonce = [1u8; TRANSPORT_NONCE_BYTES];
        let cipher = TransportCipher::new(Zeroizing::new(key));
        let sealed = cipher.seal(&[0u8; 40], nonce);

        let mut block0 = Sha256::new();
        block0.update(key);
        block0.update(nonce);
        block0.update(0u32.to_be_bytes());
        let mut block1 = Sha256::new();
        block1.update(key);
        block1.update(nonce);
        block1.update(1u32.to_be_bytes());

        let body = &sealed[TRANSPORT_NONCE_BYTES..];
        assert_eq!(&body[..32], block0.finalize().as_slice());
        assert_eq!(&body[32..], &block1.finalize()[..8]);
    }

    #[test]
    fn cipher_rejects_short_input() {
        let cipher = TransportCipher::new(Zeroizing::new([0u8; 32]));
        assert!(cipher.open(&[0u8; 15]).is_err());
        assert_eq!(cipher.open(&[0u8; 16]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn display_names() {
        assert_eq!(MessageType::CircuitExtended.to_string(), "CIRCUIT_EXTENDED");
        assert_eq!(MessageType::Unrecognized(0x7f).to_string(), "UNRECOGNIZED(0x7f)");
    }
}
