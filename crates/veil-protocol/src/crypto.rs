//! Hybrid post-quantum key encapsulation and AEAD.
//!
//! The protocol only talks to [`HybridCrypto`]. [`HybridKem`] is the
//! default implementation: ML-KEM-768 and X25519 run side by side and
//! their secrets are combined through HKDF-SHA256, so a session stays
//! confidential as long as either primitive holds. Payloads are sealed
//! with ChaCha20-Poly1305.
use chacha20poly1305::{
    aead::{
        rand_core::{OsRng, RngCore},
        Aead, KeyInit, Payload,
    },
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use ml_kem::{
    kem::{Decapsulate, Encapsulate},
    Encoded, EncodedSizeUser, KemCore, MlKem768,
};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::VeilError;

/// HKDF info string for combining the two KEM secrets.
const HYBRID_INFO: &[u8] = b"veil-hybrid-kem-v1";

/// HKDF label for the per-connection session key.
pub const SESSION_KEY_LABEL: &[u8] = b"veil-onion-session-v1";

pub const ML_KEM_768_PUBLIC_KEY_BYTES: usize = 1184;
pub const ML_KEM_768_CIPHERTEXT_BYTES: usize = 1088;
pub const X25519_KEY_BYTES: usize = 32;

/// Serialized [`HybridPublicKey`] size.
pub const HYBRID_PUBLIC_KEY_BYTES: usize = ML_KEM_768_PUBLIC_KEY_BYTES + X25519_KEY_BYTES;
/// Serialized [`HybridCiphertext`] size.
pub const HYBRID_CIPHERTEXT_BYTES: usize = ML_KEM_768_CIPHERTEXT_BYTES + X25519_KEY_BYTES;

/// ChaCha20-Poly1305 nonce size.
pub const AEAD_NONCE_BYTES: usize = 12;

/// 32 bytes of agreed secret. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Crypto operations consumed by the directory and the circuit client.
///
/// Implementations must fail closed: `decrypt` never returns a plaintext
/// for a ciphertext that does not authenticate.
pub trait HybridCrypto: Send + Sync + 'static {
    type KeyPair: Send + Sync;
    type PublicKey: Clone + Send + Sync;
    type Ciphertext: Send + Sync;

    /// Length of the nonce returned by [`encrypt`](Self::encrypt).
    const NONCE_LEN: usize;

    fn generate_keypair(&self) -> Result<Self::KeyPair, VeilError>;
    fn public_key(&self, keypair: &Self::KeyPair) -> Self::PublicKey;

    fn serialize_public_key(&self, key: &Self::PublicKey) -> Vec<u8>;
    fn deserialize_public_key(&self, bytes: &[u8]) -> Result<Self::PublicKey, VeilError>;

    /// Encapsulate a fresh secret to `recipient`.
    fn encapsulate(
        &self,
        recipient: &Self::PublicKey,
    ) -> Result<(Self::Ciphertext, SharedSecret), VeilError>;
    fn decapsulate(
        &self,
        ciphertext: &Self::Ciphertext,
        keypair: &Self::KeyPair,
    ) -> Result<SharedSecret, VeilError>;

    fn serialize_ciphertext(&self, ciphertext: &Self::Ciphertext) -> Vec<u8>;
    fn deserialize_ciphertext(&self, bytes: &[u8]) -> Result<Self::Ciphertext, VeilError>;

    /// Seal `plaintext` under `key`, binding `aad`. Returns (ciphertext, nonce).
    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &[u8; 32],
        aad: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), VeilError>;
    fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key: &[u8; 32],
        aad: &[u8],
    ) -> Result<Vec<u8>, VeilError>;

    /// `len` bytes from the OS CSPRNG.
    fn random_bytes(&self, len: usize) -> Vec<u8>;
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

/// Expand `secret` into `out.len()` bytes of key material under `label`.
pub fn derive_key_material(
    secret: &SharedSecret,
    label: &[u8],
    out: &mut [u8],
) -> Result<(), VeilError> {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
    hkdf.expand(label, out)
        .map_err(|e| VeilError::Crypto(format!("key derivation failed: {e}")))
}

/// Per-connection session key. The raw secret is consumed and wiped.
pub fn derive_session_key(secret: SharedSecret) -> Result<Zeroizing<[u8; 32]>, VeilError> {
    let mut key = Zeroizing::new([0u8; 32]);
    derive_key_material(&secret, SESSION_KEY_LABEL, &mut key[..])?;
    drop(secret);
    Ok(key)
}

// ── Default implementation ────────────────────────────────────────────

/// ML-KEM-768 + X25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct HybridPublicKey {
    kem: Vec<u8>,
    x25519: [u8; X25519_KEY_BYTES],
}

impl HybridPublicKey {
    /// `kem ‖ x25519`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_PUBLIC_KEY_BYTES);
        out.extend_from_slice(&self.kem);
        out.extend_from_slice(&self.x25519);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VeilError> {
        if bytes.len() != HYBRID_PUBLIC_KEY_BYTES {
            return Err(VeilError::Crypto(format!(
                "invalid public key: expected {} bytes, got {}",
                HYBRID_PUBLIC_KEY_BYTES,
                bytes.len()
            )));
        }
        let (kem, x) = bytes.split_at(ML_KEM_768_PUBLIC_KEY_BYTES);
        let mut x25519 = [0u8; X25519_KEY_BYTES];
        x25519.copy_from_slice(x);
        Ok(Self {
            kem: kem.to_vec(),
            x25519,
        })
    }
}

impl std::fmt::Debug for HybridPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HybridPublicKey({:02x?}...)", &self.x25519[..8])
    }
}

/// Secret halves plus the matching public key.
pub struct HybridKeyPair {
    kem_secret: Zeroizing<Vec<u8>>,
    x25519_secret: X25519Secret,
    public: HybridPublicKey,
}

impl HybridKeyPair {
    pub fn public_key(&self) -> &HybridPublicKey {
        &self.public
    }
}

impl std::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridKeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// ML-KEM-768 ciphertext plus the sender's ephemeral X25519 key.
#[derive(Clone, PartialEq, Eq)]
pub struct HybridCiphertext {
    kem: Vec<u8>,
    ephemeral: [u8; X25519_KEY_BYTES],
}

impl HybridCiphertext {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_CIPHERTEXT_BYTES);
        out.extend_from_slice(&self.kem);
        out.extend_from_slice(&self.ephemeral);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VeilError> {
        if bytes.len() != HYBRID_CIPHERTEXT_BYTES {
            return Err(VeilError::Crypto(format!(
                "invalid ciphertext: expected {} bytes, got {}",
                HYBRID_CIPHERTEXT_BYTES,
                bytes.len()
            )));
        }
        let (kem, x) = bytes.split_at(ML_KEM_768_CIPHERTEXT_BYTES);
        let mut ephemeral = [0u8; X25519_KEY_BYTES];
        ephemeral.copy_from_slice(x);
        Ok(Self {
            kem: kem.to_vec(),
            ephemeral,
        })
    }
}

impl std::fmt::Debug for HybridCiphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HybridCiphertext({:02x?}...)", &self.ephemeral[..8])
    }
}

/// ML-KEM-768 + X25519, ChaCha20-Poly1305, SHA-256, OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridKem;

impl HybridKem {
    pub fn new() -> Self {
        Self
    }
}

/// Combine both KEM secrets. The ephemeral key is bound into the label.
fn combine_secrets(
    kem_secret: &[u8],
    dh_secret: &[u8; 32],
    ephemeral: &[u8; X25519_KEY_BYTES],
) -> Result<SharedSecret, VeilError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(kem_secret.len() + 32));
    ikm.extend_from_slice(kem_secret);
    ikm.extend_from_slice(dh_secret);

    let mut info = Vec::with_capacity(HYBRID_INFO.len() + X25519_KEY_BYTES);
    info.extend_from_slice(HYBRID_INFO);
    info.extend_from_slice(ephemeral);

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut out = [0u8; 32];
    hkdf.expand(&info, &mut out)
        .map_err(|e| VeilError::Crypto(format!("hybrid combine failed: {e}")))?;
    Ok(SharedSecret::from_bytes(out))
}

impl HybridCrypto for HybridKem {
    type KeyPair = HybridKeyPair;
    type PublicKey = HybridPublicKey;
    type Ciphertext = HybridCiphertext;

    const NONCE_LEN: usize = AEAD_NONCE_BYTES;

    fn generate_keypair(&self) -> Result<HybridKeyPair, VeilError> {
        let (dk, ek) = MlKem768::generate(&mut OsRng);
        let x25519_secret = X25519Secret::random_from_rng(OsRng);
        let x25519_public = X25519PublicKey::from(&x25519_secret);

        Ok(HybridKeyPair {
            kem_secret: Zeroizing::new(dk.as_bytes().to_vec()),
            x25519_secret,
            public: HybridPublicKey {
                kem: ek.as_bytes().to_vec(),
                x25519: x25519_public.to_bytes(),
            },
        })
    }

    fn public_key(&self, keypair: &HybridKeyPair) -> HybridPublicKey {
        keypair.public.clone()
    }

    fn serialize_public_key(&self, key: &HybridPublicKey) -> Vec<u8> {
        key.to_bytes()
    }

    fn deserialize_public_key(&self, bytes: &[u8]) -> Result<HybridPublicKey, VeilError> {
        HybridPublicKey::from_bytes(bytes)
    }

    fn encapsulate(
        &self,
        recipient: &HybridPublicKey,
    ) -> Result<(HybridCiphertext, SharedSecret), VeilError> {
        type EkEncoded = Encoded<<MlKem768 as KemCore>::EncapsulationKey>;

        let ek_encoded = EkEncoded::try_from(&recipient.kem[..])
            .map_err(|_| VeilError::Crypto("invalid encapsulation key size".into()))?;
        let ek = <MlKem768 as KemCore>::EncapsulationKey::from_bytes(&ek_encoded);
        let (kem_ct, kem_ss) = ek
            .encapsulate(&mut OsRng)
            .map_err(|_| VeilError::Crypto("ML-KEM encapsulation failed".into()))?;

        let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret).to_bytes();
        let dh = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(recipient.x25519));
        if !dh.was_contributory() {
            return Err(VeilError::Crypto("non-contributory X25519 exchange".into()));
        }

        let secret = combine_secrets(kem_ss.as_slice(), dh.as_bytes(), &ephemeral_public)?;
        let ciphertext = HybridCiphertext {
            kem: kem_ct.as_slice().to_vec(),
            ephemeral: ephemeral_public,
        };
        Ok((ciphertext, secret))
    }

    fn decapsulate(
        &self,
        ciphertext: &HybridCiphertext,
        keypair: &HybridKeyPair,
    ) -> Result<SharedSecret, VeilError> {
        type DkEncoded = Encoded<<MlKem768 as KemCore>::DecapsulationKey>;
        type CtEncoded = ml_kem::Ciphertext<MlKem768>;

        let dk_encoded = DkEncoded::try_from(&keypair.kem_secret[..])
            .map_err(|_| VeilError::Crypto("invalid decapsulation key size".into()))?;
        let dk = <MlKem768 as KemCore>::DecapsulationKey::from_bytes(&dk_encoded);
        let ct = CtEncoded::try_from(&ciphertext.kem[..])
            .map_err(|_| VeilError::Crypto("invalid ciphertext size".into()))?;
        let kem_ss = dk
            .decapsulate(&ct)
            .map_err(|_| VeilError::Crypto("ML-KEM decapsulation failed".into()))?;

        let dh = keypair
            .x25519_secret
            .diffie_hellman(&X25519PublicKey::from(ciphertext.ephemeral));
        if !dh.was_contributory() {
            return Err(VeilError::Crypto("non-contributory X25519 exchange".into()));
        }

        combine_secrets(kem_ss.as_slice(), dh.as_bytes(), &ciphertext.ephemeral)
    }

    fn serialize_ciphertext(&self, ciphertext: &HybridCiphertext) -> Vec<u8> {
        ciphertext.to_bytes()
    }

    fn deserialize_ciphertext(&self, bytes: &[u8]) -> Result<HybridCiphertext, VeilError> {
        HybridCiphertext::from_bytes(bytes)
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &[u8; 32],
        aad: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), VeilError> {
        let cipher = ChaCha20Poly1305::new(key.into());

        let mut nonce_bytes = [0u8; AEAD_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| VeilError::Crypto(format!("encryption failed: {e}")))?;
        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key: &[u8; 32],
        aad: &[u8],
    ) -> Result<Vec<u8>, VeilError> {
        if nonce.len() != AEAD_NONCE_BYTES {
            return Err(VeilError::Decryption);
        }
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| VeilError::Decryption)
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}
