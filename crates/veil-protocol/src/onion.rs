//! Onion layers.
//!
//! Every hop of a circuit owns a [`LayerKeys`] pair derived from the
//! secret agreed with that hop. One layer is
//! `nonce ‖ AEAD(layer key, data, aad = MAC key)`. Outbound data is
//! wrapped destination-most first so the entry hop's layer ends up
//! outermost; inbound data is peeled entry first.
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{derive_key_material, HybridCrypto, SharedSecret};
use crate::VeilError;

/// Derivation label prefix; the full label is `prefix|<circuit id>|<hop>`.
pub const LAYER_KEY_LABEL: &str = "veil-onion-layer-v1";

/// Encryption key and MAC key for one hop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LayerKeys {
    pub encryption: [u8; 32],
    pub mac: [u8; 32],
}

impl std::fmt::Debug for LayerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LayerKeys([REDACTED])")
    }
}

/// 64 bytes of HKDF output: encryption key ‖ MAC key.
pub fn derive_layer_keys(
    secret: &SharedSecret,
    circuit_id: &str,
    hop_index: usize,
) -> Result<LayerKeys, VeilError> {
    let label = format!("{LAYER_KEY_LABEL}|{circuit_id}|{hop_index}");
    let mut material = zeroize::Zeroizing::new([0u8; 64]);
    derive_key_material(secret, label.as_bytes(), &mut material[..])?;

    let mut keys = LayerKeys {
        encryption: [0u8; 32],
        mac: [0u8; 32],
    };
    keys.encryption.copy_from_slice(&material[..32]);
    keys.mac.copy_from_slice(&material[32..]);
    Ok(keys)
}

/// Add one layer.
pub fn wrap_layer<C: HybridCrypto>(
    crypto: &C,
    data: &[u8],
    keys: &LayerKeys,
) -> Result<Vec<u8>, VeilError> {
    let (ciphertext, nonce) = crypto.encrypt(data, &keys.encryption, &keys.mac)?;
    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Remove one layer. Anything that does not authenticate is `Decryption`.
pub fn unwrap_layer<C: HybridCrypto>(
    crypto: &C,
    data: &[u8],
    keys: &LayerKeys,
) -> Result<Vec<u8>, VeilError> {
    if data.len() < C::NONCE_LEN {
        return Err(VeilError::Decryption);
    }
    let (nonce, ciphertext) = data.split_at(C::NONCE_LEN);
    crypto.decrypt(ciphertext, nonce, &keys.encryption, &keys.mac)
}

/// Wrap for a path whose hops are ordered entry first.
pub fn wrap_onion<'a, C, I>(crypto: &C, data: &[u8], hops: I) -> Result<Vec<u8>, VeilError>
where
    C: HybridCrypto,
    I: IntoIterator<Item = &'a LayerKeys>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut current = data.to_vec();
    for keys in hops.into_iter().rev() {
        current = wrap_layer(crypto, &current, keys)?;
    }
    Ok(current)
}

/// Peel every layer, entry first.
pub fn peel_onion<'a, C, I>(crypto: &C, data: &[u8], hops: I) -> Result<Vec<u8>, VeilError>
where
    C: HybridCrypto,
    I: IntoIterator<Item = &'a LayerKeys>,
{
    let mut current = data.to_vec();
    for keys in hops {
        current = unwrap_layer(crypto, &current, keys)?;
    }
    Ok(current)
}
