use proptest::prelude::*;
use veil_protocol::onion::{derive_layer_keys, peel_onion, unwrap_layer, wrap_onion};
use veil_protocol::{HybridKem, LayerKeys, SharedSecret, VeilError};

fn hops(seeds: &[u8], circuit_id: &str) -> Vec<LayerKeys> {
    seeds
        .iter()
        .enumerate()
        .map(|(i, seed)| derive_layer_keys(&SharedSecret::from_bytes([*seed; 32]), circuit_id, i).unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Wrapping through N hops then peeling in hop order is the identity,
    /// and each layer adds exactly nonce + tag.
    #[test]
    fn n_layer_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        seeds in prop::collection::vec(any::<u8>(), 1..6),
    ) {
        let kem = HybridKem::new();
        let keys = hops(&seeds, "circuit");
        let onion = wrap_onion(&kem, &data, &keys).unwrap();
        prop_assert_eq!(onion.len(), data.len() + keys.len() * (12 + 16));
        prop_assert_eq!(peel_onion(&kem, &onion, &keys).unwrap(), data);
    }

    /// Flipping any bit of an onion makes the entry layer fail.
    #[test]
    fn tampering_fails_closed(
        data in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let kem = HybridKem::new();
        let keys = hops(&[1, 2, 3], "circuit");
        let mut onion = wrap_onion(&kem, &data, &keys).unwrap();
        let at = position.index(onion.len());
        onion[at] ^= 1 << bit;
        prop_assert!(matches!(unwrap_layer(&kem, &onion, &keys[0]), Err(VeilError::Decryption)));
    }

    /// Keys derived for another circuit never open the layer.
    #[test]
    fn layers_are_bound_to_their_circuit(
        data in prop::collection::vec(any::<u8>(), 0..256),
        seed in any::<u8>(),
    ) {
        let kem = HybridKem::new();
        let ours = hops(&[seed], "circuit-a");
        let theirs = hops(&[seed], "circuit-b");
        let onion = wrap_onion(&kem, &data, &ours).unwrap();
        prop_assert!(peel_onion(&kem, &onion, &theirs).is_err());
    }
}
