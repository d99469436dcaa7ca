//! Property tests for the envelope codec: any payload round-trips once, and
//! any single-bit change to a sealed envelope is rejected.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use alfa_session_guard::config::EnvelopeConfig;
use alfa_session_guard::crypto::KeyMaterial;
use alfa_session_guard::{
    Clock, EnvelopeCodec, GuardError, ManualClock, MemoryStorage, NonceRegistry, SealedEnvelope,
};

fn codec() -> EnvelopeCodec {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let nonces = Arc::new(NonceRegistry::new(Duration::from_secs(300), clock.clone()));
    let keys = KeyMaterial::generate(1, clock.now()).unwrap();
    EnvelopeCodec::new(
        keys,
        nonces,
        Arc::new(MemoryStorage::new()),
        clock,
        &EnvelopeConfig::default(),
    )
}

fn flip(bytes: &mut [u8], bit: usize) {
    let bit = bit % (bytes.len() * 8);
    bytes[bit / 8] ^= 1 << (bit % 8);
}

fn rejected(result: Result<Vec<u8>, GuardError>) -> bool {
    matches!(result, Err(GuardError::EnvelopeRejected { .. }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_round_trip_then_replay(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let codec = codec();
        let sealed = codec.seal(&payload).unwrap();

        let wire = sealed.to_wire_json().unwrap();
        let parsed = SealedEnvelope::from_wire_json(wire.as_bytes()).unwrap();
        prop_assert_eq!(&parsed, &sealed);

        prop_assert_eq!(codec.open(&parsed).unwrap(), payload);
        prop_assert!(rejected(codec.open(&parsed)));
    }

    #[test]
    fn test_ciphertext_bit_flip_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        bit in any::<usize>(),
    ) {
        let codec = codec();
        let mut sealed = codec.seal(&payload).unwrap();
        flip(&mut sealed.ciphertext, bit);
        prop_assert!(rejected(codec.open(&sealed)));
    }

    #[test]
    fn test_nonce_bit_flip_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        bit in any::<usize>(),
    ) {
        let codec = codec();
        let mut sealed = codec.seal(&payload).unwrap();
        flip(&mut sealed.nonce, bit);
        prop_assert!(rejected(codec.open(&sealed)));
    }

    #[test]
    fn test_signature_bit_flip_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        bit in any::<usize>(),
    ) {
        let codec = codec();
        let mut sealed = codec.seal(&payload).unwrap();
        flip(&mut sealed.signature, bit);
        prop_assert!(rejected(codec.open(&sealed)));
    }

    #[test]
    fn test_timestamp_change_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        delta in 1i64..100_000,
    ) {
        let codec = codec();
        let mut sealed = codec.seal(&payload).unwrap();
        sealed.timestamp += delta;
        prop_assert!(rejected(codec.open(&sealed)));
    }
}
