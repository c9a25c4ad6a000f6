//! Property-based tests for the session primitives
//!
//! 1. **Agreement**: both sides of an ECDH exchange derive the same key
//! 2. **Round-trip**: open(seal(m)) == m for all messages
//! 3. **Integrity**: any single-bit change to ciphertext, IV or AAD is rejected
//! 4. **Authenticity**: signatures verify only for the signed message

use parley_crypto::{
    CryptoError, EphemeralKeyPair, IV_SIZE, IdentityKeyPair, TAG_SIZE, derive_session_key, open,
    seal,
};
use proptest::prelude::*;

fn ephemeral() -> impl Strategy<Value = EphemeralKeyPair> {
    any::<[u8; 32]>().prop_filter_map("valid scalar", |b| EphemeralKeyPair::from_random_bytes(b).ok())
}

fn identity() -> impl Strategy<Value = IdentityKeyPair> {
    any::<[u8; 32]>().prop_filter_map("valid scalar", |b| IdentityKeyPair::from_random_bytes(b).ok())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_both_sides_derive_same_session_key(
        alice in ephemeral(),
        bob in ephemeral(),
        conversation_id in "[a-z0-9]{1,8}_[a-z0-9]{1,8}",
    ) {
        let alice_key = derive_session_key(&alice.diffie_hellman(&bob.public_key()), &conversation_id);
        let bob_key = derive_session_key(&bob.diffie_hellman(&alice.public_key()), &conversation_id);

        prop_assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn prop_signature_binds_message(
        signer in identity(),
        message in prop::collection::vec(any::<u8>(), 0..256),
        flip in any::<prop::sample::Index>(),
    ) {
        let signature = signer.sign(&message);
        prop_assert!(signer.public_key().verify(&message, &signature));

        if !message.is_empty() {
            let mut altered = message.clone();
            altered[flip.index(message.len())] ^= 0x01;
            prop_assert!(!signer.public_key().verify(&altered, &signature));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_seal_open_roundtrip(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; IV_SIZE]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..1000),
        aad in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let ciphertext = seal(&key, &iv, &plaintext, &aad);
        let opened = open(&key, &iv, &ciphertext, &aad).unwrap();

        prop_assert_eq!(opened, plaintext);
    }

    #[test]
    fn prop_ciphertext_bit_flip_rejected(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; IV_SIZE]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut ciphertext = seal(&key, &iv, &plaintext, b"");
        let index = position.index(ciphertext.len());
        ciphertext[index] ^= 1 << bit;

        prop_assert_eq!(open(&key, &iv, &ciphertext, b""), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn prop_aad_mismatch_rejected(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; IV_SIZE]>(),
        aad in prop::collection::vec(any::<u8>(), 1..64),
        position in any::<prop::sample::Index>(),
    ) {
        let ciphertext = seal(&key, &iv, b"payload", &aad);
        let mut other = aad.clone();
        other[position.index(aad.len())] ^= 0x80;

        prop_assert_eq!(open(&key, &iv, &ciphertext, &other), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn prop_iv_bit_flip_rejected(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; IV_SIZE]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        position in 0..IV_SIZE,
        bit in 0u8..8,
    ) {
        let ciphertext = seal(&key, &iv, &plaintext, b"header");
        let mut flipped = iv;
        flipped[position] ^= 1 << bit;

        prop_assert_eq!(
            open(&key, &flipped, &ciphertext, b"header"),
            Err(CryptoError::AuthenticationFailed)
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn prop_file_sized_buffers_roundtrip(
        key in any::<[u8; 32]>(),
        iv in any::<[u8; IV_SIZE]>(),
        fill in any::<u8>(),
        len in (4usize << 20)..(6usize << 20),
        flip in any::<prop::sample::Index>(),
    ) {
        let plaintext: Vec<u8> = (0..len).map(|i| fill.wrapping_add(i as u8)).collect();
        let ciphertext = seal(&key, &iv, &plaintext, b"report.pdf");
        prop_assert_eq!(ciphertext.len(), len + TAG_SIZE);
        prop_assert_eq!(open(&key, &iv, &ciphertext, b"report.pdf").unwrap(), plaintext);

        // Integrity holds deep inside large buffers too
        let mut tampered = ciphertext;
        let index = flip.index(tampered.len());
        tampered[index] ^= 0x01;
        prop_assert_eq!(
            open(&key, &iv, &tampered, b"report.pdf"),
            Err(CryptoError::AuthenticationFailed)
        );
    }
}
