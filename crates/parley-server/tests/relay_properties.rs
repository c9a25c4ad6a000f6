//! Property-based tests for relay admission
//!
//! 1. **Replay**: the log never holds two envelopes from one sender with the
//!    same nonce, and each sender's stored sequence numbers strictly increase
//! 2. **Accounting**: every refused envelope leaves exactly one security event
//! 3. **Durability**: `RedbStorage` and `MemoryStorage` admit the same
//!    envelopes

use std::collections::HashSet;

use parley_proto::EncryptedEnvelope;
use parley_server::{MemoryStorage, RedbStorage, Relay, RelayConfig, Storage, SystemEnv};
use proptest::prelude::*;

fn envelope(sender: &str, nonce: &str, sequence_number: u64) -> EncryptedEnvelope {
    EncryptedEnvelope {
        sender_id: sender.into(),
        receiver_id: if sender == "a1" { "b2".into() } else { "a1".into() },
        ciphertext: vec![0x42; 32],
        iv: [0; 12],
        nonce: nonce.into(),
        sequence_number,
        key_version: 1,
        timestamp: 0,
        filename: None,
    }
}

fn sends() -> impl Strategy<Value = Vec<(bool, String, u64)>> {
    prop::collection::vec((any::<bool>(), "[a-d]{1,2}", 1u64..24), 1..48)
}

fn replay_all<S: Storage>(relay: &Relay<SystemEnv, S>, sends: &[(bool, String, u64)]) -> Vec<bool> {
    sends
        .iter()
        .map(|(from_a, nonce, sequence)| {
            let sender = if *from_a { "a1" } else { "b2" };
            relay.send_message(envelope(sender, nonce, *sequence)).is_ok()
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_log_has_no_replays(sends in sends()) {
        let relay = Relay::new(SystemEnv::new(), MemoryStorage::new(), RelayConfig::default());
        let accepted = replay_all(&relay, &sends);

        let stored = relay.conversation("a1", "b2").unwrap();
        prop_assert_eq!(stored.len(), accepted.iter().filter(|ok| **ok).count());

        for sender in ["a1", "b2"] {
            let mine: Vec<_> = stored
                .iter()
                .filter(|s| s.envelope.sender_id == sender)
                .map(|s| &s.envelope)
                .collect();

            let nonces: HashSet<_> = mine.iter().map(|e| e.nonce.as_str()).collect();
            prop_assert_eq!(nonces.len(), mine.len());
            prop_assert!(mine.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
        }

        let refused = accepted.iter().filter(|ok| !**ok).count();
        prop_assert_eq!(relay.security_log(usize::MAX).unwrap().len(), refused);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_durable_storage_matches_memory(sends in sends()) {
        let dir = tempfile::tempdir().unwrap();
        let durable = Relay::new(
            SystemEnv::new(),
            RedbStorage::open(dir.path().join("relay.redb")).unwrap(),
            RelayConfig::default(),
        );
        let memory = Relay::new(SystemEnv::new(), MemoryStorage::new(), RelayConfig::default());

        prop_assert_eq!(replay_all(&durable, &sends), replay_all(&memory, &sends));
        prop_assert_eq!(
            durable.conversation("b2", "a1").unwrap(),
            memory.conversation("b2", "a1").unwrap()
        );
    }
}
