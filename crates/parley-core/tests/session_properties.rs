//! Property-based tests for session bookkeeping
//!
//! 1. **Symmetry**: both participants compute the same conversation id
//! 2. **Roles**: exactly one participant is the initiator, on both sides
//! 3. **Replay**: accepted sequences strictly increase; nonces are single-use
//! 4. **History**: rotation keeps exactly the newest `capacity` prior keys

use parley_core::{
    ConversationId, Role,
    registry::SessionKeyRegistry,
    replay::{MemoryReplayStore, ReplayDecision, ReplayError, ReplayGuard, ReplayState},
    role,
    store::MemoryKeyValueStore,
    SessionKey,
};
use proptest::prelude::*;

fn user_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{1,12}"
}

proptest! {
    #[test]
    fn prop_conversation_id_is_symmetric(a in user_id(), b in user_id()) {
        prop_assert_eq!(ConversationId::new(&a, &b), ConversationId::new(&b, &a));
    }

    #[test]
    fn prop_exactly_one_initiator(a in user_id(), b in user_id()) {
        prop_assume!(a != b);

        let a_role = role(&a, &b);
        let b_role = role(&b, &a);

        prop_assert_ne!(a_role, b_role);
        prop_assert_eq!(a_role == Role::Initiator, a < b);
    }

    #[test]
    fn prop_accepted_sequences_strictly_increase(
        attempts in prop::collection::vec((0u64..64, "[a-f0-9]{4}"), 1..64),
    ) {
        let guard = ReplayGuard::new(MemoryReplayStore::new());
        let mut accepted: Vec<u64> = Vec::new();

        for (sequence, nonce) in &attempts {
            match guard.admit("a1", nonce, *sequence, 0) {
                Ok(()) => accepted.push(*sequence),
                Err(ReplayError::Rejected(_)) => {},
                Err(err) => prop_assert!(false, "store failure: {err}"),
            }
        }

        prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]), "accepted: {accepted:?}");
        let state = guard.state("a1").unwrap().unwrap_or_default();
        prop_assert_eq!(state.last_sequence(), accepted.last().copied().unwrap_or(0));
    }

    #[test]
    fn prop_nonce_is_single_use(nonce in "[a-f0-9]{8}", first in 1u64..100, bump in 1u64..100) {
        let mut state = ReplayState::default();
        prop_assert_eq!(state.check(&nonce, first), ReplayDecision::Accept);
        state.commit(&nonce, first, 0);

        // A higher sequence does not launder a reused nonce
        prop_assert!(!state.check(&nonce, first + bump).is_accept());
    }

    #[test]
    fn prop_history_keeps_newest_versions(capacity in 0usize..6, rotations in 1u32..16) {
        let registry = SessionKeyRegistry::new(MemoryKeyValueStore::new(), capacity);
        let cid = ConversationId::new("a1", "b2");

        for round in 0..rotations {
            let key = SessionKey::new(cid.clone(), 0, [round as u8; 32]);
            registry.rotate(&cid, &key).unwrap();
        }

        let newest = rotations;
        let oldest_kept = newest.saturating_sub(capacity as u32).max(1);
        for version in 1..=newest {
            let retained = registry.by_version(&cid, version).unwrap().is_some();
            prop_assert_eq!(retained, version >= oldest_kept, "version {}", version);
        }
    }
}
