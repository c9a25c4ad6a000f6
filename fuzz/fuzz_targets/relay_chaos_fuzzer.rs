//! Fuzz target for relay admission under storage failures
//!
//! Drives a relay over `ChaoticStorage` with an arbitrary mix of sends,
//! replays and pruning while writes fail at a fuzzed rate.
//!
//! # Invariants
//!
//! - The relay NEVER panics on storage errors
//! - Failures surface as transient errors, never as anything else
//! - An admitted envelope can never be admitted again
//! - The log never holds two envelopes from one sender with one nonce
//! - Each sender's stored sequence numbers strictly increase

#![no_main]

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_core::ConversationId;
use parley_proto::EncryptedEnvelope;
use parley_server::{
    ChaoticStorage, MemoryStorage, Relay, RelayConfig, RelayError, Storage, SystemEnv,
};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Send with an explicit nonce and sequence
    Send { from_a: bool, nonce: u8, sequence: u8 },
    /// Resend the most recently admitted envelope
    ReplayLast,
    /// Prune every remembered nonce
    PruneAll,
}

fn envelope(from_a: bool, nonce: u8, sequence: u8) -> EncryptedEnvelope {
    let (sender, receiver) = if from_a { ("a1", "b2") } else { ("b2", "a1") };
    EncryptedEnvelope {
        sender_id: sender.into(),
        receiver_id: receiver.into(),
        ciphertext: vec![0x5a; 24],
        iv: [0; 12],
        nonce: format!("{nonce:02x}"),
        sequence_number: u64::from(sequence),
        key_version: 1,
        timestamp: 0,
        filename: None,
    }
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let storage =
        ChaoticStorage::failing_writes(MemoryStorage::new(), failure_rate, scenario.chaos_seed);
    let relay = Relay::new(SystemEnv::new(), storage.clone(), RelayConfig::default());

    let mut last_admitted = None;
    let mut pruned = false;
    for operation in scenario.operations.iter().take(256) {
        match operation {
            ChaosOperation::Send { from_a, nonce, sequence } => {
                let candidate = envelope(*from_a, *nonce, *sequence);
                match relay.send_message(candidate.clone()) {
                    Ok(_) => last_admitted = Some(candidate),
                    Err(RelayError::Replay(_) | RelayError::Malformed { .. }) => {},
                    Err(err) => assert!(err.is_transient(), "unexpected error: {err}"),
                }
            },
            ChaosOperation::ReplayLast => {
                if let Some(last) = &last_admitted {
                    assert!(relay.send_message(last.clone()).is_err());
                }
            },
            ChaosOperation::PruneAll => {
                if relay.prune_nonces_older_than(Duration::ZERO).is_ok() {
                    pruned = true;
                }
            },
        }
    }

    let stored = storage.inner().load_conversation(&ConversationId::new("a1", "b2"));
    let stored = stored.expect("memory storage never fails");

    let mut nonces = HashSet::new();
    let mut last_sequence: HashMap<String, u64> = HashMap::new();
    for entry in stored {
        let envelope = entry.envelope;
        let previous = last_sequence.insert(envelope.sender_id.clone(), envelope.sequence_number);
        if let Some(previous) = previous {
            assert!(envelope.sequence_number > previous, "sequence regressed");
        }
        // Pruning forgets nonces, after which reuse is legitimate
        let fresh = nonces.insert((envelope.sender_id, envelope.nonce));
        assert!(fresh || pruned, "nonce stored twice");
    }
});
