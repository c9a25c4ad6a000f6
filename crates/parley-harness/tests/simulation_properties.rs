//! Property-based simulation over random operation sequences
//!
//! For any seed and any interleaving of sends, rotations and replay attempts:
//!
//! 1. The standard invariants hold at every quiescent point
//! 2. Both peers decrypt every message that was sent, in relay order
//! 3. Replays of stored envelopes are always refused

use parley_harness::{InvariantRegistry, SimWorld, WorldSnapshot, establish, rotate};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send { from_a: bool, text: String },
    Rotate,
    ReplayLast,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (any::<bool>(), "[a-z ]{0,24}").prop_map(|(from_a, text)| Op::Send { from_a, text }),
        1 => Just(Op::Rotate),
        2 => Just(Op::ReplayLast),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_sessions_survive_any_schedule(
        seed in any::<u64>(),
        ops in prop::collection::vec(op(), 1..24),
    ) {
        let runtime = paused_runtime();
        let outcome: Result<(), TestCaseError> = runtime.block_on(async {
            let world = SimWorld::new(seed);
            let a = world.join("a1").unwrap();
            let b = world.join("b2").unwrap();
            let invariants = InvariantRegistry::standard();

            establish(&a, &b).await.unwrap();

            let mut sent = Vec::new();
            let mut rotations = 0u32;
            for op in &ops {
                match op {
                    Op::Send { from_a, text } => {
                        let (sender, peer) = if *from_a { (&a, "b2") } else { (&b, "a1") };
                        sender.send_message(peer, text).await.unwrap();
                        sent.push(text.clone());
                    },
                    // Stay inside the default key history
                    Op::Rotate if rotations >= 8 => {},
                    Op::Rotate => {
                        let (ka, kb) = rotate(&a, &b).await.unwrap();
                        rotations += 1;
                        prop_assert_eq!(ka.version(), 1 + rotations);
                        prop_assert_eq!(ka, kb);
                    },
                    Op::ReplayLast => {
                        if let Some(last) = world.relay().conversation("a1", "b2").unwrap().pop() {
                            prop_assert!(world.relay().send_message(last.envelope).is_err());
                        }
                    },
                }
                invariants.assert_all(&WorldSnapshot::capture(&world, &[&a, &b]), "after op");
            }

            for reader in [&a, &b] {
                let peer = if reader.user_id() == "a1" { "b2" } else { "a1" };
                let conversation = reader.load_conversation(peer).await.unwrap();
                prop_assert_eq!(conversation.skipped, 0);
                let expected: Vec<_> = sent.iter().map(String::as_str).collect();
                prop_assert_eq!(conversation.texts(), expected);
            }
            Ok(())
        });
        outcome?;
    }
}
