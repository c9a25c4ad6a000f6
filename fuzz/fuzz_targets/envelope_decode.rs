//! Fuzz target for envelope decoding and relay admission
//!
//! Arbitrary bytes are decoded as an `EncryptedEnvelope`; anything that
//! decodes is offered to a fresh relay twice. Invariants:
//! - Decoding and admission never panic
//! - A second submission of an admitted envelope is always refused
//! - An admitted envelope is stored unchanged

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::EncryptedEnvelope;
use parley_server::{MemoryStorage, Relay, RelayConfig, Storage, SystemEnv};

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = EncryptedEnvelope::from_json(data) else {
        return;
    };
    let _ = envelope.associated_data();

    let relay = Relay::new(SystemEnv::new(), MemoryStorage::new(), RelayConfig::default());
    let admitted = if envelope.is_file() {
        relay.upload_file(envelope.clone())
    } else {
        relay.send_message(envelope.clone())
    };

    if let Ok(id) = admitted {
        let stored = relay.storage().load_envelope(id).expect("memory storage").expect("stored");
        assert_eq!(stored, envelope);
        assert!(relay.send_message(envelope.clone()).is_err());
        assert!(relay.upload_file(envelope).is_err());
    }
});
