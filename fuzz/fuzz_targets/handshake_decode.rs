//! Fuzz target for handshake record decoding
//!
//! Feeds arbitrary bytes to `SignedHandshake::from_json` and, when they
//! parse, to signature verification. Looks for:
//! - Panics on malformed base64 or SEC1 points
//! - Records that decode but do not re-encode to an equal record
//! - Verification accepting a record whose signature is not 64 bytes
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_core::codec;
use parley_proto::SignedHandshake;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = SignedHandshake::from_json(data) else {
        return;
    };

    let encoded = record.to_json().expect("decoded record re-encodes");
    let decoded = SignedHandshake::from_json(&encoded).expect("re-encoded record decodes");
    assert_eq!(decoded, record);

    if codec::verify_record(&record).is_ok() {
        assert_eq!(record.signature.len(), 64);
    }
});
