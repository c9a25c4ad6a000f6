//! Canonical encoding and signing of handshake payloads.
//!
//! Signatures cover a fixed binary layout, not the JSON text, so field order
//! and whitespace on the wire never affect verification. Any change to a
//! signed field changes the canonical bytes.
//!
//! # Layout
//!
//! ```text
//! "parley-handshake-v1"
//! kind       : len-prefixed "INIT" | "CONFIRM"
//! from, to   : len-prefixed UTF-8
//! identity   : len-prefixed SEC1
//! ephemeral  : len-prefixed SEC1
//! peer eph.  : len-prefixed SEC1 (CONFIRM only)
//! timestamp  : u64 BE
//! nonce      : len-prefixed UTF-8
//! sequence   : u64 BE
//! ```
//!
//! Lengths are u32 big-endian.

use parley_crypto::{IdentityPublicKey, IdentitySignature};
use parley_proto::{HandshakePayload, SignedHandshake};
use tracing::warn;

use crate::{
    error::{HandshakeError, IdentityError},
    identity::IdentityKeyStore,
    store::KeyValueStore,
};

/// Domain separation label, bumped with any layout change
const HANDSHAKE_LABEL: &[u8] = b"parley-handshake-v1";

/// Canonical bytes signed for `payload`.
pub fn canonical_bytes(payload: &HandshakePayload) -> Vec<u8> {
    let body = payload.body();
    let mut out = Vec::with_capacity(
        HANDSHAKE_LABEL.len()
            + 64
            + body.from.len()
            + body.to.len()
            + body.identity_public_key.len()
            + body.ephemeral_public_key.len()
            + payload.peer_ephemeral_public_key().map_or(0, <[u8]>::len)
            + body.nonce.len(),
    );

    out.extend_from_slice(HANDSHAKE_LABEL);
    put_bytes(&mut out, payload.kind().as_str().as_bytes());
    put_bytes(&mut out, body.from.as_bytes());
    put_bytes(&mut out, body.to.as_bytes());
    put_bytes(&mut out, &body.identity_public_key);
    put_bytes(&mut out, &body.ephemeral_public_key);
    if let Some(peer) = payload.peer_ephemeral_public_key() {
        put_bytes(&mut out, peer);
    }
    out.extend_from_slice(&body.timestamp.to_be_bytes());
    put_bytes(&mut out, body.nonce.as_bytes());
    out.extend_from_slice(&body.sequence.to_be_bytes());

    out
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Sign `payload` as `user_id` using the identity store.
pub fn sign<K: KeyValueStore>(
    identities: &IdentityKeyStore<K>,
    user_id: &str,
    payload: HandshakePayload,
) -> Result<SignedHandshake, IdentityError> {
    let signature = identities.sign(user_id, &canonical_bytes(&payload))?;
    Ok(SignedHandshake { payload, signature: signature.as_bytes().to_vec() })
}

/// Verify `signature` over `payload` under `public_key`.
///
/// Returns `false` for malformed signatures as well as mismatches.
pub fn verify(public_key: &IdentityPublicKey, payload: &HandshakePayload, signature: &[u8]) -> bool {
    let Ok(signature) = IdentitySignature::from_slice(signature) else {
        return false;
    };
    public_key.verify(&canonical_bytes(payload), &signature)
}

/// Verify a record against the identity key it carries.
///
/// Returns the embedded identity key on success so the caller can compare
/// it with a pinned key.
///
/// # Errors
///
/// - `MalformedKey` if the embedded identity key is not a P-256 point
/// - `InvalidSignature` if the signature does not verify
///
/// Both are security violations: the caller aborts, never retries.
pub fn verify_record(record: &SignedHandshake) -> Result<IdentityPublicKey, HandshakeError> {
    let body = record.payload.body();

    let identity = IdentityPublicKey::from_sec1_bytes(&body.identity_public_key).map_err(|_| {
        warn!(
            target: "parley::security",
            peer = %body.from,
            kind = %record.kind(),
            "handshake record carries malformed identity key"
        );
        HandshakeError::MalformedKey { peer: body.from.clone(), field: "identityPublicKey" }
    })?;

    if !verify(&identity, &record.payload, &record.signature) {
        warn!(
            target: "parley::security",
            peer = %body.from,
            to = %body.to,
            kind = %record.kind(),
            timestamp = body.timestamp,
            "handshake signature verification failed"
        );
        return Err(HandshakeError::InvalidSignature { peer: body.from.clone(), kind: record.kind() });
    }

    Ok(identity)
}
