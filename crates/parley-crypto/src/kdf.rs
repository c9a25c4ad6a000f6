//! Session key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;

use crate::ecdh::SharedSecret;

/// Label bound into every session key
const SESSION_KEY_LABEL: &[u8] = b"chat-session";

/// Derive the 256-bit session key for a conversation.
///
/// The conversation id is the HKDF salt, so the same ECDH output can never
/// produce the same key for two different conversations.
pub fn derive_session_key(shared: &SharedSecret, conversation_id: &str) -> [u8; 32] {
    derive_from_ikm(shared.as_bytes(), conversation_id)
}

fn derive_from_ikm(ikm: &[u8], conversation_id: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(Some(conversation_id.as_bytes()), ikm);

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(SESSION_KEY_LABEL, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}
