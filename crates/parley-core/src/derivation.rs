//! Session keys and their derivation from an ephemeral ECDH exchange.

use parley_crypto::{EphemeralKeyPair, EphemeralPublicKey, derive_session_key};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::conversation::ConversationId;

/// Version assigned to the first key of a conversation
pub const INITIAL_KEY_VERSION: u32 = 1;

/// A versioned 256-bit AEAD key for one conversation.
///
/// Immutable once created. Rotation produces a new `SessionKey` with a
/// higher version; it never changes an existing one. Key material is
/// zeroized on drop and redacted from `Debug`.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionKey {
    conversation_id: ConversationId,
    version: u32,
    material: [u8; 32],
}

impl SessionKey {
    /// Assemble a key from its parts.
    pub fn new(conversation_id: ConversationId, version: u32, material: [u8; 32]) -> Self {
        Self { conversation_id, version, material }
    }

    /// Conversation this key belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Version number (>= 1).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Raw AES-256-GCM key.
    pub fn material(&self) -> &[u8; 32] {
        &self.material
    }

    /// Same key material under a different version number.
    pub fn with_version(&self, version: u32) -> Self {
        Self { conversation_id: self.conversation_id.clone(), version, material: self.material }
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id
            && self.version == other.version
            && self.material == other.material
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

/// Derive the session key from our ephemeral secret and the peer's
/// ephemeral public key.
///
/// Pure: the same inputs always give the same key, and both peers get the
/// same key because ECDH is symmetric. The result carries
/// [`INITIAL_KEY_VERSION`]; the registry assigns the real version when the
/// key is installed.
pub fn derive(
    my_ephemeral: &EphemeralKeyPair,
    peer_ephemeral: &EphemeralPublicKey,
    conversation_id: &ConversationId,
) -> SessionKey {
    let shared = my_ephemeral.diffie_hellman(peer_ephemeral);
    let material = derive_session_key(&shared, conversation_id.as_str());
    SessionKey::new(conversation_id.clone(), INITIAL_KEY_VERSION, material)
}
