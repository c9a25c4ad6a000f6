//! Storage abstraction for the relay
//!
//! Trait-based abstraction for persisting everything the relay holds:
//! identity keys, handshake records, the envelope log, per-sender replay
//! state and the security log. The trait is synchronous (no async), like the
//! replay store it extends.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::{ChaoticStorage, FaultScope};
pub use error::StorageError;
pub use memory::MemoryStorage;
use parley_core::{ConversationId, replay::ReplayStore};
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};

pub use self::redb::RedbStorage;
use crate::security::SecurityEvent;

/// Storage abstraction for relay state
///
/// Must be Clone (shared between the relay and the replay guard), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations share
/// internal state via Arc, so clones access the same underlying storage.
///
/// Replay state goes through the [`ReplayStore`] supertrait so the core
/// [`parley_core::replay::ReplayGuard`] can persist directly.
pub trait Storage: ReplayStore + Clone + Send + Sync + 'static {
    /// Store a user's public identity key (SEC1 bytes)
    ///
    /// Overwrites any existing key. Conflict policy belongs to the caller.
    fn store_identity(&self, user_id: &str, public_key: &[u8]) -> Result<(), StorageError>;

    /// Load a user's public identity key. `None` if never registered.
    fn load_identity(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a handshake record
    ///
    /// Replaces any previous record with the same `(from, to, kind)`.
    fn store_handshake(&self, record: &SignedHandshake) -> Result<(), StorageError>;

    /// Latest handshake record for `(from, to, kind)`, if any.
    fn load_handshake(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, StorageError>;

    /// Append an envelope to the log and index it under its conversation
    ///
    /// # Invariants
    ///
    /// - Post: returned id is greater than every previously returned id
    /// - Post: the envelope is listed by [`Self::load_conversation`] for its
    ///   conversation
    fn append_envelope(&self, envelope: &EncryptedEnvelope) -> Result<u64, StorageError>;

    /// Load a single envelope by id.
    fn load_envelope(&self, id: u64) -> Result<Option<EncryptedEnvelope>, StorageError>;

    /// Every envelope in a conversation, in append order.
    fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEnvelope>, StorageError>;

    /// Append a security event.
    fn append_security_event(&self, event: &SecurityEvent) -> Result<(), StorageError>;

    /// The most recent `limit` security events, oldest first.
    fn load_security_events(&self, limit: usize) -> Result<Vec<SecurityEvent>, StorageError>;
}
