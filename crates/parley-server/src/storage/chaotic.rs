//! Chaotic storage wrapper for fault injection testing
//!
//! Delegates to an underlying storage implementation but fails operations
//! at a configured rate, so tests can check that a failed write never leaves
//! the relay half-committed.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use parley_core::{
    ConversationId, StoreError,
    replay::{ReplayState, ReplayStore},
};
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::{Storage, StorageError};
use crate::security::SecurityEvent;

/// Which operations may fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    /// Reads and writes
    All,
    /// Only operations that mutate state
    Writes,
}

/// Storage wrapper that injects failures at a fixed rate
///
/// Uses a seeded ChaCha20 stream so a failing run replays exactly. Clones
/// share the stream and the operation counter.
#[derive(Clone)]
pub struct ChaoticStorage<S> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    scope: FaultScope,
    rng: Arc<Mutex<ChaCha20Rng>>,
    operations: Arc<AtomicUsize>,
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner`, failing any operation with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self::with_scope(inner, failure_rate, seed, FaultScope::All)
    }

    /// Wrap `inner`, failing only writes.
    pub fn failing_writes(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self::with_scope(inner, failure_rate, seed, FaultScope::Writes)
    }

    fn with_scope(inner: S, failure_rate: f64, seed: u64, scope: FaultScope) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            scope,
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            operations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    fn roll(&self, write: bool, operation: &'static str) -> Result<(), StorageError> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if !write && self.scope == FaultScope::Writes {
            return Ok(());
        }

        let fail =
            self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen_bool(self.failure_rate);

        if fail {
            return Err(StorageError::Io(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn store_identity(&self, user_id: &str, public_key: &[u8]) -> Result<(), StorageError> {
        self.roll(true, "store_identity")?;
        self.inner.store_identity(user_id, public_key)
    }

    fn load_identity(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.roll(false, "load_identity")?;
        self.inner.load_identity(user_id)
    }

    fn store_handshake(&self, record: &SignedHandshake) -> Result<(), StorageError> {
        self.roll(true, "store_handshake")?;
        self.inner.store_handshake(record)
    }

    fn load_handshake(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, StorageError> {
        self.roll(false, "load_handshake")?;
        self.inner.load_handshake(from, to, kind)
    }

    fn append_envelope(&self, envelope: &EncryptedEnvelope) -> Result<u64, StorageError> {
        self.roll(true, "append_envelope")?;
        self.inner.append_envelope(envelope)
    }

    fn load_envelope(&self, id: u64) -> Result<Option<EncryptedEnvelope>, StorageError> {
        self.roll(false, "load_envelope")?;
        self.inner.load_envelope(id)
    }

    fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEnvelope>, StorageError> {
        self.roll(false, "load_conversation")?;
        self.inner.load_conversation(conversation_id)
    }

    fn append_security_event(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        self.roll(true, "append_security_event")?;
        self.inner.append_security_event(event)
    }

    fn load_security_events(&self, limit: usize) -> Result<Vec<SecurityEvent>, StorageError> {
        self.roll(false, "load_security_events")?;
        self.inner.load_security_events(limit)
    }
}

impl<S: Storage> ReplayStore for ChaoticStorage<S> {
    fn load_replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError> {
        self.roll(false, "load_replay_state")?;
        self.inner.load_replay_state(sender_id)
    }

    fn store_replay_state(&self, sender_id: &str, state: &ReplayState) -> Result<(), StoreError> {
        self.roll(true, "store_replay_state")?;
        self.inner.store_replay_state(sender_id, state)
    }

    fn replay_senders(&self) -> Result<Vec<String>, StoreError> {
        self.roll(false, "replay_senders")?;
        self.inner.replay_senders()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn zero_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0, 7);
        for _ in 0..100 {
            storage.store_identity("a1", &[4]).unwrap();
        }
        assert_eq!(storage.operation_count(), 100);
    }

    #[test]
    fn full_rate_always_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0, 7);
        assert!(matches!(storage.load_identity("a1"), Err(StorageError::Io(_))));
        assert!(storage.replay_senders().is_err());
    }

    #[test]
    fn write_scope_lets_reads_through() {
        let storage = ChaoticStorage::failing_writes(MemoryStorage::new(), 1.0, 7);
        assert!(storage.load_identity("a1").unwrap().is_none());
        assert!(storage.store_identity("a1", &[4]).is_err());
        assert!(storage.inner().load_identity("a1").unwrap().is_none());
    }

    #[test]
    fn same_seed_same_failures() {
        let pattern = |seed| {
            let storage = ChaoticStorage::new(MemoryStorage::new(), 0.5, seed);
            (0..64).map(|_| storage.load_identity("a1").is_err()).collect::<Vec<_>>()
        };
        assert_eq!(pattern(42), pattern(42));
        assert!(pattern(42).iter().any(|failed| *failed));
        assert!(pattern(42).iter().any(|failed| !*failed));
    }
}
