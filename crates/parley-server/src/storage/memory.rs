use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use parley_core::{
    ConversationId, StoreError,
    replay::{ReplayState, ReplayStore},
};
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};

use super::{Storage, StorageError};
use crate::security::SecurityEvent;

/// In-memory storage implementation for testing and simulation
///
/// All state is wrapped in `Arc<Mutex<>>` to allow Clone and concurrent
/// access. A poisoned mutex is recovered rather than propagated, since every
/// write below leaves the maps consistent.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// User id -> SEC1 public identity key
    identities: HashMap<String, Vec<u8>>,

    /// Latest record per `(from, to, kind)`
    handshakes: HashMap<(String, String, HandshakeKind), SignedHandshake>,

    /// Envelope log keyed by id
    envelopes: BTreeMap<u64, EncryptedEnvelope>,

    /// Conversation -> envelope ids in append order
    conversations: HashMap<ConversationId, Vec<u64>>,

    /// Last assigned envelope id (ids start at 1)
    last_envelope_id: u64,

    /// Per-sender replay state
    replay: HashMap<String, ReplayState>,

    /// Security log, oldest first
    security_log: Vec<SecurityEvent>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored envelopes.
    pub fn envelope_count(&self) -> usize {
        self.lock().envelopes.len()
    }

    /// Number of stored handshake records.
    pub fn handshake_count(&self) -> usize {
        self.lock().handshakes.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn store_identity(&self, user_id: &str, public_key: &[u8]) -> Result<(), StorageError> {
        self.lock().identities.insert(user_id.to_owned(), public_key.to_vec());
        Ok(())
    }

    fn load_identity(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().identities.get(user_id).cloned())
    }

    fn store_handshake(&self, record: &SignedHandshake) -> Result<(), StorageError> {
        let key = (record.from().to_owned(), record.to().to_owned(), record.kind());
        self.lock().handshakes.insert(key, record.clone());
        Ok(())
    }

    fn load_handshake(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, StorageError> {
        Ok(self.lock().handshakes.get(&(from.to_owned(), to.to_owned(), kind)).cloned())
    }

    fn append_envelope(&self, envelope: &EncryptedEnvelope) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        inner.last_envelope_id += 1;
        let id = inner.last_envelope_id;

        let conversation_id = ConversationId::new(&envelope.sender_id, &envelope.receiver_id);
        inner.envelopes.insert(id, envelope.clone());
        inner.conversations.entry(conversation_id).or_default().push(id);

        Ok(id)
    }

    fn load_envelope(&self, id: u64) -> Result<Option<EncryptedEnvelope>, StorageError> {
        Ok(self.lock().envelopes.get(&id).cloned())
    }

    fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEnvelope>, StorageError> {
        let inner = self.lock();
        let Some(ids) = inner.conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                inner
                    .envelopes
                    .get(id)
                    .map(|envelope| StoredEnvelope { id: *id, envelope: envelope.clone() })
            })
            .collect())
    }

    fn append_security_event(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        self.lock().security_log.push(event.clone());
        Ok(())
    }

    fn load_security_events(&self, limit: usize) -> Result<Vec<SecurityEvent>, StorageError> {
        let inner = self.lock();
        let skip = inner.security_log.len().saturating_sub(limit);
        Ok(inner.security_log[skip..].to_vec())
    }
}

impl ReplayStore for MemoryStorage {
    fn load_replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError> {
        Ok(self.lock().replay.get(sender_id).cloned())
    }

    fn store_replay_state(&self, sender_id: &str, state: &ReplayState) -> Result<(), StoreError> {
        self.lock().replay.insert(sender_id.to_owned(), state.clone());
        Ok(())
    }

    fn replay_senders(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().replay.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityEventKind;

    fn envelope(sender: &str, receiver: &str, sequence_number: u64) -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            ciphertext: vec![0xAB; 32],
            iv: [1; 12],
            nonce: format!("n{sequence_number}"),
            sequence_number,
            key_version: 1,
            timestamp: 1_000,
            filename: None,
        }
    }

    #[test]
    fn conversation_index_covers_both_directions() {
        let storage = MemoryStorage::new();
        let first = storage.append_envelope(&envelope("a1", "b2", 1)).unwrap();
        storage.append_envelope(&envelope("a1", "c3", 2)).unwrap();
        let third = storage.append_envelope(&envelope("b2", "a1", 1)).unwrap();

        let listed = storage.load_conversation(&ConversationId::new("b2", "a1")).unwrap();
        let ids: Vec<_> = listed.iter().map(|stored| stored.id).collect();
        assert_eq!(ids, vec![first, third]);
        assert_eq!(storage.envelope_count(), 3);
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.append_envelope(&envelope("a1", "b2", 1)).unwrap(), 1);
        assert_eq!(storage.append_envelope(&envelope("a1", "b2", 2)).unwrap(), 2);
        assert!(storage.load_envelope(3).unwrap().is_none());
    }

    #[test]
    fn security_log_returns_most_recent() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            let event =
                SecurityEvent::new(SecurityEventKind::MalformedEnvelope, "a1", format!("e{i}"), i);
            storage.append_security_event(&event).unwrap();
        }

        let recent: Vec<_> = storage
            .load_security_events(2)
            .unwrap()
            .into_iter()
            .map(|event| event.message)
            .collect();
        assert_eq!(recent, vec!["e3", "e4"]);
        assert_eq!(storage.load_security_events(100).unwrap().len(), 5);
    }

    #[test]
    fn replay_state_round_trips() {
        let storage = MemoryStorage::new();
        let mut state = ReplayState::default();
        state.commit("n1", 4, 10);

        storage.store_replay_state("a1", &state).unwrap();
        assert_eq!(storage.load_replay_state("a1").unwrap(), Some(state));
        assert_eq!(storage.replay_senders().unwrap(), vec!["a1".to_owned()]);
    }
}
