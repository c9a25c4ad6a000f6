//! Versioned session key registry.
//!
//! One current key per conversation plus a bounded history of earlier
//! versions, kept so envelopes sent just before a rotation still decrypt.
//! History is FIFO: once it holds `capacity` keys, installing a new one
//! evicts the oldest.
//!
//! State is written through to the [`KeyValueStore`] on every rotation, so a
//! restarted client resumes with the same keys.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    conversation::ConversationId,
    derivation::{INITIAL_KEY_VERSION, SessionKey},
    error::StoreError,
    store::{ConversationStore, KeyValueStore, Slot},
};

/// Default number of prior key versions retained per conversation
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Persisted key ring for one conversation
#[derive(Default, Serialize, Deserialize)]
struct KeyRing {
    current: Option<SessionKey>,
    /// Oldest first
    history: VecDeque<SessionKey>,
}

impl KeyRing {
    fn by_version(&self, version: u32) -> Option<&SessionKey> {
        // Hot path: the current key
        if let Some(current) = self.current.as_ref().filter(|key| key.version() == version) {
            return Some(current);
        }
        self.history.iter().rev().find(|key| key.version() == version)
    }
}

/// Current and historical session keys per conversation.
#[derive(Clone)]
pub struct SessionKeyRegistry<K> {
    store: K,
    capacity: usize,
    /// Serializes read-modify-write of key rings
    write_lock: Arc<Mutex<()>>,
}

impl<K: KeyValueStore> SessionKeyRegistry<K> {
    /// Registry retaining up to `capacity` prior versions per conversation.
    pub fn new(store: K, capacity: usize) -> Self {
        Self { store, capacity, write_lock: Arc::new(Mutex::new(())) }
    }

    /// Number of prior versions retained per conversation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current key for a conversation. `None` if no session exists.
    pub fn current(&self, conversation_id: &ConversationId) -> Result<Option<SessionKey>, StoreError> {
        Ok(self.load(conversation_id)?.current)
    }

    /// Key with a specific version, current or historical.
    ///
    /// Checks the current key first; history is only scanned on a miss.
    /// `None` if the version was never installed or has been evicted.
    pub fn by_version(
        &self,
        conversation_id: &ConversationId,
        version: u32,
    ) -> Result<Option<SessionKey>, StoreError> {
        Ok(self.load(conversation_id)?.by_version(version).cloned())
    }

    /// Install `new_key` as the current key and return its version.
    ///
    /// The outgoing current key moves to history, evicting the oldest entry
    /// when history is full. The first key of a conversation gets version
    /// [`INITIAL_KEY_VERSION`]; each rotation increments it by one. The
    /// version carried by `new_key` is ignored.
    pub fn rotate(
        &self,
        conversation_id: &ConversationId,
        new_key: &SessionKey,
    ) -> Result<u32, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut ring = self.load(conversation_id)?;
        let version = ring.current.as_ref().map_or(INITIAL_KEY_VERSION, |key| key.version() + 1);

        if let Some(outgoing) = ring.current.take() {
            ring.history.push_back(outgoing);
        }
        while ring.history.len() > self.capacity {
            if let Some(evicted) = ring.history.pop_front() {
                debug!(
                    conversation_id = %conversation_id,
                    key_version = evicted.version(),
                    "evicted session key from history"
                );
            }
        }
        ring.current = Some(new_key.with_version(version));

        self.scope(conversation_id).save(Slot::SessionKeys, &ring)?;

        info!(conversation_id = %conversation_id, key_version = version, "session key installed");
        Ok(version)
    }

    /// Number of historical (non-current) keys retained.
    pub fn history_len(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        Ok(self.load(conversation_id)?.history.len())
    }

    fn load(&self, conversation_id: &ConversationId) -> Result<KeyRing, StoreError> {
        Ok(self.scope(conversation_id).load(Slot::SessionKeys)?.unwrap_or_default())
    }

    fn scope(&self, conversation_id: &ConversationId) -> ConversationStore<K> {
        ConversationStore::new(self.store.clone(), conversation_id.clone())
    }
}
