//! Local key-value storage for client key material.
//!
//! Components receive a [`KeyValueStore`] explicitly; nothing reads ambient
//! global state. Conversation-scoped state (ephemeral secret, session key
//! ring, last answered INIT) goes through [`ConversationStore`], which fixes
//! the namespace per [`Slot`] and the key to the conversation id.
//!
//! The trait is synchronous (no async) like the relay storage layer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Serialize, de::DeserializeOwned};
use zeroize::Zeroizing;

use crate::{conversation::ConversationId, error::StoreError};

/// Namespaced byte store.
///
/// Must be Clone (shared by the identity store, key registry and handshake
/// driver), Send + Sync, and synchronous. Implementations share internal
/// state via Arc, so clones see the same data.
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// Value under `(namespace, key)`. `None` if absent.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or overwrite `(namespace, key)`.
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `(namespace, key)`. Removing an absent key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests, simulation and ephemeral clients.
#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<(String, String), Zeroizing<Vec<u8>>>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.get(&(namespace.to_string(), key.to_string())).map(|value| value.to_vec()))
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.insert((namespace.to_string(), key.to_string()), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// Kinds of per-conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Unconsumed ephemeral private key of an in-flight handshake
    Ephemeral,
    /// Current session key and version history
    SessionKeys,
    /// Last INIT this side answered as responder
    ConsumedInit,
}

impl Slot {
    /// Store namespace for this slot.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::SessionKeys => "session-keys",
            Self::ConsumedInit => "consumed-init",
        }
    }
}

/// A [`KeyValueStore`] view scoped to one conversation.
///
/// Values are CBOR encoded. Encoded buffers are zeroized after use since
/// slots hold secret material.
#[derive(Clone)]
pub struct ConversationStore<K> {
    store: K,
    conversation_id: ConversationId,
}

impl<K: KeyValueStore> ConversationStore<K> {
    /// Scope `store` to `conversation_id`.
    pub fn new(store: K, conversation_id: ConversationId) -> Self {
        Self { store, conversation_id }
    }

    /// Conversation this view is scoped to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Decode the value in `slot`. `None` if absent.
    pub fn load<T: DeserializeOwned>(&self, slot: Slot) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.store.get(slot.namespace(), self.conversation_id.as_str())? else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        decode(slot.namespace(), &bytes).map(Some)
    }

    /// Encode and store `value` in `slot`, replacing any previous value.
    pub fn save<T: Serialize>(&self, slot: Slot, value: &T) -> Result<(), StoreError> {
        let bytes = encode(slot.namespace(), value)?;
        self.store.put(slot.namespace(), self.conversation_id.as_str(), &bytes)
    }

    /// Remove the value in `slot`.
    pub fn clear(&self, slot: Slot) -> Result<(), StoreError> {
        self.store.delete(slot.namespace(), self.conversation_id.as_str())
    }
}

/// CBOR-encode `value`. The buffer is zeroized on drop.
pub(crate) fn encode<T: Serialize>(
    what: &'static str,
    value: &T,
) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    let mut bytes = Zeroizing::new(Vec::new());
    ciborium::into_writer(value, &mut *bytes)
        .map_err(|e| StoreError::Corrupt { what, reason: e.to_string() })?;
    Ok(bytes)
}

/// CBOR-decode `bytes`.
pub(crate) fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Corrupt { what, reason: e.to_string() })
}
