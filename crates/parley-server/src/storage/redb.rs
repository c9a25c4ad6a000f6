//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All relay state survives restarts. Wire types are stored as their JSON
//! encoding; relay-internal state is CBOR.

use std::{path::Path, sync::Arc};

use parley_core::{
    ConversationId, StoreError,
    replay::{ReplayState, ReplayStore},
};
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{Storage, StorageError};
use crate::security::SecurityEvent;

/// Every table maps raw bytes to raw bytes
type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Table: identities
/// Key: user id bytes
/// Value: SEC1-encoded public identity key
const IDENTITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identities");

/// Table: handshakes
/// Key: len-prefixed from, len-prefixed to, kind byte
/// Value: JSON-encoded SignedHandshake
const HANDSHAKES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("handshakes");

/// Table: envelopes
/// Key: envelope id as big-endian bytes [8 bytes]
/// Value: JSON-encoded EncryptedEnvelope
const ENVELOPES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("envelopes");

/// Table: conversations
/// Key: len-prefixed conversation id, then envelope id (8 bytes BE)
/// Value: empty
const CONVERSATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("conversations");

/// Table: replay_state
/// Key: sender id bytes
/// Value: CBOR-encoded ReplayState
const REPLAY_STATE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("replay_state");

/// Table: security_log
/// Key: event sequence as big-endian bytes [8 bytes]
/// Value: CBOR-encoded SecurityEvent
const SECURITY_LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("security_log");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            for table in
                [IDENTITIES, HANDSHAKES, ENVELOPES, CONVERSATIONS, REPLAY_STATE, SECURITY_LOG]
            {
                let _ = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or overwrite one value in its own write transaction.
    fn put(&self, table: BytesTable, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            table.insert(key, value).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    /// Read one value in a read transaction.
    fn get(&self, table: BytesTable, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    /// Id following the last key of an id-keyed table. Ids start at 1.
    fn next_id<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
    ) -> Result<u64, StorageError> {
        let last = table.last().map_err(|e| StorageError::Io(e.to_string()))?;
        match last {
            Some((key, _)) => Ok(decode_id(key.value())? + 1),
            None => Ok(1),
        }
    }

    fn replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StorageError> {
        self.get(REPLAY_STATE, sender_id.as_bytes())?.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn senders(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(REPLAY_STATE).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut senders = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let sender = String::from_utf8(key.value().to_vec())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            senders.push(sender);
        }
        Ok(senders)
    }
}

impl Storage for RedbStorage {
    fn store_identity(&self, user_id: &str, public_key: &[u8]) -> Result<(), StorageError> {
        self.put(IDENTITIES, user_id.as_bytes(), public_key)
    }

    fn load_identity(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get(IDENTITIES, user_id.as_bytes())
    }

    fn store_handshake(&self, record: &SignedHandshake) -> Result<(), StorageError> {
        let bytes = record.to_json().map_err(|e| StorageError::Serialization(e.to_string()))?;
        let key = encode_handshake_key(record.from(), record.to(), record.kind());
        self.put(HANDSHAKES, &key, &bytes)
    }

    fn load_handshake(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, StorageError> {
        let key = encode_handshake_key(from, to, kind);
        self.get(HANDSHAKES, &key)?
            .map(|bytes| {
                SignedHandshake::from_json(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn append_envelope(&self, envelope: &EncryptedEnvelope) -> Result<u64, StorageError> {
        let bytes = envelope.to_json().map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conversation_id = ConversationId::new(&envelope.sender_id, &envelope.receiver_id);

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        let id = {
            let mut envelopes =
                txn.open_table(ENVELOPES).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut index =
                txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let id = Self::next_id(&envelopes)?;
            let previous = envelopes
                .insert(id.to_be_bytes().as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            if previous.is_some() {
                return Err(StorageError::Conflict { expected: id, got: id });
            }

            let index_key = encode_conversation_key(&conversation_id, id);
            index
                .insert(index_key.as_slice(), b"".as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            id
        };
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(id)
    }

    fn load_envelope(&self, id: u64) -> Result<Option<EncryptedEnvelope>, StorageError> {
        self.get(ENVELOPES, &id.to_be_bytes())?
            .map(|bytes| {
                EncryptedEnvelope::from_json(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEnvelope>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let index = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        let envelopes = txn.open_table(ENVELOPES).map_err(|e| StorageError::Io(e.to_string()))?;

        let start_key = encode_conversation_key(conversation_id, 0);
        let end_key = encode_conversation_key(conversation_id, u64::MAX);

        let results = index
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut listed = Vec::new();
        for result in results {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let key = key.value();
            let id = decode_id(&key[key.len().saturating_sub(8)..])?;

            let value = envelopes
                .get(id.to_be_bytes().as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            let Some(value) = value else {
                continue;
            };
            let envelope = EncryptedEnvelope::from_json(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            listed.push(StoredEnvelope { id, envelope });
        }

        Ok(listed)
    }

    fn append_security_event(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        let bytes = to_cbor(event)?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(SECURITY_LOG).map_err(|e| StorageError::Io(e.to_string()))?;
            let sequence = Self::next_id(&table)?;
            table
                .insert(sequence.to_be_bytes().as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_security_events(&self, limit: usize) -> Result<Vec<SecurityEvent>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SECURITY_LOG).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut events = Vec::with_capacity(limit.min(256));
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))?.rev().take(limit) {
            let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            events.push(from_cbor(value.value())?);
        }
        events.reverse();

        Ok(events)
    }
}

impl ReplayStore for RedbStorage {
    fn load_replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError> {
        Ok(self.replay_state(sender_id)?)
    }

    fn store_replay_state(&self, sender_id: &str, state: &ReplayState) -> Result<(), StoreError> {
        let bytes = to_cbor(state)?;
        Ok(self.put(REPLAY_STATE, sender_id.as_bytes(), &bytes)?)
    }

    fn replay_senders(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.senders()?)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Length-prefixed string, so no id can be a prefix of another key.
fn put_str(key: &mut Vec<u8>, value: &str) {
    key.extend_from_slice(&(value.len() as u32).to_be_bytes());
    key.extend_from_slice(value.as_bytes());
}

/// Encode `(from, to, kind)` as a handshake key.
fn encode_handshake_key(from: &str, to: &str, kind: HandshakeKind) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + from.len() + to.len() + 1);
    put_str(&mut key, from);
    put_str(&mut key, to);
    key.push(match kind {
        HandshakeKind::Init => 1,
        HandshakeKind::Confirm => 2,
    });
    key
}

/// Encode `(conversation_id, envelope_id)` as an index key.
fn encode_conversation_key(conversation_id: &ConversationId, id: u64) -> Vec<u8> {
    let cid = conversation_id.as_str();
    let mut key = Vec::with_capacity(4 + cid.len() + 8);
    put_str(&mut key, cid);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Decode an 8-byte big-endian id.
fn decode_id(bytes: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        StorageError::Serialization(format!("expected 8-byte id, got {} bytes", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use parley_core::replay::ReplayGuard;
    use parley_proto::{HandshakeBody, HandshakePayload};
    use tempfile::tempdir;

    use super::*;
    use crate::security::SecurityEventKind;

    fn envelope(sender: &str, receiver: &str, sequence_number: u64) -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            ciphertext: vec![0xCD; 48],
            iv: [7; 12],
            nonce: format!("{sender}-{sequence_number}"),
            sequence_number,
            key_version: 1,
            timestamp: 1_700_000_000_000,
            filename: None,
        }
    }

    fn init_record(from: &str, to: &str, nonce: &str) -> SignedHandshake {
        SignedHandshake {
            payload: HandshakePayload::Init(HandshakeBody {
                from: from.into(),
                to: to.into(),
                identity_public_key: vec![4; 65],
                ephemeral_public_key: vec![4; 65],
                timestamp: 1,
                nonce: nonce.into(),
                sequence: 1,
            }),
            signature: vec![9; 64],
        }
    }

    #[test]
    fn test_conversation_key_ordering() {
        let cid = ConversationId::new("a1", "b2");
        let low = encode_conversation_key(&cid, 1);
        let high = encode_conversation_key(&cid, 256);
        assert!(low < high);

        let id = decode_id(&high[high.len() - 8..]).unwrap();
        assert_eq!(id, 256);
    }

    #[test]
    fn test_handshake_keys_are_unambiguous() {
        // "a_" + "b" and "a" + "_b" must not collide
        assert_ne!(
            encode_handshake_key("a_", "b", HandshakeKind::Init),
            encode_handshake_key("a", "_b", HandshakeKind::Init)
        );
        assert_ne!(
            encode_handshake_key("a1", "b2", HandshakeKind::Init),
            encode_handshake_key("a1", "b2", HandshakeKind::Confirm)
        );
    }

    #[test]
    fn test_decode_id_rejects_short_key() {
        assert!(matches!(decode_id(&[1, 2, 3]), Err(StorageError::Serialization(_))));
    }

    #[test]
    fn test_envelopes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            assert_eq!(storage.append_envelope(&envelope("a1", "b2", 1)).unwrap(), 1);
            assert_eq!(storage.append_envelope(&envelope("b2", "a1", 1)).unwrap(), 2);
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.append_envelope(&envelope("a1", "c3", 2)).unwrap(), 3);

        let listed = storage.load_conversation(&ConversationId::new("a1", "b2")).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].envelope, envelope("a1", "b2", 1));
        assert_eq!(listed[1].id, 2);

        assert_eq!(storage.load_envelope(3).unwrap(), Some(envelope("a1", "c3", 2)));
        assert!(storage.load_envelope(4).unwrap().is_none());
    }

    #[test]
    fn test_conversations_with_shared_prefix_stay_apart() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.append_envelope(&envelope("a", "b", 1)).unwrap();
        storage.append_envelope(&envelope("a", "bb", 2)).unwrap();

        let listed = storage.load_conversation(&ConversationId::new("a", "b")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].envelope.receiver_id, "b");
    }

    #[test]
    fn test_handshake_latest_wins() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.store_handshake(&init_record("a1", "b2", "first")).unwrap();
        storage.store_handshake(&init_record("a1", "b2", "second")).unwrap();

        let latest = storage.load_handshake("a1", "b2", HandshakeKind::Init).unwrap().unwrap();
        assert_eq!(latest.payload.body().nonce, "second");
        assert!(storage.load_handshake("b2", "a1", HandshakeKind::Init).unwrap().is_none());
    }

    #[test]
    fn test_identity_round_trip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert!(storage.load_identity("a1").unwrap().is_none());
        storage.store_identity("a1", &[4, 1, 2, 3]).unwrap();
        assert_eq!(storage.load_identity("a1").unwrap(), Some(vec![4, 1, 2, 3]));
    }

    #[test]
    fn test_replay_guard_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let guard = ReplayGuard::new(RedbStorage::open(&path).unwrap());
            guard.admit("a1", "n1", 1, 100).unwrap();
            guard.admit("a1", "n2", 2, 200).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let state = storage.load_replay_state("a1").unwrap().unwrap();
        assert_eq!(state.last_sequence(), 2);
        assert!(state.has_nonce("n1"));
        assert_eq!(storage.replay_senders().unwrap(), vec!["a1".to_owned()]);

        let guard = ReplayGuard::new(storage);
        assert!(guard.admit("a1", "n1", 3, 300).is_err());
    }

    #[test]
    fn test_security_log_limit() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..4u64 {
            let event = SecurityEvent::new(
                SecurityEventKind::ReplayNonceReused,
                "a1",
                format!("event {i}"),
                i,
            )
            .with_detail("nonce", i);
            storage.append_security_event(&event).unwrap();
        }

        let events = storage.load_security_events(3).unwrap();
        let timestamps: Vec<_> = events.iter().map(|event| event.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(events[2].details.get("nonce").map(String::as_str), Some("3"));
    }
}
