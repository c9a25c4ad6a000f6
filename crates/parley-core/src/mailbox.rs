//! Relay-facing seams: the handshake mailbox and the message transport.
//!
//! Both are async traits so a client can talk to an in-process relay in
//! tests and simulation, or to a remote one in production. The protocol
//! core only ever sees these traits.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};

use crate::{
    conversation::ConversationId,
    error::{MailboxError, TransportError},
};

/// Stores signed handshake records, latest per `(from, to, kind)`.
///
/// A newer record for the same key replaces the older one. The mailbox is
/// untrusted: it may drop, reorder or tamper with records, and the handshake
/// verifies every record it fetches.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Publish a record, replacing any previous one with the same key.
    async fn put(&self, record: SignedHandshake) -> Result<(), MailboxError>;

    /// Latest record from `from` to `to` of type `kind`, if any.
    async fn get_latest(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, MailboxError>;
}

/// Append-only store of encrypted envelopes.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Append an envelope and return its transport id.
    async fn append(&self, envelope: EncryptedEnvelope) -> Result<u64, TransportError>;

    /// Every envelope between `a` and `b` in either direction, oldest first.
    async fn list_conversation(&self, a: &str, b: &str) -> Result<Vec<StoredEnvelope>, TransportError>;

    /// A single envelope by id.
    async fn fetch(&self, id: u64) -> Result<Option<StoredEnvelope>, TransportError>;
}

#[async_trait]
impl<T: Mailbox + ?Sized> Mailbox for Arc<T> {
    async fn put(&self, record: SignedHandshake) -> Result<(), MailboxError> {
        (**self).put(record).await
    }

    async fn get_latest(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, MailboxError> {
        (**self).get_latest(from, to, kind).await
    }
}

#[async_trait]
impl<T: MessageTransport + ?Sized> MessageTransport for Arc<T> {
    async fn append(&self, envelope: EncryptedEnvelope) -> Result<u64, TransportError> {
        (**self).append(envelope).await
    }

    async fn list_conversation(&self, a: &str, b: &str) -> Result<Vec<StoredEnvelope>, TransportError> {
        (**self).list_conversation(a, b).await
    }

    async fn fetch(&self, id: u64) -> Result<Option<StoredEnvelope>, TransportError> {
        (**self).fetch(id).await
    }
}

type MailboxKey = (String, String, HandshakeKind);

#[derive(Default)]
struct MemoryState {
    records: HashMap<MailboxKey, SignedHandshake>,
    envelopes: BTreeMap<u64, EncryptedEnvelope>,
    next_id: u64,
}

/// In-memory mailbox and transport.
///
/// Performs no validation and no replay checking, which makes it useful for
/// exercising the client against a hostile or sloppy relay.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryMailbox {
    /// Empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored handshake records.
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Replace a stored record in place without re-signing it.
    ///
    /// Returns false if no record exists for the key.
    pub fn tamper(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
        edit: impl FnOnce(&mut SignedHandshake),
    ) -> bool {
        let mut state = self.lock();
        match state.records.get_mut(&(from.to_owned(), to.to_owned(), kind)) {
            Some(record) => {
                edit(record);
                true
            },
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn put(&self, record: SignedHandshake) -> Result<(), MailboxError> {
        let key = (record.from().to_owned(), record.to().to_owned(), record.kind());
        self.lock().records.insert(key, record);
        Ok(())
    }

    async fn get_latest(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, MailboxError> {
        Ok(self.lock().records.get(&(from.to_owned(), to.to_owned(), kind)).cloned())
    }
}

#[async_trait]
impl MessageTransport for MemoryMailbox {
    async fn append(&self, envelope: EncryptedEnvelope) -> Result<u64, TransportError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.envelopes.insert(id, envelope);
        Ok(id)
    }

    async fn list_conversation(&self, a: &str, b: &str) -> Result<Vec<StoredEnvelope>, TransportError> {
        let wanted = ConversationId::new(a, b);
        Ok(self
            .lock()
            .envelopes
            .iter()
            .filter(|(_, envelope)| {
                ConversationId::new(&envelope.sender_id, &envelope.receiver_id) == wanted
            })
            .map(|(id, envelope)| StoredEnvelope { id: *id, envelope: envelope.clone() })
            .collect())
    }

    async fn fetch(&self, id: u64) -> Result<Option<StoredEnvelope>, TransportError> {
        Ok(self
            .lock()
            .envelopes
            .get(&id)
            .map(|envelope| StoredEnvelope { id, envelope: envelope.clone() }))
    }
}

#[cfg(test)]
mod tests {
    use parley_proto::{HandshakeBody, HandshakePayload};

    use super::*;

    fn record(from: &str, to: &str, nonce: &str) -> SignedHandshake {
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
            signature: vec![0; 64],
        }
    }

    fn envelope(sender: &str, receiver: &str) -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            ciphertext: vec![0; 16],
            iv: [0; 12],
            nonce: "n".into(),
            sequence_number: 1,
            key_version: 1,
            timestamp: 1,
            filename: None,
        }
    }

    #[tokio::test]
    async fn latest_record_replaces_older() {
        let mailbox = MemoryMailbox::new();
        mailbox.put(record("a1", "b2", "first")).await.unwrap();
        mailbox.put(record("a1", "b2", "second")).await.unwrap();

        let latest = mailbox.get_latest("a1", "b2", HandshakeKind::Init).await.unwrap().unwrap();
        assert_eq!(latest.payload.body().nonce, "second");
        assert_eq!(mailbox.record_count(), 1);
    }

    #[tokio::test]
    async fn lookup_is_directional() {
        let mailbox = MemoryMailbox::new();
        mailbox.put(record("a1", "b2", "n")).await.unwrap();

        assert!(mailbox.get_latest("b2", "a1", HandshakeKind::Init).await.unwrap().is_none());
        assert!(mailbox.get_latest("a1", "b2", HandshakeKind::Confirm).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_listing_covers_both_directions() {
        let transport = MemoryMailbox::new();
        let first = transport.append(envelope("a1", "b2")).await.unwrap();
        transport.append(envelope("a1", "c3")).await.unwrap();
        let third = transport.append(envelope("b2", "a1")).await.unwrap();

        let ids: Vec<_> = transport
            .list_conversation("b2", "a1")
            .await
            .unwrap()
            .into_iter()
            .map(|stored| stored.id)
            .collect();
        assert_eq!(ids, vec![first, third]);
        assert_eq!(transport.fetch(first).await.unwrap().unwrap().envelope.sender_id, "a1");
        assert!(transport.fetch(99).await.unwrap().is_none());
    }
}
