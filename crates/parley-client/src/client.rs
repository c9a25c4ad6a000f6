//! Per-user client.
//!
//! The `Client` owns one user's identity and session keys on this device and
//! talks to the relay through the [`Mailbox`] and [`MessageTransport`]
//! seams. All persistent state lives in the injected [`KeyValueStore`].

use parley_core::{
    ConversationId, EnvelopeError, Environment, SessionKey,
    envelope::{self, EnvelopeDraft},
    error::StoreError,
    handshake::{HandshakeConfig, HandshakeDriver, SessionEstablished},
    identity::IdentityKeyStore,
    mailbox::{Mailbox, MessageTransport},
    registry::{DEFAULT_HISTORY_CAPACITY, SessionKeyRegistry},
    store::{ConversationStore, KeyValueStore, Slot},
};
use parley_crypto::IdentityPublicKey;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::ClientError,
    message::{Conversation, ConversationItem, DownloadedFile},
};

/// Namespace holding each local user's next outbound sequence number
const OUTBOUND_SEQUENCE: &str = "outbound";

/// Namespace holding the session version an unfinished rotation started from
const PENDING_ROTATION: &str = "pending-rotation";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Handshake retry budget
    pub handshake: HandshakeConfig,
    /// Prior key versions kept per conversation
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { handshake: HandshakeConfig::default(), history_capacity: DEFAULT_HISTORY_CAPACITY }
    }
}

/// Client for one local user.
pub struct Client<E, K, M, T> {
    user_id: String,
    env: E,
    store: K,
    identities: IdentityKeyStore<K>,
    registry: SessionKeyRegistry<K>,
    mailbox: M,
    transport: T,
    config: ClientConfig,
    /// Held from sequence allocation until the relay has the envelope, so
    /// envelopes reach the relay in sequence order
    outbound: Mutex<()>,
}

impl<E, K, M, T> Client<E, K, M, T>
where
    E: Environment,
    K: KeyValueStore,
    M: Mailbox,
    T: MessageTransport,
{
    /// Create a client for `user_id`.
    pub fn new(
        user_id: impl Into<String>,
        env: E,
        store: K,
        mailbox: M,
        transport: T,
        config: ClientConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            env,
            identities: IdentityKeyStore::new(store.clone()),
            registry: SessionKeyRegistry::new(store.clone(), config.history_capacity),
            store,
            mailbox,
            transport,
            config,
            outbound: Mutex::new(()),
        }
    }

    /// Local user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Session key registry
    pub fn registry(&self) -> &SessionKeyRegistry<K> {
        &self.registry
    }

    /// Create this user's identity key if it does not exist yet.
    ///
    /// Returns the public half, to be registered with the relay.
    pub fn bootstrap_identity(&self) -> Result<IdentityPublicKey, ClientError> {
        Ok(self.identities.create(&self.user_id, &self.env)?)
    }

    /// This user's public identity key.
    pub fn identity_public_key(&self) -> Result<IdentityPublicKey, ClientError> {
        Ok(self.identities.public_key_of(&self.user_id)?)
    }

    /// Require `peer_id` to sign future handshakes with `key`.
    ///
    /// Without an explicit pin the first verified handshake pins the key.
    pub fn pin_peer_identity(
        &self,
        peer_id: &str,
        key: &IdentityPublicKey,
    ) -> Result<(), ClientError> {
        self.identities.pin_peer(&self.user_id, peer_id, key)?;
        info!(user_id = %self.user_id, peer = peer_id, "pinned peer identity key");
        Ok(())
    }

    /// Current session key with `peer_id`, if established.
    pub fn session(&self, peer_id: &str) -> Result<Option<SessionKey>, ClientError> {
        Ok(self.registry.current(&self.conversation_id(peer_id))?)
    }

    /// Current session key with `peer_id`, running a handshake if there is
    /// none.
    ///
    /// # Errors
    ///
    /// - `Handshake` if the handshake fails; `Exhausted` is retryable by
    ///   calling again
    pub async fn ensure_session(&self, peer_id: &str) -> Result<SessionKey, ClientError> {
        if let Some(key) = self.session(peer_id)? {
            debug!(
                user_id = %self.user_id,
                peer = peer_id,
                key_version = key.version(),
                "session exists"
            );
            return Ok(key);
        }
        Ok(self.handshake(peer_id).await?.key)
    }

    /// Replace the session key with `peer_id` through a fresh handshake.
    ///
    /// The new key becomes the next version; the previous one moves to
    /// history so envelopes already in flight still decrypt. Both peers must
    /// rotate: the responder waits for a new INIT from the initiator.
    ///
    /// Calling again after `Exhausted` resumes the same rotation: the
    /// initiator republishes its ephemeral key, which the peer may already
    /// have answered, so both sides land on the same version.
    pub async fn rotate_session(&self, peer_id: &str) -> Result<SessionKey, ClientError> {
        let scope = ConversationStore::new(self.store.clone(), self.conversation_id(peer_id));
        let current = self.session(peer_id)?.map_or(0, |key| key.version());

        if self.pending_rotation(peer_id)? == Some(current) {
            debug!(
                user_id = %self.user_id,
                peer = peer_id,
                key_version = current,
                "resuming unfinished rotation"
            );
        } else {
            // A new rotation never reuses an unconsumed ephemeral key
            scope.clear(Slot::Ephemeral)?;
            self.store.put(
                PENDING_ROTATION,
                scope.conversation_id().as_str(),
                &current.to_be_bytes(),
            )?;
        }

        let established = self.handshake(peer_id).await?;
        self.store.delete(PENDING_ROTATION, scope.conversation_id().as_str())?;
        info!(
            user_id = %self.user_id,
            peer = peer_id,
            key_version = established.key.version(),
            "session rotated"
        );
        Ok(established.key)
    }

    /// Encrypt and send a text message. Returns the relay's envelope id.
    ///
    /// # Errors
    ///
    /// - `Envelope(NoSession)` if no session exists with `peer_id`
    /// - `Transport` if the relay refuses the envelope
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<u64, ClientError> {
        self.send(peer_id, None, text.as_bytes()).await
    }

    /// Encrypt and upload a file. Returns the relay's envelope id.
    ///
    /// The whole buffer is sealed in one envelope.
    pub async fn send_file(
        &self,
        peer_id: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<u64, ClientError> {
        self.send(peer_id, Some(filename.to_owned()), data).await
    }

    /// Fetch and decrypt the conversation with `peer_id`.
    ///
    /// Envelopes that cannot be decrypted (evicted key version, tampering)
    /// are skipped and counted rather than failing the load.
    pub async fn load_conversation(&self, peer_id: &str) -> Result<Conversation, ClientError> {
        let cid = self.conversation_id(peer_id);
        let stored = self.transport.list_conversation(&self.user_id, peer_id).await?;
        let total = stored.len();

        let batch = envelope::open_batch(&self.registry, &cid, stored)?;
        let skipped = batch.skipped.len();

        let items = batch
            .opened
            .into_iter()
            .map(|opened| ConversationItem::new(opened.id, opened.envelope, opened.plaintext))
            .collect();

        debug!(conversation_id = %cid, total, skipped, "conversation loaded");
        Ok(Conversation { items, skipped })
    }

    /// Download and decrypt a file shared with `peer_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the id is unknown or belongs to another conversation
    /// - `NotAFile` if the envelope is a text message
    /// - `Envelope(Undecryptable)` if no retained key opens it
    pub async fn download_file(
        &self,
        peer_id: &str,
        id: u64,
    ) -> Result<DownloadedFile, ClientError> {
        let cid = self.conversation_id(peer_id);
        let stored = self.transport.fetch(id).await?.ok_or(ClientError::NotFound { id })?;

        if ConversationId::new(&stored.envelope.sender_id, &stored.envelope.receiver_id) != cid {
            return Err(ClientError::NotFound { id });
        }
        let Some(filename) = stored.envelope.filename.clone() else {
            return Err(ClientError::NotAFile { id });
        };

        let data = envelope::open_with_fallback(&self.registry, &cid, &stored.envelope)?;
        Ok(DownloadedFile { id, filename, data })
    }

    async fn send(
        &self,
        peer_id: &str,
        filename: Option<String>,
        plaintext: &[u8],
    ) -> Result<u64, ClientError> {
        let key = self.session(peer_id)?.ok_or_else(|| EnvelopeError::NoSession {
            conversation_id: self.conversation_id(peer_id).to_string(),
        })?;

        let _order = self.outbound.lock().await;
        let sequence_number = self.next_sequence()?;

        let draft = EnvelopeDraft {
            sender_id: self.user_id.clone(),
            receiver_id: peer_id.to_owned(),
            sequence_number,
            filename,
        };
        let sealed = envelope::seal(&key, draft, plaintext, &self.env);
        let is_file = sealed.is_file();

        let id = self.transport.append(sealed).await?;
        debug!(
            user_id = %self.user_id,
            peer = peer_id,
            id,
            sequence_number,
            key_version = key.version(),
            is_file,
            "envelope sent"
        );
        Ok(id)
    }

    /// Allocate and persist the next outbound sequence number.
    ///
    /// One counter per local user across all conversations, since the relay
    /// tracks replay state per sender.
    fn next_sequence(&self) -> Result<u64, StoreError> {
        let last = match self.store.get(OUTBOUND_SEQUENCE, &self.user_id)? {
            None => 0,
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    what: "outbound sequence",
                    reason: format!("expected 8 bytes, got {}", bytes.len()),
                })?;
                u64::from_be_bytes(raw)
            },
        };

        let next = last + 1;
        self.store.put(OUTBOUND_SEQUENCE, &self.user_id, &next.to_be_bytes())?;
        Ok(next)
    }

    /// Session version the unfinished rotation with `peer_id` started from.
    fn pending_rotation(&self, peer_id: &str) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(PENDING_ROTATION, self.conversation_id(peer_id).as_str())?
        else {
            return Ok(None);
        };
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            what: "pending rotation",
            reason: format!("expected 4 bytes, got {}", bytes.len()),
        })?;
        Ok(Some(u32::from_be_bytes(raw)))
    }

    async fn handshake(&self, peer_id: &str) -> Result<SessionEstablished, ClientError> {
        let driver = HandshakeDriver {
            env: &self.env,
            identities: &self.identities,
            registry: &self.registry,
            store: &self.store,
            mailbox: &self.mailbox,
            config: &self.config.handshake,
        };
        Ok(driver.run_handshake(&self.user_id, peer_id).await?)
    }

    fn conversation_id(&self, peer_id: &str) -> ConversationId {
        ConversationId::new(&self.user_id, peer_id)
    }
}
