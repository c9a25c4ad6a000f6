//! Async driver for the handshake state machine.
//!
//! Executes [`HandshakeAction`]s against the mailbox, the identity store and
//! the conversation-scoped key-value store until the machine establishes a
//! session or fails.

use std::collections::VecDeque;

use parley_crypto::{EphemeralKeyPair, IdentityPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroize;

use super::{
    HandshakeConfig,
    machine::{AnsweredInit, Handshake, HandshakeAction},
};
use crate::{
    codec,
    conversation::ConversationId,
    derivation::SessionKey,
    env::Environment,
    error::{HandshakeError, StoreError},
    identity::IdentityKeyStore,
    mailbox::Mailbox,
    registry::SessionKeyRegistry,
    store::{ConversationStore, KeyValueStore, Slot},
};

/// Ephemeral secret persisted between handshake attempts.
#[derive(Serialize, Deserialize)]
struct PersistedEphemeral {
    secret: [u8; 32],
}

impl Drop for PersistedEphemeral {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// A completed handshake.
#[derive(Debug, Clone)]
pub struct SessionEstablished {
    /// Installed session key, with its registry version
    pub key: SessionKey,
    /// Identity key the peer signed with
    pub peer_identity: IdentityPublicKey,
}

/// Everything a handshake run needs, borrowed from the caller.
pub struct HandshakeDriver<'a, E, K, M: ?Sized> {
    /// Time, randomness and sleep
    pub env: &'a E,
    /// Own identity keys and pinned peer keys
    pub identities: &'a IdentityKeyStore<K>,
    /// Where the derived key is installed
    pub registry: &'a SessionKeyRegistry<K>,
    /// Backing store for per-conversation handshake state
    pub store: &'a K,
    /// Handshake record relay
    pub mailbox: &'a M,
    /// Retry budget
    pub config: &'a HandshakeConfig,
}

impl<E, K, M> HandshakeDriver<'_, E, K, M>
where
    E: Environment,
    K: KeyValueStore,
    M: Mailbox + ?Sized,
{
    /// Run one handshake attempt between `my_id` and `peer_id` to completion.
    ///
    /// On success the derived key is installed as the conversation's next
    /// version and the peer's identity key is pinned if none was pinned yet.
    ///
    /// An initiator whose earlier attempt was exhausted reuses the persisted
    /// ephemeral key, so a late CONFIRM for that key is still accepted. The
    /// persisted key is discarded once the session is established or a
    /// security violation is detected.
    ///
    /// # Errors
    ///
    /// - `IdentityNotFound` if `my_id` has no identity key
    /// - `Exhausted` if the peer never answered within the retry budget
    /// - Security violations from [`Handshake::handle_fetch`]
    /// - `Mailbox` or `Store` on infrastructure failure
    pub async fn run_handshake(
        &self,
        my_id: &str,
        peer_id: &str,
    ) -> Result<SessionEstablished, HandshakeError> {
        let mut machine = Handshake::new(my_id, peer_id, self.config.retry.clone())?;
        let scope = ConversationStore::new(self.store.clone(), ConversationId::new(my_id, peer_id));

        let identity = self.identities.public_key_of(my_id)?;
        let pinned = self.identities.pinned(my_id, peer_id)?;
        let consumed = scope.load::<AnsweredInit>(Slot::ConsumedInit)?;
        let reuse = load_ephemeral(&scope)?;

        machine = machine.with_pinned_peer(pinned).with_consumed_init(consumed);
        info!(
            conversation_id = %machine.conversation_id(),
            role = ?machine.role(),
            reusing_ephemeral = reuse.is_some(),
            "starting handshake"
        );

        let mut queue: VecDeque<HandshakeAction> = machine.start(identity, reuse, self.env)?.into();
        let mut established = None;

        while let Some(action) = queue.pop_front() {
            match action {
                HandshakeAction::PersistEphemeral(keypair) => {
                    let persisted = PersistedEphemeral { secret: *keypair.to_secret_bytes() };
                    scope.save(Slot::Ephemeral, &persisted)?;
                },
                HandshakeAction::Publish(payload) => {
                    let record = codec::sign(self.identities, my_id, payload)?;
                    self.mailbox.put(record).await?;
                    queue.extend(machine.published()?);
                },
                HandshakeAction::Fetch { from, to, kind } => {
                    let record = self.mailbox.get_latest(&from, &to, kind).await?;
                    match machine.handle_fetch(record, self.env) {
                        Ok(next) => queue.extend(next),
                        Err(err) => {
                            if err.is_security_violation() {
                                scope.clear(Slot::Ephemeral)?;
                            }
                            return Err(err);
                        },
                    }
                },
                HandshakeAction::Wait(delay) => self.env.sleep(delay).await,
                HandshakeAction::RememberInit(answered) => {
                    scope.save(Slot::ConsumedInit, &answered)?;
                },
                HandshakeAction::DiscardEphemeral => scope.clear(Slot::Ephemeral)?,
                HandshakeAction::Established(key) => {
                    let version = self.registry.rotate(scope.conversation_id(), &key)?;
                    established = Some(key.with_version(version));
                },
            }
        }

        let (Some(key), Some(peer_identity)) = (established, machine.peer_identity().copied())
        else {
            return Err(HandshakeError::InvalidState {
                state: machine.state(),
                operation: "run_handshake",
            });
        };

        if pinned.is_none() {
            self.identities.pin_peer(my_id, peer_id, &peer_identity)?;
        }

        info!(
            conversation_id = %key.conversation_id(),
            peer = peer_id,
            key_version = key.version(),
            "session established"
        );
        Ok(SessionEstablished { key, peer_identity })
    }
}

fn load_ephemeral<K: KeyValueStore>(
    scope: &ConversationStore<K>,
) -> Result<Option<EphemeralKeyPair>, StoreError> {
    let Some(persisted) = scope.load::<PersistedEphemeral>(Slot::Ephemeral)? else {
        return Ok(None);
    };

    match EphemeralKeyPair::from_secret_bytes(&persisted.secret) {
        Ok(keypair) => Ok(Some(keypair)),
        Err(err) => {
            warn!(
                conversation_id = %scope.conversation_id(),
                error = %err,
                "discarding unusable persisted ephemeral key"
            );
            scope.clear(Slot::Ephemeral)?;
            Ok(None)
        },
    }
}
