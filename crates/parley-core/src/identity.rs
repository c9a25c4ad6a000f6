//! Long-term identity key store.
//!
//! Holds the signing keypairs of the local users on a device and the identity
//! keys each of them has pinned for peers. Private keys never leave this type:
//! callers hand it bytes to sign.

use parley_crypto::{IdentityKeyPair, IdentityPublicKey, IdentitySignature};
use tracing::{debug, info};

use crate::{
    env::Environment,
    error::{IdentityError, StoreError},
    store::KeyValueStore,
};

const OWN_KEYS: &str = "identity";
const PINNED_KEYS: &str = "pinned-identity";

/// Identity keys for the users on one device, plus the peer keys each local
/// user has pinned.
#[derive(Clone)]
pub struct IdentityKeyStore<K> {
    store: K,
}

impl<K: KeyValueStore> IdentityKeyStore<K> {
    /// Wrap a key-value store.
    pub fn new(store: K) -> Self {
        Self { store }
    }

    /// Create the identity keypair for `user_id`.
    ///
    /// Idempotent: if a key already exists it is kept and its public half
    /// returned. Identity keys are never rotated.
    pub fn create<E: Environment>(
        &self,
        user_id: &str,
        env: &E,
    ) -> Result<IdentityPublicKey, IdentityError> {
        if let Some(existing) = self.load(user_id)? {
            debug!(user_id, "identity key already exists");
            return Ok(existing.public_key());
        }

        let keypair = loop {
            // Out-of-range scalars are astronomically rare; draw again
            if let Ok(keypair) = IdentityKeyPair::from_random_bytes(env.random_array()) {
                break keypair;
            }
        };

        self.store.put(OWN_KEYS, user_id, keypair.to_secret_bytes().as_slice())?;
        info!(user_id, "created identity key");

        Ok(keypair.public_key())
    }

    /// Public identity key of a local user.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `create` was never called for this user
    pub fn public_key_of(&self, user_id: &str) -> Result<IdentityPublicKey, IdentityError> {
        self.load(user_id)?
            .map(|keypair| keypair.public_key())
            .ok_or_else(|| IdentityError::NotFound { user_id: user_id.to_string() })
    }

    /// Sign `message` with `user_id`'s identity key.
    pub fn sign(&self, user_id: &str, message: &[u8]) -> Result<IdentitySignature, IdentityError> {
        let keypair = self
            .load(user_id)?
            .ok_or_else(|| IdentityError::NotFound { user_id: user_id.to_string() })?;
        Ok(keypair.sign(message))
    }

    /// Pin the identity key `local_user` expects from `peer_id`.
    ///
    /// Handshake records from this peer to `local_user` carrying any other
    /// key are rejected as `IdentityMismatch`. Re-pinning replaces the
    /// previous key. Pins are private to each local user.
    pub fn pin_peer(
        &self,
        local_user: &str,
        peer_id: &str,
        key: &IdentityPublicKey,
    ) -> Result<(), StoreError> {
        self.store.put(&pinned_namespace(local_user), peer_id, &key.to_sec1_bytes())?;
        debug!(user_id = local_user, peer = peer_id, "pinned peer identity");
        Ok(())
    }

    /// Identity key `local_user` has pinned for `peer_id`, if any.
    pub fn pinned(
        &self,
        local_user: &str,
        peer_id: &str,
    ) -> Result<Option<IdentityPublicKey>, IdentityError> {
        self.store
            .get(&pinned_namespace(local_user), peer_id)?
            .map(|bytes| IdentityPublicKey::from_sec1_bytes(&bytes))
            .transpose()
            .map_err(IdentityError::from)
    }

    fn load(&self, user_id: &str) -> Result<Option<IdentityKeyPair>, IdentityError> {
        let Some(secret) = self.store.get(OWN_KEYS, user_id)? else {
            return Ok(None);
        };
        let secret = zeroize::Zeroizing::new(secret);
        Ok(Some(IdentityKeyPair::from_secret_bytes(&secret)?))
    }
}

fn pinned_namespace(local_user: &str) -> String {
    format!("{PINNED_KEYS}/{local_user}")
}
