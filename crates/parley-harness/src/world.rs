//! In-process simulation world: one relay, any number of clients.
//!
//! Every client gets its own key-value store (its "device") and talks to the
//! shared relay through the core mailbox and transport traits, exactly as a
//! remote client would.

use std::sync::Arc;

use parley_client::{Client, ClientConfig, ClientError};
use parley_core::{SessionKey, store::MemoryKeyValueStore};
use parley_server::{MemoryStorage, Relay, RelayConfig, Storage};
use tracing::debug;

use crate::sim_env::SimEnv;

/// Relay shared by every client in a world.
pub type SimRelay<S = MemoryStorage> = Relay<SimEnv, S>;

/// Client wired to a shared [`SimRelay`].
pub type SimClient<S = MemoryStorage> =
    Client<SimEnv, MemoryKeyValueStore, Arc<SimRelay<S>>, Arc<SimRelay<S>>>;

/// A relay plus the configuration used to create clients against it.
pub struct SimWorld<S: Storage = MemoryStorage> {
    env: SimEnv,
    relay: Arc<SimRelay<S>>,
    client_config: ClientConfig,
}

impl SimWorld<MemoryStorage> {
    /// World with an in-memory relay and default configuration.
    pub fn new(seed: u64) -> Self {
        Self::with_storage(seed, MemoryStorage::new(), RelayConfig::default())
    }
}

impl<S: Storage> SimWorld<S> {
    /// World over a specific relay storage.
    pub fn with_storage(seed: u64, storage: S, relay_config: RelayConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let relay = Arc::new(Relay::new(env.clone(), storage, relay_config));
        Self { env, relay, client_config: ClientConfig::default() }
    }

    /// Use `config` for clients created from now on.
    #[must_use]
    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// The shared relay.
    pub fn relay(&self) -> &Arc<SimRelay<S>> {
        &self.relay
    }

    /// The world's environment (shared RNG stream and clock).
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// A client for `user_id` with a fresh device store and no identity.
    pub fn client(&self, user_id: &str) -> SimClient<S> {
        self.client_on(user_id, MemoryKeyValueStore::new())
    }

    /// A client for `user_id` over an existing device store.
    ///
    /// Two clients over the same store behave like one user restarting the
    /// app.
    pub fn client_on(&self, user_id: &str, store: MemoryKeyValueStore) -> SimClient<S> {
        Client::new(
            user_id,
            self.env.clone(),
            store,
            Arc::clone(&self.relay),
            Arc::clone(&self.relay),
            self.client_config.clone(),
        )
    }

    /// A client with a bootstrapped identity registered at the relay.
    pub fn join(&self, user_id: &str) -> Result<SimClient<S>, ClientError> {
        let client = self.client(user_id);
        self.register(&client)?;
        Ok(client)
    }

    /// Bootstrap `client`'s identity and register it with the relay.
    pub fn register(&self, client: &SimClient<S>) -> Result<(), ClientError> {
        let public_key = client.bootstrap_identity()?;
        self.relay
            .register_identity(client.user_id(), &public_key.to_sec1_bytes())
            .map_err(parley_core::TransportError::from)?;
        debug!(user_id = client.user_id(), "joined simulation");
        Ok(())
    }
}

/// Run `ensure_session` on both clients concurrently.
///
/// Neither side can finish alone: the initiator waits for the CONFIRM, the
/// responder for the INIT.
pub async fn establish<S: Storage>(
    a: &SimClient<S>,
    b: &SimClient<S>,
) -> Result<(SessionKey, SessionKey), ClientError> {
    let (ka, kb) = tokio::join!(a.ensure_session(b.user_id()), b.ensure_session(a.user_id()));
    Ok((ka?, kb?))
}

/// Run `rotate_session` on both clients concurrently.
pub async fn rotate<S: Storage>(
    a: &SimClient<S>,
    b: &SimClient<S>,
) -> Result<(SessionKey, SessionKey), ClientError> {
    let (ka, kb) = tokio::join!(a.rotate_session(b.user_id()), b.rotate_session(a.user_id()));
    Ok((ka?, kb?))
}
