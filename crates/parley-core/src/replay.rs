//! Replay protection for inbound envelopes.
//!
//! Per sender, the guard remembers every accepted nonce and the highest
//! accepted sequence number. An envelope is admitted only if its nonce is
//! new AND its sequence number is strictly greater than the last one.
//!
//! # Atomicity
//!
//! [`ReplayGuard::admit`] evaluates and commits under a per-sender lock, and
//! persists the new state before releasing it. Two concurrent sends from the
//! same sender can therefore never both pass the check. Different senders
//! never contend.
//!
//! # Pruning
//!
//! Nonces are timestamped when first seen and may be dropped after a
//! retention window. Pruning never lowers `last_sequence`, so a pruned
//! nonce still cannot be replayed: its sequence number is at most the
//! committed maximum.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Why an envelope was refused
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayRejection {
    /// This nonce was already accepted from this sender
    #[error("nonce reused")]
    NonceReused,

    /// Sequence number did not increase
    #[error("sequence rollback: {got} <= {last}")]
    SequenceRollback {
        /// Last committed sequence
        last: u64,
        /// Sequence carried by the envelope
        got: u64,
    },
}

/// Outcome of a replay check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Nonce unseen and sequence increasing
    Accept,
    /// Refused
    Reject(ReplayRejection),
}

impl ReplayDecision {
    /// Whether the envelope may be accepted.
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Replay bookkeeping for one sender.
///
/// # Invariants
///
/// - Each nonce appears at most once in `used_nonces`
/// - `last_sequence` only increases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayState {
    last_sequence: u64,
    /// nonce -> first-seen wall clock (ms)
    used_nonces: HashMap<String, u64>,
}

impl ReplayState {
    /// Highest committed sequence number (0 before the first envelope).
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Number of remembered nonces.
    pub fn nonce_count(&self) -> usize {
        self.used_nonces.len()
    }

    /// Whether `nonce` has been accepted and not yet pruned.
    pub fn has_nonce(&self, nonce: &str) -> bool {
        self.used_nonces.contains_key(nonce)
    }

    /// Evaluate an envelope without changing state.
    ///
    /// Nonce reuse is reported ahead of sequence rollback, so an exact
    /// replay is always identified as `NonceReused`.
    pub fn check(&self, nonce: &str, sequence: u64) -> ReplayDecision {
        if self.used_nonces.contains_key(nonce) {
            return ReplayDecision::Reject(ReplayRejection::NonceReused);
        }
        if sequence <= self.last_sequence {
            return ReplayDecision::Reject(ReplayRejection::SequenceRollback {
                last: self.last_sequence,
                got: sequence,
            });
        }
        ReplayDecision::Accept
    }

    /// Record an accepted envelope.
    ///
    /// Callers must have received `Accept` from [`Self::check`] on this same
    /// state with no intervening mutation.
    pub fn commit(&mut self, nonce: &str, sequence: u64, seen_at_ms: u64) {
        debug_assert!(self.check(nonce, sequence).is_accept());

        self.last_sequence = sequence;
        self.used_nonces.insert(nonce.to_string(), seen_at_ms);
    }

    /// Forget nonces first seen before `cutoff_ms`. Returns how many were
    /// dropped.
    pub fn prune_nonces(&mut self, cutoff_ms: u64) -> usize {
        let before = self.used_nonces.len();
        self.used_nonces.retain(|_, seen_at| *seen_at >= cutoff_ms);
        before - self.used_nonces.len()
    }
}

/// Persistence for per-sender replay state.
///
/// Synchronous, like the rest of the storage layer.
pub trait ReplayStore: Send + Sync + 'static {
    /// Stored state for `sender_id`. `None` if the sender was never seen.
    fn load_replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError>;

    /// Overwrite the state for `sender_id`.
    fn store_replay_state(&self, sender_id: &str, state: &ReplayState) -> Result<(), StoreError>;

    /// Every sender with stored state. Order is not guaranteed.
    fn replay_senders(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`ReplayStore`].
#[derive(Clone, Default)]
pub struct MemoryReplayStore {
    inner: Arc<Mutex<HashMap<String, ReplayState>>>,
}

impl MemoryReplayStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplayStore for MemoryReplayStore {
    fn load_replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.get(sender_id).cloned())
    }

    fn store_replay_state(&self, sender_id: &str, state: &ReplayState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.insert(sender_id.to_string(), state.clone());
        Ok(())
    }

    fn replay_senders(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.keys().cloned().collect())
    }
}

/// Errors from [`ReplayGuard::admit`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Envelope refused
    #[error(transparent)]
    Rejected(#[from] ReplayRejection),

    /// State could not be loaded or persisted; nothing was committed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cached state for one sender. `None` until first loaded from the store.
type SenderSlot = Arc<Mutex<Option<ReplayState>>>;

/// Atomic per-sender replay admission.
///
/// Cheap to share behind an `Arc`. State is cached after first use and
/// written through to the store on every commit.
pub struct ReplayGuard<S> {
    store: S,
    senders: RwLock<HashMap<String, SenderSlot>>,
}

impl<S: ReplayStore> ReplayGuard<S> {
    /// Guard backed by `store`.
    pub fn new(store: S) -> Self {
        Self { store, senders: RwLock::new(HashMap::new()) }
    }

    /// Evaluate without committing.
    ///
    /// Advisory only: the answer may be stale by the time the caller acts
    /// on it. Use [`Self::admit`] to accept envelopes.
    pub fn check(
        &self,
        sender_id: &str,
        nonce: &str,
        sequence: u64,
    ) -> Result<ReplayDecision, StoreError> {
        let slot = self.slot(sender_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.loaded(sender_id, &mut *cached)?;
        Ok(state.check(nonce, sequence))
    }

    /// Check and commit as one step under the sender's lock.
    ///
    /// On `Ok`, the nonce and sequence are persisted. On any error, neither
    /// the cache nor the store changed.
    pub fn admit(
        &self,
        sender_id: &str,
        nonce: &str,
        sequence: u64,
        now_ms: u64,
    ) -> Result<(), ReplayError> {
        let slot = self.slot(sender_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.loaded(sender_id, &mut *cached)?;

        if let ReplayDecision::Reject(rejection) = state.check(nonce, sequence) {
            warn!(
                target: "parley::security",
                sender_id,
                nonce,
                sequence,
                last_sequence = state.last_sequence(),
                reason = %rejection,
                "replay rejected"
            );
            return Err(rejection.into());
        }

        let mut next = state.clone();
        next.commit(nonce, sequence, now_ms);
        self.store.store_replay_state(sender_id, &next)?;
        *cached = Some(next);

        debug!(sender_id, sequence, "envelope admitted");
        Ok(())
    }

    /// Current state for `sender_id`, if any.
    pub fn state(&self, sender_id: &str) -> Result<Option<ReplayState>, StoreError> {
        let slot = self.slot(sender_id);
        let cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match cached.as_ref() {
            Some(state) => Ok(Some(state.clone())),
            None => self.store.load_replay_state(sender_id),
        }
    }

    /// Drop nonces first seen before `cutoff_ms` for every sender.
    ///
    /// Returns the total number of nonces dropped.
    pub fn prune_nonces(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let mut pruned = 0;

        for sender_id in self.store.replay_senders()? {
            let slot = self.slot(&sender_id);
            let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let mut next = self.loaded(&sender_id, &mut *cached)?.clone();

            let dropped = next.prune_nonces(cutoff_ms);
            if dropped > 0 {
                self.store.store_replay_state(&sender_id, &next)?;
                *cached = Some(next);
                pruned += dropped;
            }
        }

        debug!(pruned, cutoff_ms, "pruned replay nonces");
        Ok(pruned)
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn slot(&self, sender_id: &str) -> SenderSlot {
        {
            let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = senders.get(sender_id) {
                return Arc::clone(slot);
            }
        }

        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(senders.entry(sender_id.to_string()).or_default())
    }

    fn loaded<'a>(
        &self,
        sender_id: &str,
        cached: &'a mut Option<ReplayState>,
    ) -> Result<&'a ReplayState, StoreError> {
        if cached.is_none() {
            *cached = Some(self.store.load_replay_state(sender_id)?.unwrap_or_default());
        }
        Ok(cached.get_or_insert_with(ReplayState::default))
    }
}
