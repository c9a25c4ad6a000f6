//! Invariant checks over relay and client state.
//!
//! Invariants are properties that must hold after any sequence of
//! operations, however the simulation interleaves them. A test captures a
//! [`WorldSnapshot`] at interesting points and runs the registry against it.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use parley_core::SessionKey;
use parley_proto::StoredEnvelope;
use parley_server::Storage;

use crate::world::{SimClient, SimWorld};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// One client's view of one conversation.
#[derive(Debug, Clone)]
pub struct SessionView {
    /// Local user
    pub user_id: String,
    /// Peer
    pub peer_id: String,
    /// Current session key, if established
    pub key: Option<SessionKey>,
}

/// Observable state of a world.
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    /// Every envelope in the relay log between captured clients, by id
    pub envelopes: Vec<StoredEnvelope>,
    /// Each client's session with each other captured client
    pub sessions: Vec<SessionView>,
}

impl WorldSnapshot {
    /// Snapshot with nothing in it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture the relay log and sessions among `clients`.
    ///
    /// Store failures while reading sessions are recorded as no session.
    pub fn capture<S: Storage>(world: &SimWorld<S>, clients: &[&SimClient<S>]) -> Self {
        let mut envelopes = Vec::new();
        let mut sessions = Vec::new();

        for (i, client) in clients.iter().enumerate() {
            for (j, peer) in clients.iter().enumerate() {
                if i == j {
                    continue;
                }
                sessions.push(SessionView {
                    user_id: client.user_id().to_owned(),
                    peer_id: peer.user_id().to_owned(),
                    key: client.session(peer.user_id()).ok().flatten(),
                });
                if i < j
                    && let Ok(listed) = world.relay().conversation(client.user_id(), peer.user_id())
                {
                    envelopes.extend(listed);
                }
            }
        }

        envelopes.sort_by_key(|stored| stored.id);
        Self { envelopes, sessions }
    }
}

/// A property checked against a [`WorldSnapshot`].
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// `Ok(())` if the invariant holds.
    fn check(&self, state: &WorldSnapshot) -> InvariantResult;
}

/// The relay never stores two envelopes from one sender with one nonce.
pub struct NoReplayedNonce;

impl Invariant for NoReplayedNonce {
    fn name(&self) -> &'static str {
        "no_replayed_nonce"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        for stored in &state.envelopes {
            let envelope = &stored.envelope;
            if !seen.insert((envelope.sender_id.as_str(), envelope.nonce.as_str())) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "sender {} nonce {} stored twice (second at id {})",
                        envelope.sender_id, envelope.nonce, stored.id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Each sender's stored sequence numbers strictly increase in log order.
pub struct SequenceMonotonicity;

impl Invariant for SequenceMonotonicity {
    fn name(&self) -> &'static str {
        "sequence_monotonicity"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        let mut last: HashMap<&str, u64> = HashMap::new();
        for stored in &state.envelopes {
            let envelope = &stored.envelope;
            let previous = last.insert(&envelope.sender_id, envelope.sequence_number);
            if let Some(previous) = previous
                && envelope.sequence_number <= previous
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "sender {}: sequence {} after {} at id {}",
                        envelope.sender_id, envelope.sequence_number, previous, stored.id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Two peers that both hold a session hold the same key at the same version.
///
/// Only meaningful at quiescent points: mid-rotation one side may briefly be
/// ahead.
pub struct SessionAgreement;

impl Invariant for SessionAgreement {
    fn name(&self) -> &'static str {
        "session_agreement"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for view in &state.sessions {
            let Some(mine) = &view.key else { continue };
            let theirs = state
                .sessions
                .iter()
                .find(|other| other.user_id == view.peer_id && other.peer_id == view.user_id)
                .and_then(|other| other.key.as_ref());

            if let Some(theirs) = theirs
                && theirs != mine
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{} holds version {} with {}, who holds version {}",
                        view.user_id,
                        mine.version(),
                        view.peer_id,
                        theirs.version()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every standard invariant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(NoReplayedNonce);
        registry.add(SequenceMonotonicity);
        registry.add(SessionAgreement);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants. Returns every violation found.
    pub fn check_all(&self, state: &WorldSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    ///
    /// Use this in tests where you want immediate failure with context.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &WorldSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
