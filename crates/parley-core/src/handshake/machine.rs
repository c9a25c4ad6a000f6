//! Handshake state machine.
//!
//! Sans-IO: methods take the fetched record (or nothing) and return actions
//! for the driver to execute. Time is never read here; backoff is expressed
//! as [`HandshakeAction::Wait`].
//!
//! # State Machine
//!
//! ```text
//! Initiator:
//! ┌─────┐ start ┌──────────┐ published ┌────────────────┐ CONFIRM ┌─────────────┐
//! │ New │──────>│ InitSent │──────────>│ ConfirmAwaited │────────>│ Established │
//! └─────┘       └──────────┘           └────────────────┘         └─────────────┘
//!
//! Responder:
//! ┌─────┐ start ┌─────────────┐  INIT   ┌─────────────┐ published ┌─────────────┐
//! │ New │──────>│ InitAwaited │────────>│ ConfirmSent │──────────>│ Established │
//! └─────┘       └─────────────┘         └─────────────┘           └─────────────┘
//!
//! Both awaiting states go to Failed on a security violation or when the
//! retry budget runs out.
//! ```

use std::time::Duration;

use parley_crypto::{EphemeralKeyPair, EphemeralPublicKey, IdentityPublicKey};
use parley_proto::{
    CONFIRM_SEQUENCE, HandshakeBody, HandshakeKind, HandshakePayload, INIT_SEQUENCE,
    SignedHandshake,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::retry::RetryPolicy;
use crate::{
    codec,
    conversation::{ConversationId, Role, role},
    derivation::{self, SessionKey},
    env::Environment,
    error::HandshakeError,
};

/// Handshake progress for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not started
    New,
    /// Initiator: INIT built, waiting for it to be published
    InitSent,
    /// Initiator: polling for the responder's CONFIRM
    ConfirmAwaited,
    /// Responder: polling for the initiator's INIT
    InitAwaited,
    /// Responder: CONFIRM built, waiting for it to be published
    ConfirmSent,
    /// Session key derived on this side
    Established,
    /// Attempt ended with an error
    Failed,
}

impl HandshakeState {
    /// Returns true for `Established` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

/// Actions returned by the handshake state machine.
///
/// The driver executes them in order and feeds results back through
/// [`Handshake::published`] and [`Handshake::handle_fetch`].
#[derive(Debug, Clone)]
pub enum HandshakeAction {
    /// Persist the initiator's ephemeral secret for this conversation
    PersistEphemeral(EphemeralKeyPair),
    /// Sign and publish this payload, then call [`Handshake::published`]
    Publish(HandshakePayload),
    /// Fetch the latest matching record, then call
    /// [`Handshake::handle_fetch`]
    Fetch {
        /// Record sender
        from: String,
        /// Record recipient
        to: String,
        /// Record type
        kind: HandshakeKind,
    },
    /// Sleep before the next action
    Wait(Duration),
    /// Record that this INIT has been answered
    RememberInit(AnsweredInit),
    /// Drop the persisted ephemeral secret
    DiscardEphemeral,
    /// Handshake complete; install this key
    Established(SessionKey),
}

/// An INIT a responder has already answered.
///
/// A retrying initiator republishes its ephemeral key under a fresh nonce, so
/// both fields identify the INIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsweredInit {
    /// Nonce of the INIT
    pub nonce: String,
    /// Initiator ephemeral key it carried (SEC1 uncompressed)
    pub ephemeral_public_key: Vec<u8>,
}

impl AnsweredInit {
    fn of(body: &HandshakeBody) -> Self {
        Self { nonce: body.nonce.clone(), ephemeral_public_key: body.ephemeral_public_key.clone() }
    }

    fn matches(&self, body: &HandshakeBody) -> bool {
        self.nonce == body.nonce || self.ephemeral_public_key == body.ephemeral_public_key
    }
}

/// Handshake for one conversation, from one side.
#[derive(Debug)]
pub struct Handshake {
    my_id: String,
    peer_id: String,
    conversation_id: ConversationId,
    role: Role,
    state: HandshakeState,
    retry: RetryPolicy,
    /// Our identity key, embedded in every record we publish
    identity: Option<IdentityPublicKey>,
    ephemeral: Option<EphemeralKeyPair>,
    /// Key the peer must sign with, if pinned
    pinned_peer: Option<IdentityPublicKey>,
    /// Last INIT this responder answered
    consumed_init: Option<AnsweredInit>,
    /// Identity key the peer actually signed with
    peer_identity: Option<IdentityPublicKey>,
    /// Responder: key and answered INIT held until CONFIRM is published
    pending: Option<(SessionKey, AnsweredInit)>,
    attempts: u32,
    waited: Duration,
}

impl Handshake {
    /// Create a handshake between `my_id` and `peer_id`.
    ///
    /// The role follows from the two ids alone.
    ///
    /// # Errors
    ///
    /// - `SelfConversation` if the ids are equal
    pub fn new(my_id: &str, peer_id: &str, retry: RetryPolicy) -> Result<Self, HandshakeError> {
        if my_id == peer_id {
            return Err(HandshakeError::SelfConversation { user_id: my_id.to_owned() });
        }

        Ok(Self {
            my_id: my_id.to_owned(),
            peer_id: peer_id.to_owned(),
            conversation_id: ConversationId::new(my_id, peer_id),
            role: role(my_id, peer_id),
            state: HandshakeState::New,
            retry,
            identity: None,
            ephemeral: None,
            pinned_peer: None,
            consumed_init: None,
            peer_identity: None,
            pending: None,
            attempts: 0,
            waited: Duration::ZERO,
        })
    }

    /// Require the peer to sign with this identity key.
    #[must_use]
    pub fn with_pinned_peer(mut self, pinned: Option<IdentityPublicKey>) -> Self {
        self.pinned_peer = pinned;
        self
    }

    /// Ignore this INIT, and any republication of its ephemeral key; it has
    /// already been answered.
    #[must_use]
    pub fn with_consumed_init(mut self, answered: Option<AnsweredInit>) -> Self {
        self.consumed_init = answered;
        self
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our role in this conversation
    pub fn role(&self) -> Role {
        self.role
    }

    /// Conversation this handshake is for
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Fetches performed so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Identity key the peer signed with. Set once a record is accepted.
    pub fn peer_identity(&self) -> Option<&IdentityPublicKey> {
        self.peer_identity.as_ref()
    }

    /// Begin the handshake.
    ///
    /// The initiator reuses `reuse` when given (a persisted, unconsumed
    /// ephemeral key from an earlier attempt) and otherwise generates a fresh
    /// one. The responder ignores `reuse`: it generates its key only when an
    /// INIT arrives.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not in `New`
    pub fn start<E: Environment>(
        &mut self,
        identity: IdentityPublicKey,
        reuse: Option<EphemeralKeyPair>,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.require(HandshakeState::New, "start")?;
        self.identity = Some(identity);

        match self.role {
            Role::Initiator => {
                let mut actions = Vec::with_capacity(2);
                let ephemeral = if let Some(reused) = reuse {
                    debug!(conversation_id = %self.conversation_id, "reusing persisted ephemeral key");
                    reused
                } else {
                    let fresh = generate_ephemeral(env);
                    actions.push(HandshakeAction::PersistEphemeral(fresh.clone()));
                    fresh
                };

                let payload = HandshakePayload::Init(self.body(
                    &ephemeral.public_key(),
                    INIT_SEQUENCE,
                    env,
                ));
                self.ephemeral = Some(ephemeral);
                actions.push(HandshakeAction::Publish(payload));

                self.transition(HandshakeState::InitSent);
                Ok(actions)
            },
            Role::Responder => {
                self.transition(HandshakeState::InitAwaited);
                Ok(vec![self.fetch_action()])
            },
        }
    }

    /// The record built by the last `Publish` action is now in the mailbox.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if nothing was awaiting publication
    pub fn published(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match self.state {
            HandshakeState::InitSent => {
                self.transition(HandshakeState::ConfirmAwaited);
                Ok(vec![self.fetch_action()])
            },
            HandshakeState::ConfirmSent => {
                let Some((key, answered)) = self.pending.take() else {
                    return Err(self.invalid("published"));
                };
                self.ephemeral = None;
                self.transition(HandshakeState::Established);
                Ok(vec![
                    HandshakeAction::RememberInit(answered),
                    HandshakeAction::Established(key),
                ])
            },
            _ => Err(self.invalid("published")),
        }
    }

    /// Process the result of the last `Fetch` action.
    ///
    /// `None` means the peer has not published yet: the machine backs off
    /// and fetches again until the retry budget runs out. A record that is
    /// valid but stale (a CONFIRM for another ephemeral key, an INIT or
    /// ephemeral key already answered) is treated the same way.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not polling
    /// - `Exhausted` when the retry budget is spent
    /// - `UnexpectedRecord`, `InvalidSignature`, `IdentityMismatch`,
    ///   `MalformedKey` on a bad record; these are security violations
    ///
    /// Every error except `InvalidState` moves the machine to `Failed`.
    pub fn handle_fetch<E: Environment>(
        &mut self,
        record: Option<SignedHandshake>,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if !matches!(self.state, HandshakeState::ConfirmAwaited | HandshakeState::InitAwaited) {
            return Err(self.invalid("handle_fetch"));
        }
        self.attempts += 1;

        let result = match record {
            None => {
                trace!(
                    conversation_id = %self.conversation_id,
                    peer = %self.peer_id,
                    attempt = self.attempts,
                    "peer record not yet available"
                );
                self.back_off()
            },
            Some(record) => self.accept(record, env),
        };

        if result.is_err() {
            self.transition(HandshakeState::Failed);
        }
        result
    }

    fn accept<E: Environment>(
        &mut self,
        record: SignedHandshake,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let expected = self.expected_kind();
        if record.kind() != expected || record.from() != self.peer_id || record.to() != self.my_id {
            warn!(
                target: "parley::security",
                conversation_id = %self.conversation_id,
                peer = %self.peer_id,
                kind = %record.kind(),
                from = record.from(),
                to = record.to(),
                "mailbox returned a record for the wrong slot"
            );
            return Err(HandshakeError::UnexpectedRecord {
                kind: record.kind(),
                expected: format!("{expected} from {} to {}", self.peer_id, self.my_id),
            });
        }

        let signer = codec::verify_record(&record)?;
        if let Some(pinned) = &self.pinned_peer
            && *pinned != signer
        {
            warn!(
                target: "parley::security",
                conversation_id = %self.conversation_id,
                peer = %self.peer_id,
                kind = %record.kind(),
                "handshake signed by an identity key other than the pinned one"
            );
            return Err(HandshakeError::IdentityMismatch { peer: self.peer_id.clone() });
        }

        match self.role {
            Role::Initiator => self.accept_confirm(&record, signer),
            Role::Responder => self.accept_init(&record, signer, env),
        }
    }

    fn accept_confirm(
        &mut self,
        record: &SignedHandshake,
        signer: IdentityPublicKey,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let Some(ephemeral) = self.ephemeral.as_ref() else {
            return Err(self.invalid("handle_fetch"));
        };

        let bound_to_us = record
            .payload
            .peer_ephemeral_public_key()
            .is_some_and(|bound| bound == ephemeral.public_key().to_sec1_bytes().as_slice());
        if !bound_to_us {
            debug!(
                conversation_id = %self.conversation_id,
                peer = %self.peer_id,
                attempt = self.attempts,
                "ignoring CONFIRM bound to another ephemeral key"
            );
            return self.back_off();
        }

        let peer_ephemeral = self.peer_ephemeral(record)?;
        let key = derivation::derive(ephemeral, &peer_ephemeral, &self.conversation_id);

        self.peer_identity = Some(signer);
        self.ephemeral = None;
        self.transition(HandshakeState::Established);

        Ok(vec![HandshakeAction::DiscardEphemeral, HandshakeAction::Established(key)])
    }

    fn accept_init<E: Environment>(
        &mut self,
        record: &SignedHandshake,
        signer: IdentityPublicKey,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let init = record.payload.body();
        if self.consumed_init.as_ref().is_some_and(|answered| answered.matches(init)) {
            debug!(
                conversation_id = %self.conversation_id,
                peer = %self.peer_id,
                attempt = self.attempts,
                "ignoring INIT that was already answered"
            );
            return self.back_off();
        }

        let peer_ephemeral = self.peer_ephemeral(record)?;
        let ephemeral = generate_ephemeral(env);
        let key = derivation::derive(&ephemeral, &peer_ephemeral, &self.conversation_id);

        let confirm = HandshakePayload::Confirm {
            body: self.body(&ephemeral.public_key(), CONFIRM_SEQUENCE, env),
            peer_ephemeral_public_key: init.ephemeral_public_key.clone(),
        };

        self.peer_identity = Some(signer);
        self.ephemeral = Some(ephemeral);
        self.pending = Some((key, AnsweredInit::of(init)));
        self.transition(HandshakeState::ConfirmSent);

        Ok(vec![HandshakeAction::Publish(confirm)])
    }

    fn back_off(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match self.retry.next_delay(self.attempts, self.waited) {
            Some(delay) => {
                self.waited += delay;
                Ok(vec![HandshakeAction::Wait(delay), self.fetch_action()])
            },
            None => {
                warn!(
                    conversation_id = %self.conversation_id,
                    peer = %self.peer_id,
                    attempts = self.attempts,
                    waited = ?self.waited,
                    "handshake polling exhausted"
                );
                Err(HandshakeError::Exhausted {
                    peer: self.peer_id.clone(),
                    attempts: self.attempts,
                    waited: self.waited,
                })
            },
        }
    }

    fn peer_ephemeral(&self, record: &SignedHandshake) -> Result<EphemeralPublicKey, HandshakeError> {
        EphemeralPublicKey::from_sec1_bytes(&record.payload.body().ephemeral_public_key).map_err(|_| {
            warn!(
                target: "parley::security",
                conversation_id = %self.conversation_id,
                peer = %self.peer_id,
                kind = %record.kind(),
                "signed record carries malformed ephemeral key"
            );
            HandshakeError::MalformedKey { peer: self.peer_id.clone(), field: "ephemeralPublicKey" }
        })
    }

    fn body<E: Environment>(
        &self,
        ephemeral: &EphemeralPublicKey,
        sequence: u64,
        env: &E,
    ) -> HandshakeBody {
        HandshakeBody {
            from: self.my_id.clone(),
            to: self.peer_id.clone(),
            identity_public_key: self.identity.map(|key| key.to_sec1_bytes()).unwrap_or_default(),
            ephemeral_public_key: ephemeral.to_sec1_bytes(),
            timestamp: env.wall_clock_millis(),
            nonce: env.random_nonce(),
            sequence,
        }
    }

    fn expected_kind(&self) -> HandshakeKind {
        match self.role {
            Role::Initiator => HandshakeKind::Confirm,
            Role::Responder => HandshakeKind::Init,
        }
    }

    fn fetch_action(&self) -> HandshakeAction {
        HandshakeAction::Fetch {
            from: self.peer_id.clone(),
            to: self.my_id.clone(),
            kind: self.expected_kind(),
        }
    }

    fn require(&self, state: HandshakeState, operation: &'static str) -> Result<(), HandshakeError> {
        if self.state == state { Ok(()) } else { Err(self.invalid(operation)) }
    }

    fn invalid(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::InvalidState { state: self.state, operation }
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(
            conversation_id = %self.conversation_id,
            role = ?self.role,
            from = ?self.state,
            to = ?next,
            "handshake transition"
        );
        self.state = next;
    }
}

/// Draw a fresh ephemeral keypair from the environment.
pub(crate) fn generate_ephemeral<E: Environment>(env: &E) -> EphemeralKeyPair {
    loop {
        // Out-of-range scalars are astronomically rare; draw again
        if let Ok(keypair) = EphemeralKeyPair::from_random_bytes(env.random_array()) {
            return keypair;
        }
    }
}
